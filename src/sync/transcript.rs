//! Chat transcript with unread bookkeeping.
//!
//! Messages are kept in arrival order. Claimed timestamps are stored for
//! display but never used to reorder.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use super::UserId;

/// Author id used for synthesized messages
pub const SYSTEM_USER_ID: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub user_id: UserId,
    /// Name as claimed by the sender at send time
    pub user_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

impl ChatMessage {
    /// A message from a participant. A missing server id is replaced by a
    /// locally generated one.
    pub fn from_user(
        id: Option<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_id: user_id.into(),
            user_name: user_name.into(),
            message: message.into(),
            timestamp,
            kind: MessageKind::Message,
        }
    }

    pub fn system(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: SYSTEM_USER_ID.to_string(),
            user_name: "System".to_string(),
            message: message.into(),
            timestamp,
            kind: MessageKind::System,
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == MessageKind::System
    }
}

#[derive(Debug)]
pub struct Transcript {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
    local_user_id: UserId,
    panel_open: bool,
    unread: usize,
}

impl Transcript {
    pub fn new(local_user_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
            local_user_id: local_user_id.into(),
            panel_open: false,
            unread: 0,
        }
    }

    /// Append in arrival order, dropping the oldest past capacity
    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }

    pub fn mark_all_read(&mut self) {
        self.unread = 0;
    }

    /// Count a human message from someone else while the panel is closed
    pub fn increment_unread_if_hidden(&mut self, message: &ChatMessage) {
        if message.is_system() || message.user_id == self.local_user_id {
            return;
        }
        if !self.panel_open {
            self.unread += 1;
        }
    }

    /// Track panel visibility; opening the panel marks everything read
    pub fn set_panel_open(&mut self, open: bool) {
        if open && !self.panel_open {
            self.mark_all_read();
        }
        self.panel_open = open;
    }

    pub fn is_panel_open(&self) -> bool {
        self.panel_open
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
