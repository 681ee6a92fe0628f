//! Roster of collaborators on a shared assessment form.
//!
//! This module handles presence state derived from channel events:
//! - Join/leave lifecycle with in-place updates on reconnect
//! - Cursor positions and focused fields
//! - Typing indicators
//! - Deterministic per-user colors
//!
//! Every apply operation accepts any input. Events for users that have not
//! joined yet create a placeholder record that a later join fills in, so no
//! ordering between event types is assumed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::protocol::CursorPosition;
use super::transcript::ChatMessage;
use super::{FieldId, SessionId, UserId};

/// Name rendered for users the registry has no name for
pub const UNKNOWN_DISPLAY_NAME: &str = "Someone";

const PALETTE: [&str; 14] = [
    "#3b82f6", // blue
    "#ef4444", // red
    "#22c55e", // green
    "#f59e0b", // amber
    "#8b5cf6", // violet
    "#ec4899", // pink
    "#06b6d4", // cyan
    "#f97316", // orange
    "#14b8a6", // teal
    "#a855f7", // purple
    "#84cc16", // lime
    "#6366f1", // indigo
    "#d946ef", // fuchsia
    "#0ea5e9", // sky
];

/// Palette color for a user id. Pure function of the id.
pub fn color_for(user_id: &str) -> &'static str {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let idx = u64::from_be_bytes(prefix) % PALETTE.len() as u64;
    PALETTE[idx as usize]
}

/// Presence status for a collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Recent activity
    Active,
    /// No activity for a while
    Idle,
    /// Extended inactivity
    Away,
    /// Left, or never joined
    Offline,
}

/// One remote participant, current or past
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collaborator {
    pub user_id: UserId,
    /// `None` until a join event names the user
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub color: String,
    pub session_id: Option<SessionId>,
    pub is_active: bool,
    pub last_seen: DateTime<Utc>,
    pub current_field: Option<FieldId>,
    pub cursor_position: Option<CursorPosition>,
    pub is_typing: bool,
}

impl Collaborator {
    fn placeholder(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: None,
            email: None,
            color: color_for(user_id).to_string(),
            session_id: None,
            is_active: false,
            last_seen: now,
            current_field: None,
            cursor_position: None,
            is_typing: false,
        }
    }

    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(UNKNOWN_DISPLAY_NAME)
    }

    /// True while the record only exists because of activity seen before a join
    pub fn is_placeholder(&self) -> bool {
        self.display_name.is_none()
    }

    /// Status derived from the active flag and time since last activity
    pub fn status(&self, now: DateTime<Utc>, idle_after: Duration, away_after: Duration) -> PresenceStatus {
        if !self.is_active {
            return PresenceStatus::Offline;
        }

        let elapsed = (now - self.last_seen).to_std().unwrap_or_default();
        if elapsed > away_after {
            PresenceStatus::Away
        } else if elapsed > idle_after {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Active
        }
    }
}

/// Registry of collaborators, kept in first-seen order
#[derive(Debug, Default)]
pub struct Registry {
    collaborators: Vec<Collaborator>,
    index: HashMap<UserId, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_mut(&mut self, user_id: &str) -> Option<&mut Collaborator> {
        let idx = *self.index.get(user_id)?;
        self.collaborators.get_mut(idx)
    }

    fn get_or_insert(&mut self, user_id: &str, now: DateTime<Utc>) -> &mut Collaborator {
        let idx = match self.index.get(user_id) {
            Some(idx) => *idx,
            None => {
                debug!("Creating placeholder collaborator {}", user_id);
                self.collaborators.push(Collaborator::placeholder(user_id, now));
                let idx = self.collaborators.len() - 1;
                self.index.insert(user_id.to_string(), idx);
                idx
            }
        };
        &mut self.collaborators[idx]
    }

    /// Apply a join. Returns the system announcement when the user was not
    /// already active; a repeated join refreshes the record silently.
    pub fn apply_join(
        &mut self,
        user_id: &str,
        display_name: &str,
        email: Option<&str>,
        session_id: &str,
    ) -> Option<ChatMessage> {
        let now = Utc::now();
        let collaborator = self.get_or_insert(user_id, now);
        let was_active = collaborator.is_active;

        collaborator.display_name = Some(display_name.to_string());
        if let Some(email) = email {
            collaborator.email = Some(email.to_string());
        }
        collaborator.session_id = Some(session_id.to_string());
        collaborator.is_active = true;
        collaborator.last_seen = now;

        if was_active {
            debug!("Duplicate join for {} (session {})", user_id, session_id);
            return None;
        }

        Some(ChatMessage::system(format!("{} joined", display_name), now))
    }

    /// Apply a leave. Unknown users are ignored and produce no announcement.
    pub fn apply_leave(&mut self, user_id: &str) -> Option<ChatMessage> {
        let now = Utc::now();
        let collaborator = match self.get_mut(user_id) {
            Some(c) => c,
            None => {
                debug!("Leave for unknown collaborator {}", user_id);
                return None;
            }
        };

        let was_active = collaborator.is_active;
        collaborator.is_active = false;
        collaborator.is_typing = false;
        collaborator.last_seen = now;

        if !was_active {
            return None;
        }

        Some(ChatMessage::system(format!("{} left", collaborator.name()), now))
    }

    pub fn apply_cursor_update(&mut self, user_id: &str, position: CursorPosition) {
        let now = Utc::now();
        let collaborator = self.get_or_insert(user_id, now);
        collaborator.cursor_position = Some(position);
        collaborator.last_seen = now;
    }

    pub fn apply_field_focus(&mut self, user_id: &str, field_id: &str) {
        let now = Utc::now();
        let collaborator = self.get_or_insert(user_id, now);
        collaborator.current_field = Some(field_id.to_string());
        collaborator.last_seen = now;
    }

    pub fn apply_typing(&mut self, user_id: &str, is_typing: bool) {
        let now = Utc::now();
        let collaborator = self.get_or_insert(user_id, now);
        collaborator.is_typing = is_typing;
        collaborator.last_seen = now;
    }

    /// Refresh `last_seen` for a known user
    pub fn touch(&mut self, user_id: &str) {
        if let Some(collaborator) = self.get_mut(user_id) {
            collaborator.last_seen = Utc::now();
        }
    }

    /// Active collaborators in first-seen order, optionally excluding one id
    pub fn list_active(&self, excluding: Option<&str>) -> Vec<Collaborator> {
        self.collaborators
            .iter()
            .filter(|c| c.is_active && Some(c.user_id.as_str()) != excluding)
            .cloned()
            .collect()
    }

    /// Every record, including inactive and placeholder ones
    pub fn all(&self) -> &[Collaborator] {
        &self.collaborators
    }

    pub fn get(&self, user_id: &str) -> Option<&Collaborator> {
        self.index.get(user_id).map(|idx| &self.collaborators[*idx])
    }

    /// Color for a user, seen or not. Unknown ids get their palette color.
    pub fn color_of(&self, user_id: &str) -> &str {
        self.get(user_id)
            .map(|c| c.color.as_str())
            .unwrap_or_else(|| color_for(user_id))
    }

    pub fn display_name_of(&self, user_id: &str) -> &str {
        self.get(user_id)
            .map(Collaborator::name)
            .unwrap_or(UNKNOWN_DISPLAY_NAME)
    }

    /// Cursors of active collaborators positioned in a field
    pub fn cursors_in_field(&self, field_id: &str) -> Vec<(UserId, CursorPosition)> {
        self.collaborators
            .iter()
            .filter(|c| c.is_active)
            .filter_map(|c| {
                c.cursor_position
                    .as_ref()
                    .filter(|pos| pos.field_id == field_id)
                    .map(|pos| (c.user_id.clone(), pos.clone()))
            })
            .collect()
    }

    pub fn presence_of(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        idle_after: Duration,
        away_after: Duration,
    ) -> PresenceStatus {
        self.get(user_id)
            .map(|c| c.status(now, idle_after, away_after))
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }
}
