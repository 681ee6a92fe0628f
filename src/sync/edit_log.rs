//! Bounded feed of remote field edits, most recent first.
//!
//! This is an activity feed, not a projection of current form state: two
//! edits to the same field both appear.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

use super::{FieldId, UserId};

/// One field change as received from the channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldUpdate {
    pub field_id: FieldId,
    /// Opaque payload; its shape depends on `field_type`
    pub field_value: Value,
    pub field_type: String,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct EditLog {
    entries: VecDeque<FieldUpdate>,
    capacity: usize,
}

impl EditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend an update, evicting the oldest entries past capacity
    pub fn record(&mut self, update: FieldUpdate) {
        self.entries.push_front(update);
        self.entries.truncate(self.capacity);
    }

    /// Up to `n` entries, most recent first
    pub fn recent(&self, n: usize) -> Vec<FieldUpdate> {
        self.entries.iter().take(n).cloned().collect()
    }

    /// Entries for one field, most recent first
    pub fn for_field(&self, field_id: &str) -> Vec<FieldUpdate> {
        self.entries
            .iter()
            .filter(|u| u.field_id == field_id)
            .cloned()
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
