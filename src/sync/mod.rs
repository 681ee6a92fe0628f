//! Client-side synchronization for live assessment collaboration.
//!
//! This module holds the state a single browser-side session keeps about a
//! shared assessment form:
//! - Roster of collaborators with presence and cursors
//! - Bounded feed of remote field edits
//! - Chat transcript with unread bookkeeping
//! - JSON event protocol shared with the broadcast server

pub mod channel;
pub mod edit_log;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transcript;

pub use channel::{Channel, ChannelError, ListenerId, LoopbackChannel, ReadyState};
pub use session::{CollabSession, CurrentUser, SessionListener, SessionSnapshot};

use std::time::Duration;

/// Stable identifier for a participant
pub type UserId = String;

/// Identifier for a form field
pub type FieldId = String;

/// Identifier for one connection instance of a participant
pub type SessionId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while talking to the collaboration channel
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Inbound or outbound payload could not be encoded/decoded
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
    /// Channel refused the write
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Tunables for a collaboration session
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum entries kept in the edit log
    pub edit_log_capacity: usize,
    /// Maximum messages kept in the chat transcript
    pub transcript_capacity: usize,
    /// Inactivity after which an active collaborator shows as idle
    pub idle_after: Duration,
    /// Inactivity after which an active collaborator shows as away
    pub away_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            edit_log_capacity: 50,
            transcript_capacity: 100,
            idle_after: Duration::from_secs(60),
            away_after: Duration::from_secs(300),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_edit_log_capacity(mut self, capacity: usize) -> Self {
        self.edit_log_capacity = capacity;
        self
    }

    pub fn with_transcript_capacity(mut self, capacity: usize) -> Self {
        self.transcript_capacity = capacity;
        self
    }

    pub fn with_idle_after(mut self, idle_after: Duration) -> Self {
        self.idle_after = idle_after;
        self
    }

    pub fn with_away_after(mut self, away_after: Duration) -> Self {
        self.away_after = away_after;
        self
    }
}
