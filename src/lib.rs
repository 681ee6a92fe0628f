//! Live collaboration client for cloud assessment questionnaires.
//!
//! A browser-side (or headless) participant in a shared assessment form keeps
//! a roster of collaborators, a feed of remote field edits and a chat
//! transcript, all reconstructed from an unordered stream of JSON events on a
//! shared WebSocket channel.

pub mod config;
pub mod sync;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use sync::{
    Channel, ChannelError, CollabSession, CurrentUser, LoopbackChannel, ReadyState,
    SessionListener, SessionSnapshot, SyncConfig, SyncError,
};
pub use transport::WsChannel;
