//! The duplex channel a session reads events from and writes events to.
//!
//! The channel is owned by the host application and may be shared by other
//! consumers (notifications, live progress). A session only ever adds and
//! removes its own listener and writes serialized events; it never opens,
//! closes or reconfigures the channel.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier handed out for each registered message listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(uuid::Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection state, mirroring a WebSocket's `readyState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    pub fn is_open(self) -> bool {
        self == ReadyState::Open
    }
}

/// Errors surfaced by channel implementations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel is not open")]
    NotOpen,

    #[error("Channel closed")]
    Closed,

    #[error("Connection failed: {0}")]
    Connect(String),
}

/// A shared, externally owned duplex text channel
pub trait Channel: Send + Sync {
    /// Current connection state
    fn ready_state(&self) -> ReadyState;

    /// Queue a text frame for transmission
    fn send(&self, text: String) -> Result<(), ChannelError>;

    /// Register a message listener. Every inbound text frame is delivered to
    /// every registered listener.
    fn add_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<String>);

    /// Deregister a listener. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);
}

/// Fan-out of inbound frames to any number of listeners
#[derive(Debug, Default)]
pub struct ListenerSet {
    listeners: DashMap<ListenerId, mpsc::UnboundedSender<String>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) -> (ListenerId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ListenerId::new();
        self.listeners.insert(id, tx);
        (id, rx)
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Deliver a frame to every listener, pruning listeners whose receiver
    /// has been dropped. Returns the number of listeners reached.
    pub fn deliver(&self, text: &str) -> usize {
        let mut dead = Vec::new();
        let mut reached = 0;

        for entry in self.listeners.iter() {
            if entry.value().send(text.to_string()).is_ok() {
                reached += 1;
            } else {
                dead.push(*entry.key());
            }
        }

        for id in dead {
            debug!("Pruning dropped listener {}", id);
            self.listeners.remove(&id);
        }

        reached
    }

    /// Drop every listener so their receivers observe end-of-stream
    pub fn clear(&self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// In-process channel: outbound frames are recorded, inbound frames are
/// injected by the owner with [`LoopbackChannel::deliver`].
#[derive(Debug)]
pub struct LoopbackChannel {
    state: RwLock<ReadyState>,
    sent: Mutex<Vec<String>>,
    listeners: ListenerSet,
}

impl LoopbackChannel {
    pub fn new(state: ReadyState) -> Self {
        Self {
            state: RwLock::new(state),
            sent: Mutex::new(Vec::new()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn open() -> Self {
        Self::new(ReadyState::Open)
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        *self.state.write() = state;
    }

    /// Inject an inbound frame
    pub fn deliver(&self, text: &str) -> usize {
        self.listeners.deliver(text)
    }

    /// Frames written so far, oldest first
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Mark the channel closed and end every listener's stream
    pub fn close(&self) {
        *self.state.write() = ReadyState::Closed;
        self.listeners.clear();
    }
}

impl Channel for LoopbackChannel {
    fn ready_state(&self) -> ReadyState {
        *self.state.read()
    }

    fn send(&self, text: String) -> Result<(), ChannelError> {
        if !self.ready_state().is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn add_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<String>) {
        self.listeners.add()
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}
