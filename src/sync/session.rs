//! Collaboration session for one client on one assessment form.
//!
//! A [`CollabSession`] owns the roster, the edit log and the chat transcript.
//! It is constructed with its channel and user descriptor injected, and has
//! no global state. Inbound frames go through [`CollabSession::handle_raw`],
//! which decodes fully before dispatching to exactly one component, so a bad
//! frame is dropped without touching state.
//!
//! [`SessionListener`] drives a session from a shared channel on a tokio task.
//! Dropping the listener deregisters it from the channel but leaves the
//! channel open for its other consumers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::{Channel, ListenerId};
use super::edit_log::{EditLog, FieldUpdate};
use super::presence::{Collaborator, PresenceStatus, Registry};
use super::protocol::{CollabProtocol, CursorPosition, Envelope, InboundEvent, OutboundMessage};
use super::transcript::{ChatMessage, MessageKind, Transcript};
use super::{FieldId, SyncConfig, SyncResult, UserId};

/// Descriptor of the local user, supplied by the host application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentUser {
    pub id: UserId,
    pub full_name: String,
    pub email: String,
    pub color: String,
}

impl CurrentUser {
    pub fn new(
        id: impl Into<String>,
        full_name: impl Into<String>,
        email: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            full_name: full_name.into(),
            email: email.into(),
            color: color.into(),
        }
    }
}

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Decoded and applied; carries the event type
    Applied(&'static str),
    /// Well-formed but not a type this session handles
    Ignored,
    /// Malformed and dropped
    Rejected,
}

/// Result of an outbound action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Chat text was blank after trimming
    Empty,
    /// Channel not open; the message is lost
    NotConnected,
}

/// Counters kept over the life of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub events_applied: u64,
    pub decode_failures: u64,
    pub ignored_events: u64,
    pub messages_sent: u64,
    pub sends_dropped: u64,
}

type FieldUpdateHook = Box<dyn FnMut(&FieldUpdate) + Send>;
type CursorUpdateHook = Box<dyn FnMut(&str, &CursorPosition) + Send>;

pub struct CollabSession {
    current_user: CurrentUser,
    channel: Arc<dyn Channel>,
    config: SyncConfig,
    registry: Registry,
    edits: EditLog,
    transcript: Transcript,
    draft: String,
    on_field_update: Option<FieldUpdateHook>,
    on_cursor_update: Option<CursorUpdateHook>,
    stats: SessionStats,
}

impl CollabSession {
    pub fn new(current_user: CurrentUser, channel: Arc<dyn Channel>, config: SyncConfig) -> Self {
        let edits = EditLog::new(config.edit_log_capacity);
        let transcript = Transcript::new(current_user.id.clone(), config.transcript_capacity);

        Self {
            current_user,
            channel,
            config,
            registry: Registry::new(),
            edits,
            transcript,
            draft: String::new(),
            on_field_update: None,
            on_cursor_update: None,
            stats: SessionStats::default(),
        }
    }

    /// Invoked for every applied `form_update`. Runs while the session is
    /// borrowed, so the hook must not lock a `SessionListener`'s session.
    pub fn on_field_update(&mut self, hook: impl FnMut(&FieldUpdate) + Send + 'static) {
        self.on_field_update = Some(Box::new(hook));
    }

    /// Invoked for every applied `cursor_update`. Same locking rule as
    /// [`CollabSession::on_field_update`].
    pub fn on_cursor_update(&mut self, hook: impl FnMut(&str, &CursorPosition) + Send + 'static) {
        self.on_cursor_update = Some(Box::new(hook));
    }

    pub fn channel(&self) -> Arc<dyn Channel> {
        self.channel.clone()
    }

    pub fn current_user(&self) -> &CurrentUser {
        &self.current_user
    }

    /// Decode and apply one inbound text frame. Never fails.
    pub fn handle_raw(&mut self, raw: &str) -> Dispatch {
        match CollabProtocol::decode(raw) {
            Ok(Some(envelope)) => {
                let kind = envelope.event.kind();
                self.apply(envelope);
                Dispatch::Applied(kind)
            }
            Ok(None) => {
                self.stats.ignored_events += 1;
                Dispatch::Ignored
            }
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!("Dropping malformed frame: {}", e);
                Dispatch::Rejected
            }
        }
    }

    /// Apply an already decoded event
    pub fn apply(&mut self, envelope: Envelope) {
        let timestamp = envelope.timestamp.unwrap_or_else(Utc::now);
        self.stats.events_applied += 1;

        match envelope.event {
            InboundEvent::UserJoined(joined) => {
                let announcement = self.registry.apply_join(
                    &joined.user_id,
                    &joined.user_full_name,
                    joined.user_email.as_deref(),
                    &joined.session_id,
                );
                if let Some(msg) = announcement {
                    debug!("{} joined ({})", joined.user_full_name, joined.user_id);
                    self.transcript.append(msg);
                }
            }

            InboundEvent::UserLeft(left) => {
                if let Some(msg) = self.registry.apply_leave(&left.user_id) {
                    debug!("{} left", left.user_id);
                    self.transcript.append(msg);
                }
            }

            InboundEvent::CursorUpdate(moved) => {
                self.registry
                    .apply_cursor_update(&moved.user_id, moved.cursor_position.clone());
                if let Some(hook) = self.on_cursor_update.as_mut() {
                    hook(moved.user_id.as_str(), &moved.cursor_position);
                }
            }

            InboundEvent::FormUpdate(changed) => {
                self.registry.apply_field_focus(&changed.user_id, &changed.field_id);
                let update = FieldUpdate {
                    field_id: changed.field_id,
                    field_value: changed.field_value,
                    field_type: changed.field_type,
                    user_id: changed.user_id,
                    timestamp,
                };
                if let Some(hook) = self.on_field_update.as_mut() {
                    hook(&update);
                }
                self.edits.record(update);
            }

            InboundEvent::ChatMessage(chat) => {
                self.registry.touch(&chat.user_id);
                let msg = ChatMessage::from_user(
                    chat.message_id,
                    chat.user_id,
                    chat.user_full_name,
                    chat.message,
                    timestamp,
                );
                self.transcript.increment_unread_if_hidden(&msg);
                self.transcript.append(msg);
            }

            InboundEvent::UserTyping(typing) => {
                self.registry.apply_typing(&typing.user_id, typing.is_typing);
            }
        }
    }

    /// Whether outbound actions can currently be transmitted
    pub fn is_connected(&self) -> bool {
        self.channel.ready_state().is_open()
    }

    pub fn send_cursor_update(&mut self, position: CursorPosition) -> SendOutcome {
        let field_id = position.field_id.clone();
        self.transmit(OutboundMessage::CursorUpdate {
            cursor_position: position,
            field_id,
        })
    }

    pub fn send_field_update(
        &mut self,
        field_id: impl Into<FieldId>,
        field_value: Value,
        field_type: impl Into<String>,
    ) -> SendOutcome {
        self.transmit(OutboundMessage::FormUpdate {
            field_id: field_id.into(),
            field_value,
            field_type: field_type.into(),
        })
    }

    pub fn send_typing(&mut self, is_typing: bool) -> SendOutcome {
        self.transmit(OutboundMessage::UserTyping { is_typing })
    }

    /// Send a chat message. Nothing is appended locally; the server relays
    /// the message back through the inbound stream.
    pub fn compose_and_send(&mut self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Empty;
        }

        self.transmit(OutboundMessage::ChatMessage {
            message: text.to_string(),
            user_full_name: self.current_user.full_name.clone(),
        })
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Send the chat draft. The draft is cleared whatever the outcome.
    pub fn send_draft(&mut self) -> SendOutcome {
        let text = std::mem::take(&mut self.draft);
        self.compose_and_send(&text)
    }

    fn transmit(&mut self, msg: OutboundMessage) -> SendOutcome {
        if !self.is_connected() {
            self.stats.sends_dropped += 1;
            debug!("Channel not open, dropping outbound message");
            return SendOutcome::NotConnected;
        }

        match self.encode_and_send(&msg) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                SendOutcome::Sent
            }
            Err(e) => {
                self.stats.sends_dropped += 1;
                warn!("Failed to send outbound message: {}", e);
                SendOutcome::NotConnected
            }
        }
    }

    fn encode_and_send(&self, msg: &OutboundMessage) -> SyncResult<()> {
        let text = CollabProtocol::encode(msg)?;
        self.channel.send(text)?;
        Ok(())
    }

    /// Track chat panel visibility; opening it marks all messages read
    pub fn set_chat_open(&mut self, open: bool) {
        self.transcript.set_panel_open(open);
    }

    pub fn unread_count(&self) -> usize {
        self.transcript.unread()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn edit_log(&self) -> &EditLog {
        &self.edits
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Active collaborators other than the local user
    pub fn active_collaborators(&self) -> Vec<Collaborator> {
        self.registry.list_active(Some(&self.current_user.id))
    }

    pub fn display_name_of(&self, user_id: &str) -> &str {
        match self.registry.get(user_id) {
            Some(c) if !c.is_placeholder() => c.name(),
            _ if user_id == self.current_user.id => &self.current_user.full_name,
            _ => self.registry.display_name_of(user_id),
        }
    }

    pub fn color_of(&self, user_id: &str) -> &str {
        if user_id == self.current_user.id {
            return &self.current_user.color;
        }
        self.registry.color_of(user_id)
    }

    pub fn presence_of(&self, user_id: &str) -> PresenceStatus {
        self.registry.presence_of(
            user_id,
            Utc::now(),
            self.config.idle_after,
            self.config.away_after,
        )
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Immutable view for rendering, with names and colors resolved through
    /// the registry at call time
    pub fn snapshot(&self) -> SessionSnapshot {
        let now = Utc::now();

        let collaborators = self
            .active_collaborators()
            .into_iter()
            .map(|c| CollaboratorView {
                status: c.status(now, self.config.idle_after, self.config.away_after),
                display_name: c.name().to_string(),
                user_id: c.user_id,
                color: c.color,
                current_field: c.current_field,
                cursor_position: c.cursor_position,
                is_typing: c.is_typing,
            })
            .collect();

        let recent_edits = self
            .edits
            .recent(self.edits.capacity())
            .into_iter()
            .map(|u| EditView {
                user_name: self.display_name_of(&u.user_id).to_string(),
                color: self.color_of(&u.user_id).to_string(),
                field_id: u.field_id,
                field_value: u.field_value,
                field_type: u.field_type,
                user_id: u.user_id,
                timestamp: u.timestamp,
            })
            .collect();

        let transcript = self
            .transcript
            .messages()
            .into_iter()
            .map(|m| self.chat_view(m))
            .collect();

        SessionSnapshot {
            collaborators,
            recent_edits,
            transcript,
            unread: self.transcript.unread(),
            connected: self.is_connected(),
        }
    }

    fn chat_view(&self, msg: ChatMessage) -> ChatView {
        let (user_name, color) = match msg.kind {
            MessageKind::System => (msg.user_name.clone(), None),
            MessageKind::Message => {
                let known = self
                    .registry
                    .get(&msg.user_id)
                    .filter(|c| !c.is_placeholder())
                    .is_some()
                    || msg.user_id == self.current_user.id;
                let name = if known {
                    self.display_name_of(&msg.user_id).to_string()
                } else {
                    msg.user_name.clone()
                };
                let color = self.color_of(&msg.user_id).to_string();
                (name, Some(color))
            }
        };

        ChatView {
            is_own: msg.user_id == self.current_user.id,
            id: msg.id,
            user_id: msg.user_id,
            user_name,
            color,
            message: msg.message,
            timestamp: msg.timestamp,
            kind: msg.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollaboratorView {
    pub user_id: UserId,
    pub display_name: String,
    pub color: String,
    pub status: PresenceStatus,
    pub current_field: Option<FieldId>,
    pub cursor_position: Option<CursorPosition>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditView {
    pub field_id: FieldId,
    pub field_value: Value,
    pub field_type: String,
    pub user_id: UserId,
    pub user_name: String,
    pub color: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatView {
    pub id: String,
    pub user_id: UserId,
    pub user_name: String,
    /// `None` for system messages
    pub color: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub is_own: bool,
}

/// Render-ready state of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub collaborators: Vec<CollaboratorView>,
    pub recent_edits: Vec<EditView>,
    pub transcript: Vec<ChatView>,
    pub unread: usize,
    pub connected: bool,
}

/// Feeds a session from its channel on a tokio task.
///
/// Must be created inside a tokio runtime. Dropping it (or calling
/// [`SessionListener::detach`]) removes the listener from the channel and
/// stops the task; the channel itself is left untouched.
pub struct SessionListener {
    session: Arc<Mutex<CollabSession>>,
    channel: Arc<dyn Channel>,
    listener_id: ListenerId,
    task: Option<JoinHandle<()>>,
}

impl SessionListener {
    pub fn attach(session: Arc<Mutex<CollabSession>>) -> Self {
        let channel = session.lock().channel();
        let (listener_id, mut rx) = channel.add_listener();

        let task_session = session.clone();
        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                task_session.lock().handle_raw(&text);
            }
            debug!("Listener {} stream ended", listener_id);
        });

        info!("Session listener {} attached", listener_id);

        Self {
            session,
            channel,
            listener_id,
            task: Some(task),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.listener_id
    }

    /// Wait until the channel stops delivering to this listener
    pub async fn finished(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session listener task failed: {}", e);
            }
        }
    }

    pub fn detach(self) {}
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        self.channel.remove_listener(self.listener_id);
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let stats = match self.session.try_lock() {
            Some(session) => session.stats(),
            None => return,
        };
        info!(
            "Session listener {} detached (applied={}, rejected={}, ignored={}, sent={}, dropped={})",
            self.listener_id,
            stats.events_applied,
            stats.decode_failures,
            stats.ignored_events,
            stats.messages_sent,
            stats.sends_dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::channel::{LoopbackChannel, ReadyState};
    use crate::sync::presence::{color_for, UNKNOWN_DISPLAY_NAME};
    use serde_json::json;

    fn frame(kind: &str, data: Value) -> String {
        json!({ "type": kind, "data": data, "timestamp": "2024-05-01T10:00:00Z" }).to_string()
    }

    fn join(user_id: &str, name: &str, session_id: &str) -> String {
        frame(
            "user_joined",
            json!({ "user_id": user_id, "user_full_name": name, "session_id": session_id }),
        )
    }

    fn leave(user_id: &str) -> String {
        frame("user_left", json!({ "user_id": user_id }))
    }

    fn chat(user_id: &str, name: &str, text: &str) -> String {
        frame(
            "chat_message",
            json!({ "user_id": user_id, "user_full_name": name, "message": text }),
        )
    }

    fn me() -> CurrentUser {
        CurrentUser::new("me", "Morgan Local", "morgan@example.com", "#000000")
    }

    fn session_with(channel: Arc<LoopbackChannel>) -> CollabSession {
        CollabSession::new(me(), channel, SyncConfig::default())
    }

    fn session() -> (CollabSession, Arc<LoopbackChannel>) {
        let channel = Arc::new(LoopbackChannel::open());
        (session_with(channel.clone()), channel)
    }

    #[test]
    fn test_reconnect_storm() {
        let (mut session, _channel) = session();

        session.handle_raw(&join("u1", "Alice", "s1"));
        session.handle_raw(&join("u1", "Alice", "s2"));
        session.handle_raw(&leave("u1"));
        session.handle_raw(&join("u1", "Alice", "s3"));

        assert_eq!(session.registry().len(), 1);
        let active = session.active_collaborators();
        assert_eq!(active.len(), 1);
        assert!(active[0].is_active);
        assert_eq!(active[0].session_id.as_deref(), Some("s3"));

        let system: Vec<String> = session
            .transcript()
            .messages()
            .into_iter()
            .filter(|m| m.is_system())
            .map(|m| m.message)
            .collect();
        assert_eq!(system, vec!["Alice joined", "Alice left", "Alice joined"]);
    }

    #[test]
    fn test_out_of_order_attribution() {
        let (mut session, _channel) = session();

        session.handle_raw(&frame(
            "cursor_update",
            json!({ "user_id": "u2", "cursor_position": { "x": 1, "y": 2, "fieldId": "f1" } }),
        ));
        assert_eq!(session.display_name_of("u2"), UNKNOWN_DISPLAY_NAME);

        session.handle_raw(&join("u2", "Bob", "s2"));

        assert_eq!(session.display_name_of("u2"), "Bob");
        assert_eq!(
            session.registry().get("u2").unwrap().cursor_position,
            Some(CursorPosition::new(1.0, 2.0, "f1"))
        );
    }

    #[test]
    fn test_malformed_payload_changes_nothing() {
        let (mut session, _channel) = session();
        session.handle_raw(&join("u1", "Alice", "s1"));
        let before = session.snapshot();

        assert_eq!(session.handle_raw("{{{ not json"), Dispatch::Rejected);
        assert_eq!(
            session.handle_raw(&frame("form_update", json!({ "field_id": "f1" }))),
            Dispatch::Rejected
        );

        assert_eq!(session.snapshot(), before);
        assert_eq!(session.stats().decode_failures, 2);
    }

    #[test]
    fn test_unknown_type_ignored() {
        let (mut session, _channel) = session();
        let dispatch = session.handle_raw(&frame("notification", json!({ "text": "Report ready" })));

        assert_eq!(dispatch, Dispatch::Ignored);
        assert!(session.registry().is_empty());
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn test_form_update_records_edit_and_focus() {
        let (mut session, _channel) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_field_update(move |update| sink.lock().push(update.field_id.clone()));

        let dispatch = session.handle_raw(&frame(
            "form_update",
            json!({ "field_id": "budget", "field_value": 1500, "field_type": "number", "user_id": "u1" }),
        ));

        assert_eq!(dispatch, Dispatch::Applied("form_update"));
        assert_eq!(*seen.lock(), vec!["budget".to_string()]);

        let recent = session.edit_log().recent(1);
        assert_eq!(recent[0].field_value, json!(1500));
        assert_eq!(recent[0].timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(
            session.registry().get("u1").unwrap().current_field.as_deref(),
            Some("budget")
        );
    }

    #[test]
    fn test_cursor_hook_invoked() {
        let (mut session, _channel) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_cursor_update(move |user_id, pos| {
            sink.lock().push((user_id.to_string(), pos.field_id.clone()))
        });

        session.handle_raw(&frame(
            "cursor_update",
            json!({ "user_id": "u1", "cursor_position": { "x": 0, "y": 0, "fieldId": "regions" } }),
        ));

        assert_eq!(*seen.lock(), vec![("u1".to_string(), "regions".to_string())]);
    }

    #[test]
    fn test_unread_from_others_only() {
        let (mut session, _channel) = session();

        session.handle_raw(&chat("u1", "Alice", "one"));
        session.handle_raw(&chat("u1", "Alice", "two"));
        session.handle_raw(&chat("u2", "Bob", "three"));
        session.handle_raw(&chat("me", "Morgan Local", "echo of mine"));
        assert_eq!(session.unread_count(), 3);

        session.set_chat_open(true);
        assert_eq!(session.unread_count(), 0);
        session.set_chat_open(false);
        assert_eq!(session.unread_count(), 0);
        assert_eq!(session.transcript().len(), 4);
    }

    #[test]
    fn test_compose_and_send_does_not_echo() {
        let (mut session, channel) = session();

        assert_eq!(session.compose_and_send("  hello team  "), SendOutcome::Sent);

        let sent: Value = serde_json::from_str(&channel.sent()[0]).unwrap();
        assert_eq!(
            sent,
            json!({ "type": "chat_message", "message": "hello team", "user_full_name": "Morgan Local" })
        );
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn test_empty_message_send_rejection() {
        let (mut session, channel) = session();

        assert_eq!(session.compose_and_send("   "), SendOutcome::Empty);
        assert!(channel.sent().is_empty());
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn test_send_on_closed_channel_is_noop() {
        let channel = Arc::new(LoopbackChannel::new(ReadyState::Closed));
        let mut session = session_with(channel.clone());
        session.set_draft("are you there?");

        assert!(!session.is_connected());
        assert_eq!(session.send_draft(), SendOutcome::NotConnected);
        assert_eq!(session.draft(), "");
        assert!(channel.sent().is_empty());
        assert_eq!(session.stats().sends_dropped, 1);
    }

    #[test]
    fn test_outbound_cursor_and_field_updates() {
        let (mut session, channel) = session();

        session.send_cursor_update(CursorPosition::new(10.0, 20.0, "budget"));
        session.send_field_update("budget", json!(900), "number");
        session.send_typing(true);

        let sent: Vec<Value> = channel
            .sent()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect();
        assert_eq!(sent[0]["type"], "cursor_update");
        assert_eq!(sent[0]["field_id"], "budget");
        assert_eq!(sent[0]["cursor_position"]["fieldId"], "budget");
        assert_eq!(sent[1]["type"], "form_update");
        assert_eq!(sent[1]["field_value"], 900);
        assert_eq!(sent[2], json!({ "type": "user_typing", "is_typing": true }));
        assert_eq!(session.stats().messages_sent, 3);
    }

    #[test]
    fn test_snapshot_resolves_names_late() {
        let (mut session, _channel) = session();

        session.handle_raw(&frame(
            "form_update",
            json!({ "field_id": "f1", "field_value": "x", "field_type": "text", "user_id": "u2" }),
        ));
        assert_eq!(session.snapshot().recent_edits[0].user_name, UNKNOWN_DISPLAY_NAME);

        session.handle_raw(&join("u2", "Bob", "s2"));
        let snapshot = session.snapshot();

        assert_eq!(snapshot.recent_edits[0].user_name, "Bob");
        assert_eq!(snapshot.collaborators.len(), 1);
        assert_eq!(snapshot.collaborators[0].display_name, "Bob");
        assert_eq!(snapshot.collaborators[0].status, PresenceStatus::Active);
        assert!(snapshot.connected);
    }

    #[test]
    fn test_typing_before_join_creates_placeholder() {
        let (mut session, _channel) = session();

        let dispatch =
            session.handle_raw(&frame("user_typing", json!({ "user_id": "u4", "is_typing": true })));

        assert_eq!(dispatch, Dispatch::Applied("user_typing"));
        let placeholder = session.registry().get("u4").unwrap();
        assert!(placeholder.is_placeholder());
        assert!(!placeholder.is_active);
        assert!(placeholder.is_typing);
        assert!(session.active_collaborators().is_empty());

        session.handle_raw(&join("u4", "Dana", "s4"));

        let dana = session.registry().get("u4").unwrap();
        assert!(dana.is_active);
        assert!(dana.is_typing);
        assert_eq!(session.registry().len(), 1);

        session.handle_raw(&frame("user_typing", json!({ "user_id": "u4", "is_typing": false })));
        assert!(!session.registry().get("u4").unwrap().is_typing);
    }

    #[test]
    fn test_chat_color_stable_across_late_join() {
        let (mut session, _channel) = session();

        session.handle_raw(&chat("u3", "Carol", "early"));
        let before = session.snapshot().transcript[0].color.clone();

        session.handle_raw(&join("u3", "Carol", "s3"));
        let after = session.snapshot().transcript[0].color.clone();

        assert_eq!(before.as_deref(), Some(color_for("u3")));
        assert_eq!(before, after);
    }

    #[test]
    fn test_local_user_excluded_and_colored_from_descriptor() {
        let (mut session, _channel) = session();
        session.handle_raw(&join("me", "Morgan Local", "s0"));
        session.handle_raw(&join("u1", "Alice", "s1"));
        session.handle_raw(&chat("me", "Morgan Local", "hi"));

        let active = session.active_collaborators();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, "u1");
        assert_eq!(session.color_of("me"), "#000000");

        let snapshot = session.snapshot();
        let own = snapshot.transcript.last().unwrap();
        assert!(own.is_own);
        assert_eq!(own.color.as_deref(), Some("#000000"));
    }

    #[tokio::test]
    async fn test_listener_applies_channel_frames() {
        let channel = Arc::new(LoopbackChannel::open());
        let session = Arc::new(Mutex::new(session_with(channel.clone())));
        let listener = SessionListener::attach(session.clone());

        channel.deliver(&join("u1", "Alice", "s1"));
        channel.deliver("garbage");
        channel.deliver(&chat("u1", "Alice", "hello"));
        channel.close();
        listener.finished().await;

        let session = session.lock();
        assert_eq!(session.active_collaborators().len(), 1);
        assert_eq!(session.transcript().len(), 2);
        assert_eq!(session.unread_count(), 1);
        assert_eq!(session.stats().decode_failures, 1);
    }

    #[tokio::test]
    async fn test_detach_keeps_channel_open_for_other_consumers() {
        let channel = Arc::new(LoopbackChannel::open());
        let session = Arc::new(Mutex::new(session_with(channel.clone())));
        let (_other, mut other_rx) = channel.add_listener();

        let listener = SessionListener::attach(session.clone());
        assert_eq!(channel.listener_count(), 2);

        listener.detach();

        assert_eq!(channel.listener_count(), 1);
        assert!(channel.ready_state().is_open());
        assert_eq!(channel.deliver(&join("u1", "Alice", "s1")), 1);
        assert!(other_rx.recv().await.is_some());
        assert!(session.lock().registry().is_empty());
    }
}
