//! collab-tail - headless participant in a live assessment session
//!
//! Usage:
//! - `collab-tail` joins `COLLAB_WS_URL`, logs collaborator activity and sends
//!   each stdin line as a chat message (`/who`, `/open`, `/close`,
//!   `/set <field> <json>` are local commands)
//! - `collab-tail replay <file>` applies a file of JSON frames, one per line,
//!   and prints the resulting session snapshot as JSON

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use assessment_collab::sync::presence::color_for;
use assessment_collab::sync::session::SendOutcome;
use assessment_collab::{
    ClientConfig, CollabSession, CurrentUser, LoopbackChannel, SessionListener, SessionSnapshot,
    SyncConfig, WsChannel,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "assessment_collab=info,collab_tail=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None => run_live().await,
        Some("replay") => {
            let path = args.get(1).context("usage: collab-tail replay <file>")?;
            run_replay(path).await
        }
        Some(other) => bail!("unknown command: {}", other),
    }
}

async fn run_live() -> Result<()> {
    let config = ClientConfig::from_env()?;
    let channel = WsChannel::connect(&config.ws_url)
        .await
        .with_context(|| format!("failed to connect to {}", config.ws_url))?;

    let mut session = CollabSession::new(config.user.clone(), channel.clone(), config.sync.clone());
    session.on_field_update(|update| {
        info!(
            "{} set {} = {} ({})",
            update.user_id, update.field_id, update.field_value, update.field_type
        );
    });
    session.on_cursor_update(|user_id, position| {
        debug!(
            "{} cursor at ({}, {}) in {}",
            user_id, position.x, position.y, position.field_id
        );
    });

    let session = Arc::new(Mutex::new(session));
    let listener = SessionListener::attach(session.clone());

    info!(
        "Joined as {} ({}); type to chat, /who for the roster",
        config.user.full_name, config.user.id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) => handle_line(&session, &line),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    listener.detach();
    channel.close();

    print_summary(&session.lock().snapshot());
    Ok(())
}

fn handle_line(session: &Mutex<CollabSession>, line: &str) {
    let mut session = session.lock();
    let mut parts = line.trim().splitn(3, ' ');

    match parts.next() {
        Some("/who") => {
            for c in session.snapshot().collaborators {
                println!(
                    "{} {:?} {}{}",
                    c.display_name,
                    c.status,
                    c.current_field.as_deref().unwrap_or("-"),
                    if c.is_typing { " (typing)" } else { "" }
                );
            }
        }
        Some("/open") => {
            session.set_chat_open(true);
            for msg in session.snapshot().transcript {
                println!("[{}] {}: {}", msg.timestamp.format("%H:%M:%S"), msg.user_name, msg.message);
            }
        }
        Some("/close") => session.set_chat_open(false),
        Some("/set") => {
            let (Some(field_id), Some(raw)) = (parts.next(), parts.next()) else {
                warn!("usage: /set <field> <json>");
                return;
            };
            let value: Value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            let field_type = field_type_of(&value);
            report(session.send_field_update(field_id, value, field_type));
        }
        _ => {
            session.set_draft(line);
            report(session.send_draft());
        }
    }
}

fn field_type_of(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "checkbox",
        Value::Number(_) => "number",
        Value::Array(_) => "multiselect",
        Value::Object(_) => "object",
        _ => "text",
    }
}

fn report(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Sent => {}
        SendOutcome::Empty => debug!("Nothing to send"),
        SendOutcome::NotConnected => warn!("Not connected; message dropped"),
    }
}

async fn run_replay(path: &str) -> Result<()> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path))?;

    let user_id = std::env::var("COLLAB_USER_ID").unwrap_or_else(|_| "replay".to_string());
    let user = CurrentUser::new(user_id.clone(), "Replay", "", color_for(&user_id));

    let channel = Arc::new(LoopbackChannel::open());
    let session = Arc::new(Mutex::new(CollabSession::new(
        user,
        channel.clone(),
        SyncConfig::default(),
    )));
    let listener = SessionListener::attach(session.clone());

    let mut delivered = 0;
    for frame in contents.lines().filter(|l| !l.trim().is_empty()) {
        channel.deliver(frame);
        delivered += 1;
    }
    channel.close();
    listener.finished().await;

    info!("Replayed {} frames from {}", delivered, path);

    let session = session.lock();
    let stats = session.stats();
    info!(
        "applied={} rejected={} ignored={}",
        stats.events_applied, stats.decode_failures, stats.ignored_events
    );
    println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
    Ok(())
}

fn print_summary(snapshot: &SessionSnapshot) {
    println!(
        "{} active collaborators, {} recent edits, {} messages ({} unread)",
        snapshot.collaborators.len(),
        snapshot.recent_edits.len(),
        snapshot.transcript.len(),
        snapshot.unread
    );
}
