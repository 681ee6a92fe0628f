//! WebSocket implementation of the collaboration [`Channel`].
//!
//! The host application owns a [`WsChannel`] and may hand it to any number of
//! consumers. The socket is split into a writer task fed from an unbounded
//! queue and a reader task that fans text frames out to every listener.

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::sync::channel::{Channel, ChannelError, ListenerId, ListenerSet, ReadyState};

pub struct WsChannel {
    state: Arc<RwLock<ReadyState>>,
    outbound: mpsc::UnboundedSender<String>,
    listeners: Arc<ListenerSet>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsChannel {
    /// Connect to a WebSocket endpoint
    pub async fn connect(url: &str) -> Result<Arc<Self>, ChannelError> {
        info!("Connecting to {}", url);

        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let state = Arc::new(RwLock::new(ReadyState::Open));
        let listeners = Arc::new(ListenerSet::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // Task to forward queued frames to the socket
        let send_state = state.clone();
        let send_task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    warn!("WebSocket send failed: {}", e);
                    break;
                }
            }
            *send_state.write() = ReadyState::Closed;
            debug!("Send task ended");
        });

        // Task to fan incoming text frames out to listeners
        let recv_state = state.clone();
        let recv_listeners = listeners.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        recv_listeners.deliver(&text);
                    }
                    Ok(Message::Close(_)) => {
                        info!("WebSocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket receive failed: {}", e);
                        break;
                    }
                }
            }
            *recv_state.write() = ReadyState::Closed;
            recv_listeners.clear();
            debug!("Receive task ended");
        });

        info!("Connected to {}", url);

        Ok(Arc::new(Self {
            state,
            outbound: tx,
            listeners,
            tasks: Mutex::new(vec![send_task, recv_task]),
        }))
    }

    /// Shut the connection down. Only the owner of the channel calls this.
    pub fn close(&self) {
        *self.state.write() = ReadyState::Closing;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.listeners.clear();
        *self.state.write() = ReadyState::Closed;
        info!("WebSocket channel closed");
    }
}

impl Channel for WsChannel {
    fn ready_state(&self) -> ReadyState {
        *self.state.read()
    }

    fn send(&self, text: String) -> Result<(), ChannelError> {
        if !self.ready_state().is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.outbound.send(text).map_err(|_| ChannelError::Closed)
    }

    fn add_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<String>) {
        self.listeners.add()
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let result = WsChannel::connect("ws://127.0.0.1:1/unreachable").await;
        assert!(matches!(result, Err(ChannelError::Connect(_))));
    }

    #[tokio::test]
    async fn test_send_receive_and_server_close() {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let received = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text("hello".to_string())).await.unwrap();
            ws.close(None).await.unwrap();
            received
        });

        let channel = WsChannel::connect(&format!("ws://{}", addr)).await.unwrap();
        assert_eq!(channel.ready_state(), ReadyState::Open);

        let (_id, mut rx) = channel.add_listener();
        channel.send("out".to_string()).unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(peer.await.unwrap(), Message::Text("out".to_string()));

        assert!(rx.recv().await.is_none());
        assert_eq!(channel.ready_state(), ReadyState::Closed);
        assert!(matches!(
            channel.send("late".to_string()),
            Err(ChannelError::NotOpen)
        ));
    }
}
