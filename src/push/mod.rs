//! Live delivery channel for support-chat messages
//!
//! Maintains the push WebSocket with automatic reconnection and surfaces
//! incoming messages as typed events plus a watchable connection state. The
//! store consumes the events through the same merge path as history pages,
//! so duplicate or out-of-order deliveries here are harmless.

mod socket;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::api::chat::WireMessage;
use crate::config::Config;
use crate::transport::PushEvent;
use socket::ChatSocket;

/// Reconnect backoff cap.
const MAX_BACKOFF_SECS: u64 = 64;

/// A session that stayed up this long resets the backoff to 1s.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Heartbeat interval; keeps intermediaries from idling the socket out.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connection state of the push channel.
///
/// Drops go `Connected -> Connecting` (the reconnect loop keeps trying);
/// `Disconnected` only before the first `connect` and after shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Identity needed to attach the push channel.
#[derive(Debug, Clone)]
pub struct PushIdentity {
    pub push_url: String,
    pub token: String,
    pub device_id: String,
}

impl PushIdentity {
    pub fn from_config(config: &Config) -> Result<Self> {
        let token = config
            .api_token
            .clone()
            .context("No API token. Run 'shopchat-cli login' first.")?;
        let device_id = config
            .device_id
            .clone()
            .context("No device id stored. Run 'shopchat-cli login' first.")?;

        Ok(Self {
            push_url: config.push_url(),
            token,
            device_id,
        })
    }

    fn ws_url(&self) -> String {
        format!(
            "{}?token={}&deviceId={}",
            self.push_url, self.token, self.device_id
        )
    }
}

/// Handle to the push channel.
///
/// `connect` is idempotent: calling it while the connection task is alive is
/// a no-op. The channel is single-use; after `shutdown` it cannot be
/// reconnected.
pub struct PushChannel {
    identity: PushIdentity,
    events_tx: mpsc::Sender<PushEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Option<mpsc::Receiver<String>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PushChannel {
    /// Create the channel and the event stream its sessions will feed.
    pub fn new(identity: PushIdentity) -> (Self, mpsc::Receiver<PushEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);

        let channel = Self {
            identity,
            events_tx,
            state_tx: Arc::new(state_tx),
            state_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            shutdown_tx: None,
            task: None,
        };

        (channel, events_rx)
    }

    /// Start the connection task.
    pub fn connect(&mut self) {
        if let Some(ref task) = self.task {
            if !task.is_finished() {
                tracing::debug!("Push channel already running, connect is a no-op");
                return;
            }
        }

        let Some(outbound_rx) = self.outbound_rx.take() else {
            tracing::warn!("Push channel was shut down, cannot reconnect");
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            self.identity.clone(),
            self.events_tx.clone(),
            Arc::clone(&self.state_tx),
            outbound_rx,
            shutdown_rx,
        ));

        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Send a message over the live channel (equivalent of the POST
    /// endpoint). Fails fast when the channel is not connected; nothing is
    /// queued for later.
    pub async fn send(&self, chat_id: &str, payload: serde_json::Value) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            bail!("Push channel is not connected; message not sent");
        }

        let frame = serde_json::json!({ "chatId": chat_id, "message": payload }).to_string();
        self.outbound_tx
            .send(frame)
            .await
            .context("Push channel connection task is gone")
    }

    /// Stop the connection task and wait for it to exit.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Next reconnect delay after a failed attempt.
fn next_backoff(current: u64) -> u64 {
    (current * 2).min(MAX_BACKOFF_SECS)
}

enum SessionEnd {
    /// Clean shutdown requested. Do not reconnect.
    Shutdown,
    /// Error or server-initiated close. Should reconnect.
    Dropped { stable: bool, err: anyhow::Error },
}

/// Run the push connection with automatic reconnection.
///
/// On transient errors or server-initiated disconnects, reconnects with
/// exponential backoff (1s, 2s, 4s, ... capped at 64s). A session that was
/// stable for a while resets the backoff before reconnecting.
async fn run(
    identity: PushIdentity,
    events_tx: mpsc::Sender<PushEvent>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = 1u64;

    loop {
        let _ = state_tx.send(ConnectionState::Connecting);

        match run_session(
            &identity,
            &events_tx,
            &state_tx,
            &mut outbound_rx,
            &mut shutdown_rx,
        )
        .await
        {
            SessionEnd::Shutdown => {
                let _ = state_tx.send(ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Dropped { stable, err } => {
                if stable {
                    backoff = 1;
                }
                tracing::warn!(
                    "Push channel disconnected: {:#}. Reconnecting in {}s...",
                    err,
                    backoff
                );
                let _ = state_tx.send(ConnectionState::Connecting);

                tokio::select! {
                    _ = time::sleep(Duration::from_secs(backoff)) => {}
                    _ = shutdown_rx.changed() => {
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        return;
                    }
                }

                backoff = next_backoff(backoff);
            }
        }
    }
}

/// Run one full push session: connect, then pump frames until something
/// breaks the connection or shutdown is requested.
async fn run_session(
    identity: &PushIdentity,
    events_tx: &mpsc::Sender<PushEvent>,
    state_tx: &watch::Sender<ConnectionState>,
    outbound_rx: &mut mpsc::Receiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut socket = match ChatSocket::connect(&identity.ws_url()).await {
        Ok(socket) => socket,
        Err(err) => return SessionEnd::Dropped { stable: false, err },
    };

    let _ = state_tx.send(ConnectionState::Connected);
    let connected_at = Instant::now();

    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // skip first immediate tick

    // None = clean shutdown, Some(err) = dropped connection.
    let end: Option<anyhow::Error> = loop {
        tokio::select! {
            frame = socket.recv_text() => {
                match frame {
                    Ok(Some(text)) => {
                        let Some(event) = parse_push_event(&text) else {
                            continue;
                        };
                        if events_tx.send(event).await.is_err() {
                            // Consumer is gone; stop quietly.
                            break None;
                        }
                    }
                    Ok(None) => {
                        break Some(anyhow::anyhow!("WebSocket closed by server"));
                    }
                    Err(e) => {
                        break Some(e.context("WebSocket recv error"));
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = socket.send_ping().await {
                    break Some(e.context("Heartbeat send failed"));
                }
            }
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = socket.send_text(&frame).await {
                    break Some(e.context("Live send failed"));
                }
            }
            _ = shutdown_rx.changed() => {
                break None;
            }
        }
    };

    match end {
        None => SessionEnd::Shutdown,
        Some(err) => SessionEnd::Dropped {
            stable: connected_at.elapsed() >= STABILITY_THRESHOLD,
            err,
        },
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePushEvent {
    chat_id: Option<String>,
    message: Option<WireMessage>,
}

/// Parse an incoming push frame into a typed event.
///
/// Malformed frames are logged and dropped; they must never take down the
/// event loop, or every later delivery on this socket would be lost with
/// them.
fn parse_push_event(text: &str) -> Option<PushEvent> {
    let wire: WirePushEvent = match serde_json::from_str(text) {
        Ok(wire) => wire,
        Err(e) => {
            tracing::warn!("Dropping malformed push frame: {:#}", e);
            return None;
        }
    };

    let message = match wire.message.and_then(WireMessage::into_message) {
        Some(message) => message,
        None => {
            tracing::warn!("Dropping push frame without a usable message");
            return None;
        }
    };

    let chat_id = wire
        .chat_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| message.chat_id.clone());

    Some(PushEvent { chat_id, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageId, MessageStatus};

    #[test]
    fn test_parse_push_event() {
        let event = parse_push_event(
            r#"{
                "chatId": "chat-1",
                "message": {
                    "id": "srv-9",
                    "chatId": "chat-1",
                    "senderId": "agent-7",
                    "senderName": "Dana",
                    "senderRole": "support-agent",
                    "content": "on it",
                    "type": "text",
                    "timestamp": "2024-05-03T10:15:00Z",
                    "status": "sent"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(event.chat_id, "chat-1");
        assert_eq!(event.message.id, MessageId::Canonical("srv-9".into()));
        assert_eq!(event.message.status, MessageStatus::Sent);
    }

    #[test]
    fn test_parse_push_event_chat_id_falls_back_to_message() {
        let event = parse_push_event(
            r#"{
                "message": {
                    "id": "srv-9",
                    "chatId": "chat-2",
                    "timestamp": "2024-05-03T10:15:00Z"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(event.chat_id, "chat-2");
    }

    #[test]
    fn test_parse_push_event_drops_garbage() {
        assert!(parse_push_event("not json").is_none());
        assert!(parse_push_event("{}").is_none());
        assert!(parse_push_event(r#"{"chatId": "chat-1"}"#).is_none());
        // Message present but missing its id.
        assert!(parse_push_event(
            r#"{"chatId": "chat-1", "message": {"content": "x", "timestamp": "2024-05-03T10:15:00Z"}}"#
        )
        .is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = 1u64;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff);
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 64, 64]);
    }

    #[test]
    fn test_connection_state_default() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
    }
}
