//! Push-channel WebSocket connection and frame handling

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct ChatSocket {
    stream: WsStream,
}

impl ChatSocket {
    /// Connect to the live delivery endpoint.
    ///
    /// Auth is carried in the URL query (token + device id, obtained at
    /// login); no auth headers or messages are needed on the WebSocket
    /// itself.
    pub async fn connect(url: &str) -> Result<Self> {
        let ws_url = url
            .replace("https://", "wss://")
            .replace("http://", "ws://");

        // The query string carries the token; keep it out of the logs.
        let display_url = ws_url.split('?').next().unwrap_or(&ws_url);
        tracing::info!("Connecting WebSocket to {}", display_url);

        let (stream, response) = connect_async(&ws_url)
            .await
            .context("WebSocket connection failed")?;

        tracing::info!("WebSocket connected (status={})", response.status());

        Ok(Self { stream })
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, msg: &str) -> Result<()> {
        tracing::debug!("WS send: {}", msg);
        self.stream
            .send(Message::Text(msg.to_string()))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Send a ping frame (heartbeat).
    pub async fn send_ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .context("Failed to send ping")
    }

    /// Receive the next text frame, answering pings along the way.
    ///
    /// Returns `Ok(None)` when the server closes the connection.
    pub async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }
}
