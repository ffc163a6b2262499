//! Transport contract between the conversation store and the network
//!
//! The store consumes one trait for the pull side (history, sends, read
//! receipts) and a typed event for the push side, so it never branches on
//! which channel a message arrived through. `src/api` provides the HTTP
//! implementation; `src/push` produces the events.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Message, MessageKind, ReplyPreview};

/// One page of conversation history from the pull channel.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub chat_id: String,
    pub messages: Vec<Message>,
}

/// Outgoing message payload, before the server has assigned it an identity.
#[derive(Debug, Clone)]
pub struct Draft {
    pub content: String,
    pub kind: MessageKind,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub reply_to: Option<ReplyPreview>,
}

impl Draft {
    /// Plain text draft.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
            file_url: None,
            file_name: None,
            file_size: None,
            reply_to: None,
        }
    }
}

/// A single live-channel delivery.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub chat_id: String,
    pub message: Message,
}

/// Request/response side of the support-chat service.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Fetch conversation history. Without a chat id the server resolves the
    /// caller's own conversation.
    async fn fetch_history(&self, chat_id: Option<&str>) -> Result<HistoryPage>;

    /// Post a message. Returns the canonical message with server-assigned id
    /// and timestamp.
    async fn post_message(&self, chat_id: Option<&str>, draft: &Draft) -> Result<Message>;

    /// Mark one message read on the server.
    async fn mark_read(&self, id: &str) -> Result<()>;

    /// Mark every message in the conversation read on the server.
    async fn mark_all_read(&self) -> Result<()>;
}
