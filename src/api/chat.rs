//! Support-chat REST endpoints
//!
//! Wire DTOs are deliberately loose (everything optional, enums as strings)
//! so one malformed entry never fails a whole history page; entries without
//! an id or timestamp are skipped during conversion.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::client::ApiClient;
use crate::models::{Message, MessageId, MessageKind, MessageStatus, ReplyPreview, SenderRole};
use crate::transport::{ChatTransport, Draft, HistoryPage};

// -- Response types for the support-chat API --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    chat_id: Option<String>,
    messages: Option<Vec<WireMessage>>,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    message: Option<WireMessage>,
}

/// Message as it appears on the wire (history, post response, push events).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireMessage {
    id: Option<String>,
    chat_id: Option<String>,
    sender_id: Option<String>,
    sender_name: Option<String>,
    sender_role: Option<String>,
    content: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    file_url: Option<String>,
    file_name: Option<String>,
    file_size: Option<u64>,
    timestamp: Option<DateTime<Utc>>,
    status: Option<String>,
    reply_to: Option<ReplyPreview>,
}

impl WireMessage {
    /// Convert to a domain message. Returns `None` when the entry lacks the
    /// fields every canonical message must carry.
    pub(crate) fn into_message(self) -> Option<Message> {
        let id = self.id.filter(|id| !id.is_empty())?;
        let timestamp = self.timestamp?;

        Some(Message {
            id: MessageId::Canonical(id),
            chat_id: self.chat_id.unwrap_or_default(),
            sender_id: self.sender_id.unwrap_or_default(),
            sender_name: self.sender_name.unwrap_or_else(|| "?".to_string()),
            sender_role: parse_role(self.sender_role.as_deref()),
            content: self.content.unwrap_or_default(),
            kind: parse_kind(self.kind.as_deref()),
            file_url: self.file_url,
            file_name: self.file_name,
            file_size: self.file_size,
            timestamp,
            status: parse_status(self.status.as_deref()),
            reply_to: self.reply_to,
        })
    }
}

fn parse_role(role: Option<&str>) -> SenderRole {
    match role {
        Some("support-agent") => SenderRole::SupportAgent,
        Some("support-admin") => SenderRole::SupportAdmin,
        _ => SenderRole::Customer,
    }
}

fn parse_kind(kind: Option<&str>) -> MessageKind {
    match kind {
        Some("image") => MessageKind::Image,
        Some("file") => MessageKind::File,
        _ => MessageKind::Text,
    }
}

/// Unknown or missing status means the server accepted the message.
fn parse_status(status: Option<&str>) -> MessageStatus {
    match status {
        Some("sending") => MessageStatus::Sending,
        Some("delivered") => MessageStatus::Delivered,
        Some("read") => MessageStatus::Read,
        _ => MessageStatus::Sent,
    }
}

fn kind_str(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::File => "file",
    }
}

/// HTTP implementation of the pull-side transport.
pub struct HttpTransport {
    client: ApiClient,
}

impl HttpTransport {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn fetch_history(&self, chat_id: Option<&str>) -> Result<HistoryPage> {
        let path = match chat_id {
            Some(id) => format!("/api/support/history?chatId={}", id),
            None => "/api/support/history".to_string(),
        };

        let resp = self.client.get(&path).await?;
        let body: HistoryResponse = resp
            .json()
            .await
            .context("Failed to parse history response")?;

        let chat_id = body
            .chat_id
            .filter(|id| !id.is_empty())
            .context("History response missing chatId")?;

        let mut messages = Vec::new();
        for wire in body.messages.unwrap_or_default() {
            match wire.into_message() {
                Some(msg) => messages.push(msg),
                None => tracing::debug!("Skipping malformed history entry"),
            }
        }

        Ok(HistoryPage { chat_id, messages })
    }

    async fn post_message(&self, chat_id: Option<&str>, draft: &Draft) -> Result<Message> {
        let mut body = serde_json::json!({
            "content": draft.content,
            "type": kind_str(draft.kind),
        });
        if let Some(id) = chat_id {
            body["chatId"] = serde_json::Value::from(id);
        }
        if let Some(ref url) = draft.file_url {
            body["fileUrl"] = serde_json::Value::from(url.as_str());
        }
        if let Some(ref name) = draft.file_name {
            body["fileName"] = serde_json::Value::from(name.as_str());
        }
        if let Some(size) = draft.file_size {
            body["fileSize"] = serde_json::Value::from(size);
        }
        if let Some(ref reply) = draft.reply_to {
            body["replyTo"] = serde_json::json!({
                "messageId": reply.message_id,
                "content": reply.content,
                "senderName": reply.sender_name,
            });
        }

        let resp = self.client.post_json("/api/support/message", &body).await?;
        let body: PostResponse = resp.json().await.context("Failed to parse post response")?;

        body.message
            .and_then(WireMessage::into_message)
            .context("Post response missing canonical message")
    }

    async fn mark_read(&self, id: &str) -> Result<()> {
        self.client
            .put(&format!("/api/support/message/{}/read", id))
            .await?;
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<()> {
        self.client.put("/api/support/messages/read-all").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_converts() {
        let wire: WireMessage = serde_json::from_str(
            r#"{
                "id": "srv-9",
                "chatId": "chat-1",
                "senderId": "agent-7",
                "senderName": "Dana",
                "senderRole": "support-agent",
                "content": "hi there",
                "type": "text",
                "timestamp": "2024-05-03T10:15:00Z",
                "status": "delivered"
            }"#,
        )
        .unwrap();

        let msg = wire.into_message().unwrap();
        assert_eq!(msg.id, MessageId::Canonical("srv-9".into()));
        assert_eq!(msg.sender_role, SenderRole::SupportAgent);
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.kind, MessageKind::Text);
    }

    #[test]
    fn test_wire_message_without_id_is_dropped() {
        let wire: WireMessage = serde_json::from_str(
            r#"{"content": "orphan", "timestamp": "2024-05-03T10:15:00Z"}"#,
        )
        .unwrap();
        assert!(wire.into_message().is_none());
    }

    #[test]
    fn test_wire_message_without_timestamp_is_dropped() {
        let wire: WireMessage = serde_json::from_str(r#"{"id": "srv-1", "content": "x"}"#).unwrap();
        assert!(wire.into_message().is_none());
    }

    #[test]
    fn test_unknown_status_and_role_fall_back() {
        let wire: WireMessage = serde_json::from_str(
            r#"{
                "id": "srv-2",
                "senderRole": "bot",
                "status": "teleported",
                "timestamp": "2024-05-03T10:15:00Z"
            }"#,
        )
        .unwrap();

        let msg = wire.into_message().unwrap();
        assert_eq!(msg.sender_role, SenderRole::Customer);
        assert_eq!(msg.status, MessageStatus::Sent);
    }

    #[test]
    fn test_reply_preview_survives_conversion() {
        let wire: WireMessage = serde_json::from_str(
            r#"{
                "id": "srv-3",
                "timestamp": "2024-05-03T10:15:00Z",
                "replyTo": {
                    "messageId": "srv-1",
                    "content": "original text",
                    "senderName": "Dana"
                }
            }"#,
        )
        .unwrap();

        let msg = wire.into_message().unwrap();
        let reply = msg.reply_to.unwrap();
        assert_eq!(reply.message_id, "srv-1");
        assert_eq!(reply.content, "original text");
    }
}
