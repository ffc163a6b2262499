//! Message-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message identifier.
///
/// Local ids are client-generated placeholders for sends the server has not
/// confirmed yet; canonical ids are assigned by the server once a message is
/// durably accepted. A local id is never reused once superseded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageId {
    Local(Uuid),
    Canonical(String),
}

impl MessageId {
    /// Generate a fresh local placeholder id.
    pub fn new_local() -> Self {
        MessageId::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Local(id) => write!(f, "{}", id),
            MessageId::Canonical(id) => write!(f, "{}", id),
        }
    }
}

/// Delivery status. The declaration order is the status order; updates apply
/// `max(current, incoming)` so a status never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

/// Role of the message sender within the support conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SenderRole {
    Customer,
    SupportAgent,
    SupportAdmin,
}

/// Message payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

/// Snapshot of the message being replied to, captured at reply time.
///
/// This is a copy, not a reference: the quoted content survives whatever
/// later happens to the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub message_id: String,
    pub content: String,
    pub sender_name: String,
}

/// A chat message. Immutable once canonical, except for `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: SenderRole,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

impl Message {
    /// Advance the status, never regressing an already higher one.
    pub fn advance_status(&mut self, incoming: MessageStatus) {
        self.status = self.status.max(incoming);
    }
}
