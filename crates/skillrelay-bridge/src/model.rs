//! Messages flowing through a bridge.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who sent an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub name: String,
}

/// How a message reached the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// One-to-one conversation.
    Direct,
    /// The bot was @-mentioned in a shared channel.
    Mention,
    /// A reply in a thread the bot is already part of.
    ThreadReply,
    Sms,
    /// A queued chat message fetched by polling.
    Chat,
}

/// One inbound event, immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    /// Conversation the message belongs to (Slack channel, phone number, CRM).
    pub channel: String,
    pub author: Author,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub kind: MessageKind,
    #[serde(default)]
    pub is_admin: bool,
    /// Channel-specific extras kept for the inbox log (media URLs, recipient).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl InboundMessage {
    /// Identity used by the work tracker.
    pub fn work_key(&self) -> WorkKey {
        WorkKey::new(&self.channel, &self.id)
    }

    /// Thread to answer in: the message's own thread, or the message itself.
    pub fn reply_thread(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.id)
    }
}

/// Outbound answer. Fire-and-forget once handed to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub destination: String,
    pub body: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

impl Reply {
    /// A reply addressed back to where `message` came from.
    pub fn to(message: &InboundMessage, body: impl Into<String>) -> Self {
        Self {
            destination: message.channel.clone(),
            body: body.into(),
            in_reply_to: Some(message.reply_thread().to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkKey
// ---------------------------------------------------------------------------

/// `(channel, message_id)`; persisted as `"channel|message_id"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkKey {
    pub channel: String,
    pub message_id: String,
}

impl WorkKey {
    pub fn new(channel: &str, message_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            message_id: message_id.to_string(),
        }
    }

    /// Parse the persisted form. The channel never contains `|`; the id may.
    pub fn parse(s: &str) -> Option<Self> {
        let (channel, message_id) = s.split_once('|')?;
        if channel.is_empty() || message_id.is_empty() {
            return None;
        }
        Some(Self::new(channel, message_id))
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.channel, self.message_id)
    }
}
