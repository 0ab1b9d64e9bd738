use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One entry of the shared conversation history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub timestamp: i64,
}

/// Message body as the backend reports it: either a plain string or a
/// sequence of typed parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    #[default]
    Empty,
    Other(serde_json::Value),
}

/// A single typed content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    Text {
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        text: String,
    },
    Other(serde_json::Value),
}

impl MessageContent {
    /// Flatten the content into plain text: a string is trimmed, parts
    /// contribute their non-blank `text` joined by newlines, anything else
    /// is empty.
    pub fn plain_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.trim().to_string(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text, .. } => {
                        let text = text.trim();
                        (!text.is_empty()).then_some(text)
                    }
                    ContentPart::Other(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string(),
            MessageContent::Empty | MessageContent::Other(_) => String::new(),
        }
    }
}

impl ChannelMessage {
    pub fn assistant(text: &str) -> Self {
        Self {
            role: "assistant".into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn user(text: &str) -> Self {
        Self {
            role: "user".into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Whether this message was produced by the backend's assistant.
    pub fn is_assistant(&self) -> bool {
        self.role.trim().eq_ignore_ascii_case("assistant")
    }

    /// Plain text of the message: the direct `text` field when it is not
    /// blank, otherwise the flattened `content`.
    pub fn plain_text(&self) -> String {
        if let Some(text) = self.text.as_deref().map(str::trim) {
            if !text.is_empty() {
                return text.to_string();
            }
        }
        self.content.plain_text()
    }
}

/// Acknowledgement returned by a submit. Backends differ in what they echo,
/// so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Errors surfaced by a chat channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("invalid JSON from channel: {preview}")]
    MalformedEnvelope { preview: String },
}

/// A shared, polling-only conversation backend.
///
/// Implementations know nothing about request correlation: they move
/// messages in and history out.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Post `message` into the session. `idempotency_key` lets the backend
    /// drop retried submits; `deliver = false` suppresses user-visible
    /// notifications.
    async fn submit(
        &self,
        session_key: &str,
        message: &str,
        idempotency_key: &str,
        deliver: bool,
    ) -> Result<SendAck, ChannelError>;

    /// Most recent `limit` messages of the session, oldest first.
    async fn fetch_recent(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, ChannelError>;

    /// Ask the backend to stop whatever it is generating for the session.
    async fn abort_session(&self, session_key: &str) -> Result<(), ChannelError>;
}
