use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ConversationId, MessageId};

/// Title given to conversations created without a usable title.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Storage-local message role, decoupled from the wire role enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub owner: String,
    pub title: String,
    pub archived: bool,
    pub created_at_unix_ms: u64,
    /// Recency marker. Only ever moves forward, and only when a message is appended.
    pub last_message_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub owner: String,
    pub title: String,
}

impl NewConversation {
    pub fn new(owner: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            title: title.into(),
        }
    }

    pub(crate) fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// Store-assigned creation order within the conversation, starting at 1.
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub metadata: Option<Value>,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub(crate) fn normalize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_CONVERSATION_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}
