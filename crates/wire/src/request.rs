use std::fmt;

use serde::{Deserialize, Serialize};

/// Author of one chat turn as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Body of `POST /api/agent/chat`.
///
/// `messages` is the full history the caller wants the generator to see, with
/// the new user turn last. `params` passes through to the generator untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ChatRequest {
    pub fn new(conversation_id: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            messages,
            params: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Map<String, serde_json::Value>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn last_turn(&self) -> Option<&ChatTurn> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_body_with_missing_optionals() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"conversationId":"c1","messages":[{"role":"user","content":"Hello"}]}"#,
        )
        .unwrap();

        assert_eq!(request.conversation_id.as_deref(), Some("c1"));
        assert_eq!(request.last_turn(), Some(&ChatTurn::new(Role::User, "Hello")));
        assert!(request.params.is_none());

        let empty: ChatRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.conversation_id.is_none());
        assert!(empty.messages.is_empty());
    }

    #[test]
    fn rejects_unknown_roles() {
        let result = serde_json::from_str::<ChatTurn>(r#"{"role":"narrator","content":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let mut params = serde_json::Map::new();
        params.insert("temperature".to_string(), serde_json::json!(0.2));
        let request = ChatRequest::new("c1", vec![ChatTurn::new(Role::Assistant, "hi")])
            .with_params(params);

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["messages"][0]["role"], "assistant");
        assert_eq!(value["params"]["temperature"], 0.2);
    }
}
