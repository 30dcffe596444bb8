use std::future::Future;
use std::pin::Pin;

use futures::{Stream, StreamExt, TryStreamExt};
use immix_wire::{ChatRequest, Role};
use serde::Deserialize;
use snafu::ResultExt;

use crate::error::{BackendSnafu, ClientResult, TransportSnafu};
use crate::message::{ChatMessage, DeliveryStatus};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw body chunks of the chat event stream, split wherever the transport splits them.
pub type ByteStream = Pin<Box<dyn Stream<Item = ClientResult<Vec<u8>>> + Send>>;

/// Server calls the client message store depends on.
pub trait ChatBackend: Send + Sync {
    /// Starts a chat exchange. Resolves once the server acknowledged the request.
    fn send_chat(&self, request: ChatRequest) -> BoxFuture<'_, ClientResult<ByteStream>>;

    fn load_messages<'a>(
        &'a self,
        conversation_id: &'a str,
    ) -> BoxFuture<'a, ClientResult<Vec<ChatMessage>>>;
}

/// Message shape returned by `GET /api/messages`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at_unix_ms: u64,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl RemoteMessage {
    pub fn into_chat_message(self) -> ChatMessage {
        let failed = self
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("status"))
            .and_then(serde_json::Value::as_str)
            == Some("failed");
        ChatMessage {
            id: self.id,
            role: self.role,
            content: self.content,
            timestamp_unix_ms: self.created_at_unix_ms,
            status: Some(if failed {
                DeliveryStatus::Error
            } else {
                DeliveryStatus::Sent
            }),
            citations: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`ChatBackend`] speaking to an `immix-server` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn ensure_success(
        response: reqwest::Response,
        stage: &'static str,
    ) -> ClientResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|parsed| parsed.error)
            .unwrap_or(body);
        BackendSnafu {
            stage,
            status: status.as_u16(),
            message,
        }
        .fail()
    }
}

impl ChatBackend for HttpChatBackend {
    fn send_chat(&self, request: ChatRequest) -> BoxFuture<'_, ClientResult<ByteStream>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/api/agent/chat"))
                .json(&request)
                .send()
                .await
                .context(TransportSnafu {
                    stage: "send-chat-request",
                })?;
            let response = Self::ensure_success(response, "send-chat-request").await?;

            let stream = response
                .bytes_stream()
                .map_ok(|chunk| chunk.to_vec())
                .map(|chunk| {
                    chunk.context(TransportSnafu {
                        stage: "read-chat-stream",
                    })
                });
            Ok(Box::pin(stream) as ByteStream)
        })
    }

    fn load_messages<'a>(
        &'a self,
        conversation_id: &'a str,
    ) -> BoxFuture<'a, ClientResult<Vec<ChatMessage>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url("/api/messages"))
                .query(&[("conversation", conversation_id)])
                .send()
                .await
                .context(TransportSnafu {
                    stage: "load-messages",
                })?;
            let response = Self::ensure_success(response, "load-messages").await?;

            let messages: Vec<RemoteMessage> =
                response.json().await.context(TransportSnafu {
                    stage: "decode-messages",
                })?;
            Ok(messages
                .into_iter()
                .map(RemoteMessage::into_chat_message)
                .collect())
        })
    }
}
