use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use immix_llm::Model;
use immix_storage::{
    Attachment, ConversationId, ConversationPatch, ConversationRecord, ConversationStore,
    MessageRecord, MessageRole, MessageStore, NewConversation, NewMessage,
};
use immix_wire::{ChatRequest, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ApiError;
use super::state::AppState;

pub const DEFAULT_OWNER: &str = "anonymous";

pub async fn health() -> &'static str {
    "ok"
}

/// Streams one chat exchange as `data: <JSON>` events.
pub async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let Json(request) = payload?;
    let chat = state.orchestrator.handle(request).await?;
    tracing::info!(
        conversation_id = %chat.conversation_id,
        user_message_id = %chat.user_message.id,
        "streaming chat response"
    );

    // The exchange task is detached; it finishes and persists on its own.
    let events = chat
        .records
        .map(|record| Event::default().json_data(record));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsQuery {
    #[serde(default)]
    pub include_archived: bool,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<ConversationRecord>>, ApiError> {
    let records = state
        .store
        .list_conversations(query.include_archived)
        .await?;
    Ok(Json(records))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    payload: Result<Json<CreateConversationBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ConversationRecord>), ApiError> {
    let Json(body) = payload?;
    let owner = body
        .owner
        .map(|owner| owner.trim().to_string())
        .filter(|owner| !owner.is_empty())
        .unwrap_or_else(|| DEFAULT_OWNER.to_string());

    let record = state
        .store
        .create_conversation(NewConversation::new(owner, body.title.unwrap_or_default()))
        .await?;
    tracing::info!(conversation_id = %record.id, "created conversation");
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateConversationBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub archived: Option<bool>,
}

pub async fn update_conversation(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<UpdateConversationBody>, JsonRejection>,
) -> Result<Json<ConversationRecord>, ApiError> {
    let Json(body) = payload?;
    let conversation_id = ConversationId::parse(&raw_id)?;
    let record = state
        .store
        .update_conversation(
            conversation_id,
            ConversationPatch {
                title: body.title,
                archived: body.archived,
            },
        )
        .await?;
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub conversation: Option<String>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessageRecord>>, ApiError> {
    let raw_id = query
        .conversation
        .filter(|raw| !raw.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("conversation query parameter is required"))?;
    let conversation_id = ConversationId::parse(&raw_id)?;

    let records = state.store.list_messages(conversation_id).await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageBody {
    pub conversation: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub async fn create_message(
    State(state): State<AppState>,
    payload: Result<Json<CreateMessageBody>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageRecord>), ApiError> {
    let Json(body) = payload?;
    let conversation_id = ConversationId::parse(&body.conversation)?;

    let mut message =
        NewMessage::new(message_role(body.role), body.content).with_attachments(body.attachments);
    if let Some(metadata) = body.metadata {
        message = message.with_metadata(metadata);
    }

    let record = state
        .orchestrator
        .persister()
        .persist(conversation_id, message)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub current: String,
    pub models: Vec<Model>,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        current: state.models.current().to_string(),
        models: state.models.available().to_vec(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SwitchModelBody {
    pub model: String,
}

pub async fn switch_model(
    State(state): State<AppState>,
    payload: Result<Json<SwitchModelBody>, JsonRejection>,
) -> Result<Json<ModelsResponse>, ApiError> {
    let Json(body) = payload?;
    state.models.switch(&body.model)?;
    Ok(list_models(State(state)).await)
}

fn message_role(role: Role) -> MessageRole {
    match role {
        Role::System => MessageRole::System,
        Role::User => MessageRole::User,
        Role::Assistant => MessageRole::Assistant,
        Role::Tool => MessageRole::Tool,
    }
}
