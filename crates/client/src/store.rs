use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use immix_wire::{ChatRequest, ChatTurn, Role, SseDecoder, WireRecord};
use snafu::{OptionExt, ResultExt, ensure};

use crate::backend::ChatBackend;
use crate::cache::LocalCache;
use crate::error::{
    ClientError, ClientResult, DecodeSnafu, GenerationSnafu, NoActiveConversationSnafu,
    StoreBusySnafu, StreamInterruptedSnafu,
};
use crate::message::{ChatMessage, DeliveryStatus};

/// Where [`ClientMessageStore::load_messages`] took the committed list from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Remote,
    LocalCache,
}

/// Last failure surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfacedError {
    pub message: String,
    pub retryable: bool,
}

impl From<&ClientError> for SurfacedError {
    fn from(error: &ClientError) -> Self {
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    messages: HashMap<String, Vec<ChatMessage>>,
    streaming: HashMap<String, ChatMessage>,
    active_conversation: Option<String>,
    loading: bool,
    error: Option<SurfacedError>,
}

impl StoreState {
    /// Inserts or overwrites by id, keeping the original position.
    fn upsert(&mut self, conversation_id: &str, message: ChatMessage) {
        let list = self.messages.entry(conversation_id.to_string()).or_default();
        match list.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => *existing = message,
            None => list.push(message),
        }
    }

    fn set_status(&mut self, conversation_id: &str, message_id: &str, status: DeliveryStatus) {
        if let Some(message) = self
            .messages
            .get_mut(conversation_id)
            .and_then(|list| list.iter_mut().find(|message| message.id == message_id))
        {
            message.status = Some(status);
        }
    }

    fn committed(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Client-side view of every conversation: a committed, ordered message list plus
/// at most one streaming assistant reply per conversation.
///
/// All committed mutations are written through to the [`LocalCache`].
pub struct ClientMessageStore {
    backend: Arc<dyn ChatBackend>,
    cache: LocalCache,
    state: Mutex<StoreState>,
}

impl ClientMessageStore {
    pub fn new(backend: Arc<dyn ChatBackend>, cache: LocalCache) -> Self {
        Self {
            backend,
            cache,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn set_active_conversation(&self, conversation_id: Option<String>) {
        self.lock().active_conversation = conversation_id;
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.lock().active_conversation.clone()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.lock().committed(conversation_id)
    }

    pub fn streaming_message(&self, conversation_id: &str) -> Option<ChatMessage> {
        self.lock().streaming.get(conversation_id).cloned()
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.lock().streaming.contains_key(conversation_id)
    }

    pub fn error(&self) -> Option<SurfacedError> {
        self.lock().error.clone()
    }

    pub fn clear_error(&self) {
        self.lock().error = None;
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    /// Idempotent by message id.
    pub fn add_message(&self, conversation_id: &str, message: ChatMessage) {
        let snapshot = {
            let mut state = self.lock();
            state.upsert(conversation_id, message);
            state.committed(conversation_id)
        };
        self.cache.put(conversation_id, &snapshot);
    }

    pub fn set_messages_for_conversation(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        self.lock()
            .messages
            .insert(conversation_id.to_string(), messages.clone());
        self.cache.put(conversation_id, &messages);
    }

    /// Replaces the streaming reply's content. Returns `false` when nothing is streaming.
    pub fn update_streaming_message(&self, conversation_id: &str, content: impl Into<String>) -> bool {
        match self.lock().streaming.get_mut(conversation_id) {
            Some(reply) => {
                reply.content = content.into();
                true
            }
            None => false,
        }
    }

    /// Drops the in-memory committed list of one conversation, or of all of them.
    /// The local cache keeps its copy for offline display.
    pub fn clear_messages(&self, conversation_id: Option<&str>) {
        let mut state = self.lock();
        match conversation_id {
            Some(conversation_id) => {
                state.messages.remove(conversation_id);
            }
            None => state.messages.clear(),
        }
    }

    /// Replaces the committed list with the server's copy. When the server cannot be
    /// reached and the cache has an entry, the cached list is shown instead and the
    /// failure is kept in [`Self::error`].
    pub async fn load_messages(&self, conversation_id: &str) -> ClientResult<LoadSource> {
        {
            let mut state = self.lock();
            state.loading = true;
            state.error = None;
        }

        let loaded = self.backend.load_messages(conversation_id).await;

        let mut state = self.lock();
        state.loading = false;
        match loaded {
            Ok(messages) => {
                state
                    .messages
                    .insert(conversation_id.to_string(), messages.clone());
                drop(state);
                self.cache.put(conversation_id, &messages);
                Ok(LoadSource::Remote)
            }
            Err(error) => {
                state.error = Some(SurfacedError::from(&error));
                match self.cache.get(conversation_id) {
                    Some(cached) => {
                        tracing::warn!(
                            conversation_id,
                            error = %error,
                            "showing cached messages, server unavailable"
                        );
                        state.messages.insert(conversation_id.to_string(), cached);
                        Ok(LoadSource::LocalCache)
                    }
                    None => Err(error),
                }
            }
        }
    }

    /// Sends `content` as a user turn of the active conversation and streams the reply.
    ///
    /// The user message is inserted as `sending` before any network call. On success
    /// both messages end up `sent` in the committed list. On any failure the user
    /// message is marked `error`, the partial reply is discarded and the error is
    /// returned as well as kept in [`Self::error`].
    pub async fn send_message(&self, content: impl Into<String>) -> ClientResult<()> {
        let (conversation_id, user_message_id, request, snapshot) = {
            let mut state = self.lock();
            let conversation_id = state
                .active_conversation
                .clone()
                .context(NoActiveConversationSnafu {
                    stage: "send-message",
                })?;
            ensure!(
                !state.streaming.contains_key(&conversation_id),
                StoreBusySnafu {
                    stage: "send-message",
                    conversation_id,
                }
            );

            let user_message =
                ChatMessage::local(Role::User, content).with_status(DeliveryStatus::Sending);
            let user_message_id = user_message.id.clone();
            state.upsert(&conversation_id, user_message);
            state.streaming.insert(
                conversation_id.clone(),
                ChatMessage::local(Role::Assistant, ""),
            );
            state.error = None;

            let snapshot = state.committed(&conversation_id);
            let turns = snapshot
                .iter()
                .map(|message| ChatTurn::new(message.role, message.content.clone()))
                .collect();
            let request = ChatRequest::new(conversation_id.clone(), turns);
            (conversation_id, user_message_id, request, snapshot)
        };
        self.cache.put(&conversation_id, &snapshot);

        let slot = StreamingSlot {
            store: self,
            conversation_id: conversation_id.clone(),
            user_message_id: user_message_id.clone(),
            armed: true,
        };

        match self
            .stream_reply(&conversation_id, &user_message_id, request)
            .await
        {
            Ok(()) => {
                slot.commit();
                Ok(())
            }
            Err(error) => {
                drop(slot);
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "chat exchange failed"
                );
                self.lock().error = Some(SurfacedError::from(&error));
                Err(error)
            }
        }
    }

    async fn stream_reply(
        &self,
        conversation_id: &str,
        user_message_id: &str,
        request: ChatRequest,
    ) -> ClientResult<()> {
        let mut body = self.backend.send_chat(request).await?;

        let snapshot = {
            let mut state = self.lock();
            state.set_status(conversation_id, user_message_id, DeliveryStatus::Sent);
            state.committed(conversation_id)
        };
        self.cache.put(conversation_id, &snapshot);

        let mut decoder = SseDecoder::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for record in decoder.push(&chunk) {
                let record = record.context(DecodeSnafu {
                    stage: "decode-chat-stream",
                })?;
                if self.apply_record(conversation_id, record)? {
                    return Ok(());
                }
            }
        }

        if let Some(record) = decoder.finish() {
            let record = record.context(DecodeSnafu {
                stage: "decode-chat-stream-tail",
            })?;
            if self.apply_record(conversation_id, record)? {
                return Ok(());
            }
        }

        StreamInterruptedSnafu {
            stage: "read-chat-stream",
        }
        .fail()
    }

    /// Returns `true` once the reply completed.
    fn apply_record(&self, conversation_id: &str, record: WireRecord) -> ClientResult<bool> {
        match record {
            WireRecord::Text { text } => {
                if let Some(reply) = self.lock().streaming.get_mut(conversation_id) {
                    reply.content.push_str(&text);
                }
                Ok(false)
            }
            WireRecord::Done { done } => Ok(done),
            WireRecord::Error { error } => GenerationSnafu {
                stage: "read-chat-stream",
                reason: error,
            }
            .fail(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns a conversation's streaming slot for the duration of one send.
///
/// Dropping it without [`StreamingSlot::commit`] (failure or a cancelled send)
/// discards the partial reply and marks the user message `error`.
struct StreamingSlot<'a> {
    store: &'a ClientMessageStore,
    conversation_id: String,
    user_message_id: String,
    armed: bool,
}

impl StreamingSlot<'_> {
    fn commit(mut self) {
        self.armed = false;
        let snapshot = {
            let mut state = self.store.lock();
            if let Some(mut reply) = state.streaming.remove(&self.conversation_id) {
                reply.status = Some(DeliveryStatus::Sent);
                state.upsert(&self.conversation_id, reply);
            }
            state.committed(&self.conversation_id)
        };
        self.store.cache.put(&self.conversation_id, &snapshot);
    }
}

impl Drop for StreamingSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let snapshot = {
            let mut state = self.store.lock();
            state.streaming.remove(&self.conversation_id);
            state.set_status(
                &self.conversation_id,
                &self.user_message_id,
                DeliveryStatus::Error,
            );
            state.committed(&self.conversation_id)
        };
        self.store.cache.put(&self.conversation_id, &snapshot);
    }
}
