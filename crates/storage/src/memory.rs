use std::collections::HashMap;

use snafu::OptionExt;
use tokio::sync::RwLock;

use super::error::{NotFoundSnafu, StorageResult, UnavailableSnafu};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationPatch, ConversationRecord, MessageRecord, MessageRole, NewConversation, NewMessage,
    normalize_title,
};
use super::{BoxFuture, ConversationStore, MessageStore, unix_timestamp_millis};

/// In-process store with the same ordering rules as [`super::SqliteStorage`].
///
/// Failure switches let tests exercise the persistence error paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
    failing_message_role: Option<MessageRole>,
    offline: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `create_message` fail for messages with `role` until cleared with `None`.
    pub async fn fail_message_writes(&self, role: Option<MessageRole>) {
        self.state.write().await.failing_message_role = role;
    }

    /// Makes every operation fail with [`super::StorageError::Unavailable`].
    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.offline = offline;
    }
}

impl MemoryState {
    fn ensure_online(&self, stage: &'static str) -> StorageResult<()> {
        if self.offline {
            return UnavailableSnafu {
                stage,
                details: "memory storage is offline".to_string(),
            }
            .fail();
        }
        Ok(())
    }

    fn conversation_mut(
        &mut self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> StorageResult<&mut ConversationRecord> {
        self.conversations
            .get_mut(&conversation_id)
            .context(NotFoundSnafu {
                stage,
                entity: "conversation",
                id: conversation_id.to_string(),
            })
    }
}

impl ConversationStore for MemoryStorage {
    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.ensure_online("memory-conversation-create")?;

            let now = unix_timestamp_millis();
            let record = ConversationRecord {
                id: ConversationId::new_v7(),
                title: input.normalized_title(),
                owner: input.owner,
                archived: false,
                created_at_unix_ms: now,
                last_message_at_unix_ms: now,
            };
            state.conversations.insert(record.id, record.clone());
            state.messages.insert(record.id, Vec::new());
            Ok(record)
        })
    }

    fn list_conversations<'a>(
        &'a self,
        include_archived: bool,
    ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.ensure_online("memory-conversation-list")?;

            let mut records: Vec<ConversationRecord> = state
                .conversations
                .values()
                .filter(|record| include_archived || !record.archived)
                .cloned()
                .collect();
            records.sort_by(|left, right| {
                right
                    .last_message_at_unix_ms
                    .cmp(&left.last_message_at_unix_ms)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(records)
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.ensure_online("memory-conversation-get")?;
            Ok(state.conversations.get(&conversation_id).cloned())
        })
    }

    fn update_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.ensure_online("memory-conversation-update")?;

            let record = state.conversation_mut(conversation_id, "memory-conversation-update")?;
            if let Some(title) = patch.title {
                record.title = normalize_title(&title);
            }
            if let Some(archived) = patch.archived {
                record.archived = archived;
            }
            Ok(record.clone())
        })
    }

    fn touch_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.ensure_online("memory-conversation-touch")?;

            let record = state.conversation_mut(conversation_id, "memory-conversation-touch")?;
            record.last_message_at_unix_ms =
                record.last_message_at_unix_ms.max(unix_timestamp_millis());
            Ok(record.clone())
        })
    }
}

impl MessageStore for MemoryStorage {
    fn create_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.ensure_online("memory-message-create")?;
            if state.failing_message_role == Some(input.role) {
                return UnavailableSnafu {
                    stage: "memory-message-create",
                    details: format!("writes of {} messages are failing", input.role.as_str()),
                }
                .fail();
            }

            let messages = state
                .messages
                .get_mut(&conversation_id)
                .context(NotFoundSnafu {
                    stage: "memory-message-create",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;
            let record = MessageRecord {
                id: MessageId::new_v7(),
                conversation_id,
                seq: messages.len() as u64 + 1,
                role: input.role,
                content: input.content,
                attachments: input.attachments,
                metadata: input.metadata,
                created_at_unix_ms: unix_timestamp_millis(),
            };
            messages.push(record.clone());
            Ok(record)
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.read().await;
            state.ensure_online("memory-message-list")?;
            state
                .messages
                .get(&conversation_id)
                .cloned()
                .context(NotFoundSnafu {
                    stage: "memory-message-list",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })
        })
    }
}
