use std::sync::Arc;

use immix_storage::{
    ConversationId, ConversationStore, MessageRecord, MessageRole, MessageStore, NewMessage,
    Storage, StorageError,
};
use serde_json::json;
use snafu::ResultExt;

use super::error::{ChatError, ChatResult, PersistenceFailureSnafu};
use super::tee::{Accumulated, Terminal};

pub const STATUS_COMPLETE: &str = "complete";
pub const STATUS_FAILED: &str = "failed";

/// Writes exchange turns and advances the conversation's recency marker.
#[derive(Clone)]
pub struct ExchangePersister {
    store: Arc<dyn Storage>,
}

impl ExchangePersister {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self { store }
    }

    /// Appends `message`, then touches the conversation.
    pub async fn persist(
        &self,
        conversation_id: ConversationId,
        message: NewMessage,
    ) -> ChatResult<MessageRecord> {
        let role = message.role.as_str();
        let record = self
            .store
            .create_message(conversation_id, message)
            .await
            .map_err(|source| {
                classify_store_error(source, conversation_id, role, "persist-create")
            })?;

        self.store
            .touch_conversation(conversation_id)
            .await
            .context(PersistenceFailureSnafu {
                stage: "persist-touch",
                role,
            })?;

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %record.id,
            seq = record.seq,
            role,
            "persisted message"
        );
        Ok(record)
    }

    pub async fn persist_user_turn(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> ChatResult<MessageRecord> {
        self.persist(conversation_id, NewMessage::new(MessageRole::User, content))
            .await
    }

    /// Stores whatever text was generated. A failed generation keeps its partial
    /// text and records the reason in the metadata.
    pub async fn persist_assistant_turn(
        &self,
        conversation_id: ConversationId,
        accumulated: &Accumulated,
    ) -> ChatResult<MessageRecord> {
        let metadata = match &accumulated.terminal {
            Terminal::Done => json!({ "status": STATUS_COMPLETE }),
            Terminal::Error(reason) => json!({ "status": STATUS_FAILED, "error": reason }),
        };
        let message = NewMessage::new(MessageRole::Assistant, accumulated.text.clone())
            .with_metadata(metadata);
        self.persist(conversation_id, message).await
    }
}

fn classify_store_error(
    source: StorageError,
    conversation_id: ConversationId,
    role: &'static str,
    stage: &'static str,
) -> ChatError {
    if source.is_not_found() {
        return ChatError::UnknownConversation {
            stage,
            conversation_id: conversation_id.to_string(),
        };
    }
    ChatError::PersistenceFailure {
        stage,
        role,
        source,
    }
}

#[cfg(test)]
mod tests {
    use immix_storage::{MemoryStorage, NewConversation};

    use super::*;

    async fn setup() -> (Arc<MemoryStorage>, ExchangePersister, ConversationId) {
        let store = Arc::new(MemoryStorage::new());
        let conversation = store
            .create_conversation(NewConversation::new("owner-1", "t"))
            .await
            .unwrap();
        let persister = ExchangePersister::new(store.clone());
        (store, persister, conversation.id)
    }

    #[tokio::test]
    async fn failed_generations_keep_partial_text_and_reason() {
        let (store, persister, conversation_id) = setup().await;
        let accumulated = Accumulated {
            text: "Hel".to_string(),
            terminal: Terminal::Error("engine died".to_string()),
        };

        let record = persister
            .persist_assistant_turn(conversation_id, &accumulated)
            .await
            .unwrap();
        assert_eq!(record.content, "Hel");
        assert_eq!(
            record.metadata,
            Some(json!({"status": "failed", "error": "engine died"}))
        );
        assert_eq!(store.list_messages(conversation_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn touches_recency_after_each_append() {
        let (store, persister, conversation_id) = setup().await;
        let before = store
            .get_conversation(conversation_id)
            .await
            .unwrap()
            .unwrap()
            .last_message_at_unix_ms;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        persister
            .persist_user_turn(conversation_id, "Hello")
            .await
            .unwrap();
        let after = store
            .get_conversation(conversation_id)
            .await
            .unwrap()
            .unwrap()
            .last_message_at_unix_ms;
        assert!(after > before);
    }

    #[tokio::test]
    async fn distinguishes_missing_conversations_from_store_failures() {
        let (store, persister, conversation_id) = setup().await;

        let missing = persister
            .persist_user_turn(ConversationId::new_v7(), "x")
            .await
            .unwrap_err();
        assert!(matches!(missing, ChatError::UnknownConversation { .. }));

        store.fail_message_writes(Some(MessageRole::User)).await;
        let failed = persister
            .persist_user_turn(conversation_id, "x")
            .await
            .unwrap_err();
        assert!(matches!(
            failed,
            ChatError::PersistenceFailure { role: "user", .. }
        ));
    }
}
