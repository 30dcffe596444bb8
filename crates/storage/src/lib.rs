//! Durable conversation and message store behind the chat pipeline.
//!
//! Two backends implement the same async traits: [`SqliteStorage`] for real
//! deployments and [`MemoryStorage`] for tests and ephemeral servers.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, MessageId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    Attachment, ConversationPatch, ConversationRecord, DEFAULT_CONVERSATION_TITLE, MessageRecord,
    MessageRole, NewConversation, NewMessage,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Location value that selects the in-process [`MemoryStorage`].
pub const MEMORY_LOCATION: &str = ":memory:";

pub trait ConversationStore: Send + Sync {
    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;

    /// Most recently active first.
    fn list_conversations<'a>(
        &'a self,
        include_archived: bool,
    ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>>;

    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>>;

    fn update_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;

    /// Moves the recency marker to now. Never moves it backwards.
    fn touch_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;
}

pub trait MessageStore: Send + Sync {
    /// Appends a message; the store assigns its id and creation order.
    fn create_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>>;

    /// Messages in creation order.
    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>>;
}

pub trait Storage: ConversationStore + MessageStore {}

impl<T> Storage for T where T: ConversationStore + MessageStore {}

/// Opens the backend selected by `location`: `":memory:"` for [`MemoryStorage`],
/// anything else as a sqlite path or URL.
pub async fn open_storage(location: &str) -> StorageResult<Arc<dyn Storage>> {
    let location = location.trim();
    if location == MEMORY_LOCATION {
        tracing::info!("using in-memory storage");
        return Ok(Arc::new(MemoryStorage::new()));
    }

    let storage = SqliteStorage::open(location).await?;
    tracing::info!(database_url = %storage.database_url(), "opened sqlite storage");
    Ok(Arc::new(storage))
}

pub(crate) fn unix_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
