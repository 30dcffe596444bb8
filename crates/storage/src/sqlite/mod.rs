use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeJsonSnafu, EncodeJsonSnafu, InvariantViolationSnafu,
    NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    Attachment, ConversationPatch, ConversationRecord, MessageRecord, MessageRole,
    NewConversation, NewMessage, normalize_title,
};
use super::{BoxFuture, ConversationStore, MessageStore, unix_timestamp_millis};

const CONVERSATION_COLUMNS: &str = "id, owner, title, archived, created_at, last_message_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, seq, role, content, attachments_json, metadata_json, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection serializes writes per database and keeps
        // `sqlite::memory:` databases alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> StorageResult<Option<ConversationRecord>> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
        ))
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?;

        row.map(conversation_row_to_record).transpose()
    }

    async fn require_conversation(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> StorageResult<ConversationRecord> {
        self.load_conversation(conversation_id, stage)
            .await?
            .context(NotFoundSnafu {
                stage,
                entity: "conversation",
                id: conversation_id.to_string(),
            })
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let now = unix_timestamp_millis();
            let record = ConversationRecord {
                id: ConversationId::new_v7(),
                title: input.normalized_title(),
                owner: input.owner,
                archived: false,
                created_at_unix_ms: now,
                last_message_at_unix_ms: now,
            };

            sqlx::query(
                "INSERT INTO conversations (id, owner, title, archived, created_at, last_message_at) VALUES (?, ?, ?, 0, ?, ?)",
            )
            .bind(record.id.to_string())
            .bind(&record.owner)
            .bind(&record.title)
            .bind(u64_to_i64(now, "conversation-create-created-at")?)
            .bind(u64_to_i64(now, "conversation-create-last-message-at")?)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            Ok(record)
        })
    }

    fn list_conversations<'a>(
        &'a self,
        include_archived: bool,
    ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let filter = if include_archived {
                ""
            } else {
                "WHERE archived = 0"
            };
            let rows = sqlx::query_as::<_, ConversationRow>(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations {filter} ORDER BY last_message_at DESC, id DESC"
            ))
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn get_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<ConversationRecord>>> {
        Box::pin(self.load_conversation(conversation_id, "conversation-get-query"))
    }

    fn update_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let title = patch.title.as_deref().map(normalize_title);
            let result = sqlx::query(
                "UPDATE conversations SET title = COALESCE(?, title), archived = COALESCE(?, archived) WHERE id = ?",
            )
            .bind(title)
            .bind(patch.archived)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-apply",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-update-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            self.require_conversation(conversation_id, "conversation-update-load")
                .await
        })
    }

    fn touch_conversation<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            let now = u64_to_i64(unix_timestamp_millis(), "conversation-touch-now")?;
            let result = sqlx::query(
                "UPDATE conversations SET last_message_at = MAX(last_message_at, ?) WHERE id = ?",
            )
            .bind(now)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-touch-apply",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-touch-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            self.require_conversation(conversation_id, "conversation-touch-load")
                .await
        })
    }
}

impl MessageStore for SqliteStorage {
    fn create_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'a, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let attachments_json =
                serde_json::to_string(&input.attachments).context(EncodeJsonSnafu {
                    stage: "message-create-encode-attachments",
                    field: "attachments",
                })?;
            let metadata_json = input
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context(EncodeJsonSnafu {
                    stage: "message-create-encode-metadata",
                    field: "metadata",
                })?;

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-create-begin",
            })?;

            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-create-check-conversation",
            })?;
            if exists == 0 {
                return NotFoundSnafu {
                    stage: "message-create-missing-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-create-next-seq",
            })?;

            let now = unix_timestamp_millis();
            let message_id = MessageId::new_v7();
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, seq, role, content, attachments_json, metadata_json, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(conversation_id.to_string())
            .bind(next_seq)
            .bind(input.role.as_str())
            .bind(&input.content)
            .bind(attachments_json)
            .bind(metadata_json)
            .bind(u64_to_i64(now, "message-create-created-at")?)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-create-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-create-commit",
            })?;

            Ok(MessageRecord {
                id: message_id,
                conversation_id,
                seq: i64_to_u64(next_seq, "message-create-seq")?,
                role: input.role,
                content: input.content,
                attachments: input.attachments,
                metadata: input.metadata,
                created_at_unix_ms: now,
            })
        })
    }

    fn list_messages<'a>(
        &'a self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'a, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            self.require_conversation(conversation_id, "message-list-load-conversation")
                .await?;

            let rows = sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? ORDER BY seq ASC"
            ))
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    owner: String,
    title: String,
    archived: bool,
    created_at: i64,
    last_message_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    role: String,
    content: String,
    attachments_json: String,
    metadata_json: Option<String>,
    created_at: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        owner: row.owner,
        title: row.title,
        archived: row.archived,
        created_at_unix_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        last_message_at_unix_ms: i64_to_u64(
            row.last_message_at,
            "conversation-row-last-message-at",
        )?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let attachments: Vec<Attachment> =
        serde_json::from_str(&row.attachments_json).context(DecodeJsonSnafu {
            stage: "message-row-attachments",
            field: "attachments",
        })?;
    let metadata: Option<Value> = row
        .metadata_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context(DecodeJsonSnafu {
            stage: "message-row-metadata",
            field: "metadata",
        })?;

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        attachments,
        metadata,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        "tool" => Ok(MessageRole::Tool),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("immix.db");
        let storage = SqliteStorage::open(path.to_str().unwrap()).await.unwrap();
        (dir, storage)
    }

    #[test]
    fn normalizes_plain_paths_and_memory_aliases() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("data/a.db"), "sqlite://data/a.db");
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
    }

    #[tokio::test]
    async fn round_trips_messages_with_attachments_and_metadata() {
        let (_dir, storage) = open_temp().await;
        let conversation = storage
            .create_conversation(NewConversation::new("owner-1", "Trip plans"))
            .await
            .unwrap();

        storage
            .create_message(
                conversation.id,
                NewMessage::new(MessageRole::User, "Hello").with_attachments(vec![Attachment {
                    uri: "file:///tmp/map.png".to_string(),
                    mime_type: "image/png".to_string(),
                }]),
            )
            .await
            .unwrap();
        storage
            .create_message(
                conversation.id,
                NewMessage::new(MessageRole::Assistant, "Hel")
                    .with_metadata(json!({"status": "failed", "error": "boom"})),
            )
            .await
            .unwrap();

        let messages = storage.list_messages(conversation.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].seq, 1);
        assert_eq!(messages[0].attachments[0].mime_type, "image/png");
        assert_eq!(messages[1].seq, 2);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].metadata.as_ref().unwrap()["status"], "failed");
    }

    #[tokio::test]
    async fn touch_never_moves_recency_backwards() {
        let (_dir, storage) = open_temp().await;
        let conversation = storage
            .create_conversation(NewConversation::new("owner-1", ""))
            .await
            .unwrap();
        assert_eq!(conversation.title, crate::DEFAULT_CONVERSATION_TITLE);

        let future = u64_to_i64(conversation.last_message_at_unix_ms + 60_000, "test").unwrap();
        sqlx::query("UPDATE conversations SET last_message_at = ? WHERE id = ?")
            .bind(future)
            .bind(conversation.id.to_string())
            .execute(storage.pool())
            .await
            .unwrap();

        let touched = storage.touch_conversation(conversation.id).await.unwrap();
        assert_eq!(touched.last_message_at_unix_ms, future as u64);
    }

    #[tokio::test]
    async fn missing_conversations_surface_not_found() {
        let (_dir, storage) = open_temp().await;
        let missing = ConversationId::new_v7();

        assert!(storage.get_conversation(missing).await.unwrap().is_none());
        assert!(
            storage
                .create_message(missing, NewMessage::new(MessageRole::User, "x"))
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(storage.touch_conversation(missing).await.unwrap_err().is_not_found());
        assert!(
            storage
                .update_conversation(missing, ConversationPatch::default())
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn in_memory_sqlite_keeps_state_between_calls() {
        let storage = SqliteStorage::open(":memory:").await.unwrap();
        let conversation = storage
            .create_conversation(NewConversation::new("owner-1", "kept"))
            .await
            .unwrap();

        let patched = storage
            .update_conversation(
                conversation.id,
                ConversationPatch {
                    title: Some("renamed".to_string()),
                    archived: Some(true),
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.title, "renamed");
        assert!(patched.archived);
        assert!(storage.list_conversations(false).await.unwrap().is_empty());
        assert_eq!(storage.list_conversations(true).await.unwrap().len(), 1);
    }
}
