use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use immix_llm::{Fragment, GenerationHandle, GenerationParams, Generator};
use immix_storage::{ConversationId, MessageId, MessageRecord, Storage};
use immix_wire::{ChatRequest, Role, WireRecord};
use snafu::{OptionExt, ensure};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use super::error::{ChatError, ChatResult, InvalidRequestSnafu, PhaseRejectedSnafu};
use super::persister::ExchangePersister;
use super::prompt::build_transcript;
use super::tee::{Terminal, tee};

/// Per-request lifecycle of one chat exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    Validating,
    PersistingUserTurn,
    Generating,
    Streaming,
    PersistingAssistantTurn,
    Terminal { succeeded: bool },
}

impl ChatPhase {
    /// Phases advance strictly in order. The only shortcut is a failure before
    /// generation starts, which ends the exchange without an assistant turn.
    pub fn advance(self, next: ChatPhase) -> ChatResult<ChatPhase> {
        let allowed = matches!(
            (self, next),
            (Self::Validating, Self::PersistingUserTurn)
                | (Self::PersistingUserTurn, Self::Generating)
                | (Self::Generating, Self::Streaming)
                | (Self::Streaming, Self::PersistingAssistantTurn)
                | (Self::PersistingAssistantTurn, Self::Terminal { .. })
                | (
                    Self::Validating | Self::PersistingUserTurn,
                    Self::Terminal { succeeded: false }
                )
        );
        ensure!(
            allowed,
            PhaseRejectedSnafu {
                stage: "chat-phase-advance",
                from: self,
                to: next,
            }
        );
        Ok(next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

struct PhaseTracker {
    conversation_id: Option<ConversationId>,
    phase: ChatPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            conversation_id: None,
            phase: ChatPhase::Validating,
        }
    }

    fn advance(&mut self, next: ChatPhase) -> ChatResult<()> {
        let previous = self.phase;
        self.phase = previous.advance(next)?;
        tracing::debug!(
            conversation_id = ?self.conversation_id,
            from = ?previous,
            to = ?next,
            "chat phase transition"
        );
        Ok(())
    }

    fn advance_or_log(&mut self, next: ChatPhase) {
        if let Err(error) = self.advance(next) {
            tracing::warn!(error = %error, "ignored chat phase transition");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeStatus {
    Complete,
    Failed(String),
}

/// Final report of a chat exchange, available after the assistant turn was
/// persisted (or its persistence failed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub conversation_id: ConversationId,
    pub user_message_id: MessageId,
    pub assistant_message_id: Option<MessageId>,
    pub text: String,
    pub status: ExchangeStatus,
    pub wire_delivered: bool,
    pub persistence_error: Option<String>,
    pub final_phase: ChatPhase,
}

/// Records for the caller, in emission order, ending with one terminal record.
pub struct WireStream {
    fragments: mpsc::UnboundedReceiver<Fragment>,
}

impl Stream for WireStream {
    type Item = WireRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<WireRecord>> {
        self.get_mut()
            .fragments
            .poll_recv(cx)
            .map(|fragment| fragment.map(wire_record))
    }
}

pub fn wire_record(fragment: Fragment) -> WireRecord {
    match fragment {
        Fragment::Text(text) => WireRecord::text(text),
        Fragment::Done => WireRecord::done(),
        Fragment::Error(reason) => WireRecord::error(reason),
    }
}

/// A chat request that passed validation and has its user turn stored.
///
/// Dropping `records` only stops delivery; `exchange` keeps running until the
/// assistant turn is persisted.
pub struct ChatStream {
    pub conversation_id: ConversationId,
    pub user_message: MessageRecord,
    pub records: WireStream,
    pub exchange: JoinHandle<ExchangeOutcome>,
}

/// Serialises the writes of one conversation: the guard is taken before the
/// user turn is stored and released after the assistant turn is stored.
#[derive(Default)]
struct ConversationLocks {
    locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    async fn acquire(&self, conversation_id: ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(conversation_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct ChatOrchestrator {
    generator: Arc<dyn Generator>,
    persister: ExchangePersister,
    conversation_locks: ConversationLocks,
    exchanges: TaskTracker,
}

impl ChatOrchestrator {
    pub fn new(store: Arc<dyn Storage>, generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            persister: ExchangePersister::new(store),
            conversation_locks: ConversationLocks::default(),
            exchanges: TaskTracker::new(),
        }
    }

    pub fn persister(&self) -> &ExchangePersister {
        &self.persister
    }

    /// Waits until every started exchange has persisted its assistant turn.
    pub async fn shutdown(&self) {
        self.exchanges.close();
        tracing::info!(pending = self.exchanges.len(), "waiting for chat exchanges");
        self.exchanges.wait().await;
    }

    /// Validates the request, stores the user turn, then starts generation.
    ///
    /// Errors returned here happen before any fragment is produced. Once this
    /// returns `Ok`, every failure is reported as a terminal wire record and
    /// the assistant turn is still persisted.
    pub async fn handle(&self, request: ChatRequest) -> ChatResult<ChatStream> {
        let mut tracker = PhaseTracker::new();

        let (conversation_id, user_content) = match validate_request(&request) {
            Ok(validated) => validated,
            Err(error) => {
                tracker.advance_or_log(ChatPhase::Terminal { succeeded: false });
                tracing::info!(error = %error, "rejected chat request");
                return Err(error);
            }
        };
        tracker.conversation_id = Some(conversation_id);
        let write_guard = self.conversation_locks.acquire(conversation_id).await;
        tracker.advance(ChatPhase::PersistingUserTurn)?;

        let user_message = match self
            .persister
            .persist_user_turn(conversation_id, user_content)
            .await
        {
            Ok(record) => record,
            Err(error) => {
                tracker.advance_or_log(ChatPhase::Terminal { succeeded: false });
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to persist user turn"
                );
                return Err(error);
            }
        };
        tracker.advance(ChatPhase::Generating)?;

        let prompt = build_transcript(&request.messages);
        let params = GenerationParams::from(request.params);
        let generation = match self.generator.generate(prompt, params) {
            Ok(handle) => handle,
            Err(source) => {
                let error = ChatError::GenerationFailure {
                    stage: "orchestrator-generate",
                    source,
                };
                tracing::error!(
                    conversation_id = %conversation_id,
                    generator = %self.generator.id(),
                    error = %error,
                    "generator failed to start"
                );
                GenerationHandle::failed(error.to_string())
            }
        };
        tracker.advance(ChatPhase::Streaming)?;

        let GenerationHandle { stream, worker } = generation;
        tokio::spawn(worker);
        let split = tee(stream);

        let persister = self.persister.clone();
        let user_message_id = user_message.id;
        let completion = split.completion;
        let exchange = self.exchanges.spawn(async move {
            let tee_outcome = completion.wait().await;
            tracker.advance_or_log(ChatPhase::PersistingAssistantTurn);

            let accumulated = tee_outcome.accumulated;
            let status = match &accumulated.terminal {
                Terminal::Done => ExchangeStatus::Complete,
                Terminal::Error(reason) => ExchangeStatus::Failed(reason.clone()),
            };

            let (assistant_message_id, persistence_error) = match persister
                .persist_assistant_turn(conversation_id, &accumulated)
                .await
            {
                Ok(record) => (Some(record.id), None),
                Err(error) => {
                    tracing::error!(
                        conversation_id = %conversation_id,
                        wire_delivered = tee_outcome.wire_delivered,
                        error = %error,
                        "failed to persist assistant turn after delivery"
                    );
                    (None, Some(error.to_string()))
                }
            };
            drop(write_guard);

            let succeeded = status == ExchangeStatus::Complete && persistence_error.is_none();
            tracker.advance_or_log(ChatPhase::Terminal { succeeded });
            tracing::info!(
                conversation_id = %conversation_id,
                succeeded,
                wire_delivered = tee_outcome.wire_delivered,
                fragments = tee_outcome.fragments_read,
                "chat exchange finished"
            );

            ExchangeOutcome {
                conversation_id,
                user_message_id,
                assistant_message_id,
                text: accumulated.text,
                status,
                wire_delivered: tee_outcome.wire_delivered,
                persistence_error,
                final_phase: tracker.phase,
            }
        });

        Ok(ChatStream {
            conversation_id,
            user_message,
            records: WireStream {
                fragments: split.wire,
            },
            exchange,
        })
    }
}

fn validate_request(request: &ChatRequest) -> ChatResult<(ConversationId, &str)> {
    let raw_id = request
        .conversation_id
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .context(InvalidRequestSnafu {
            stage: "validate-conversation-id",
            details: "conversationId is required",
        })?;
    let conversation_id =
        ConversationId::parse(raw_id).map_err(|_| ChatError::InvalidRequest {
            stage: "validate-conversation-id",
            details: format!("conversationId '{raw_id}' is not a valid id"),
        })?;

    let last_turn = request.last_turn().context(InvalidRequestSnafu {
        stage: "validate-messages",
        details: "messages must not be empty",
    })?;
    ensure!(
        last_turn.role == Role::User,
        InvalidRequestSnafu {
            stage: "validate-last-role",
            details: format!("last message must come from the user, got {}", last_turn.role),
        }
    );

    Ok((conversation_id, last_turn.content.as_str()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use immix_llm::ScriptedGenerator;
    use immix_storage::{
        ConversationStore, MemoryStorage, MessageRole, MessageStore, NewConversation,
    };
    use immix_wire::ChatTurn;

    use super::*;

    async fn setup(
        generator: ScriptedGenerator,
    ) -> (Arc<MemoryStorage>, ChatOrchestrator, ConversationId) {
        let store = Arc::new(MemoryStorage::new());
        let conversation = store
            .create_conversation(NewConversation::new("owner-1", "t"))
            .await
            .unwrap();
        let orchestrator = ChatOrchestrator::new(store.clone(), Arc::new(generator));
        (store, orchestrator, conversation.id)
    }

    fn hello(conversation_id: ConversationId) -> ChatRequest {
        ChatRequest::new(
            conversation_id.to_string(),
            vec![ChatTurn::new(Role::User, "Hello")],
        )
    }

    #[test]
    fn phases_cannot_be_skipped() {
        assert!(
            ChatPhase::Validating
                .advance(ChatPhase::Generating)
                .is_err()
        );
        assert!(
            ChatPhase::Streaming
                .advance(ChatPhase::Terminal { succeeded: true })
                .is_err()
        );
        assert!(
            ChatPhase::Generating
                .advance(ChatPhase::Terminal { succeeded: false })
                .is_err()
        );
        assert!(
            ChatPhase::Validating
                .advance(ChatPhase::Terminal { succeeded: false })
                .unwrap()
                .is_terminal()
        );
    }

    #[tokio::test]
    async fn streams_and_persists_a_complete_exchange() {
        let (store, orchestrator, conversation_id) =
            setup(ScriptedGenerator::completing(["Hel", "lo!"])).await;

        let chat = orchestrator.handle(hello(conversation_id)).await.unwrap();
        let records: Vec<WireRecord> = chat.records.collect().await;
        assert_eq!(
            records,
            vec![
                WireRecord::text("Hel"),
                WireRecord::text("lo!"),
                WireRecord::done()
            ]
        );

        let outcome = chat.exchange.await.unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Complete);
        assert_eq!(outcome.text, "Hello!");
        assert_eq!(outcome.final_phase, ChatPhase::Terminal { succeeded: true });

        let stored = store.list_messages(conversation_id).await.unwrap();
        let pairs: Vec<(MessageRole, &str)> = stored
            .iter()
            .map(|message| (message.role, message.content.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (MessageRole::User, "Hello"),
                (MessageRole::Assistant, "Hello!")
            ]
        );
    }

    #[tokio::test]
    async fn immediate_generation_error_still_stores_an_empty_failed_turn() {
        let (store, orchestrator, conversation_id) =
            setup(ScriptedGenerator::failing(Vec::<String>::new(), "Stream failed")).await;

        let chat = orchestrator.handle(hello(conversation_id)).await.unwrap();
        let records: Vec<WireRecord> = chat.records.collect().await;
        assert_eq!(records, vec![WireRecord::error("Stream failed")]);

        let outcome = chat.exchange.await.unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Failed("Stream failed".to_string()));

        let stored = store.list_messages(conversation_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "");
        assert_eq!(stored[1].metadata.as_ref().unwrap()["status"], "failed");
    }

    #[tokio::test]
    async fn invalid_requests_have_no_side_effects() {
        let generator = ScriptedGenerator::completing(["x"]);
        let (store, orchestrator, conversation_id) = setup(generator).await;

        let mut assistant_last = hello(conversation_id);
        assistant_last
            .messages
            .push(ChatTurn::new(Role::Assistant, "Hi"));
        let missing_id = ChatRequest {
            conversation_id: None,
            ..hello(conversation_id)
        };
        let malformed_id = ChatRequest::new("C1", vec![ChatTurn::new(Role::User, "Hello")]);
        let empty = ChatRequest::new(conversation_id.to_string(), Vec::new());

        for request in [assistant_last, missing_id, malformed_id, empty] {
            let error = orchestrator.handle(request).await.err().unwrap();
            assert!(matches!(error, ChatError::InvalidRequest { .. }));
        }
        assert!(store.list_messages(conversation_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_turn_failure_stops_before_generation() {
        let generator = Arc::new(ScriptedGenerator::completing(["x"]));
        let store = Arc::new(MemoryStorage::new());
        let conversation = store
            .create_conversation(NewConversation::new("owner-1", "t"))
            .await
            .unwrap();
        let orchestrator = ChatOrchestrator::new(store.clone(), generator.clone());
        store.fail_message_writes(Some(MessageRole::User)).await;

        let error = orchestrator
            .handle(hello(conversation.id))
            .await
            .err()
            .unwrap();
        assert!(matches!(error, ChatError::PersistenceFailure { .. }));
        assert!(generator.prompts().is_empty());
    }

    #[tokio::test]
    async fn assistant_persistence_failure_does_not_touch_the_wire() {
        let (store, orchestrator, conversation_id) =
            setup(ScriptedGenerator::completing(["Hel", "lo!"])).await;
        store.fail_message_writes(Some(MessageRole::Assistant)).await;

        let chat = orchestrator.handle(hello(conversation_id)).await.unwrap();
        let records: Vec<WireRecord> = chat.records.collect().await;
        assert_eq!(records.last(), Some(&WireRecord::done()));

        let outcome = chat.exchange.await.unwrap();
        assert_eq!(outcome.status, ExchangeStatus::Complete);
        assert!(outcome.persistence_error.is_some());
        assert_eq!(outcome.final_phase, ChatPhase::Terminal { succeeded: false });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn back_to_back_exchanges_store_turns_in_order() {
        let generator = ScriptedGenerator::completing(["o", "k"])
            .with_fragment_delay(Duration::from_millis(5));
        let (store, orchestrator, conversation_id) = setup(generator).await;

        let first = orchestrator.handle(hello(conversation_id)).await.unwrap();
        let records: Vec<WireRecord> = first.records.collect().await;
        assert_eq!(records.last(), Some(&WireRecord::done()));

        let follow_up = ChatRequest::new(
            conversation_id.to_string(),
            vec![
                ChatTurn::new(Role::User, "Hello"),
                ChatTurn::new(Role::Assistant, "ok"),
                ChatTurn::new(Role::User, "Again"),
            ],
        );
        let second = orchestrator.handle(follow_up).await.unwrap();
        let _: Vec<WireRecord> = second.records.collect().await;
        first.exchange.await.unwrap();
        second.exchange.await.unwrap();

        let stored: Vec<String> = store
            .list_messages(conversation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|message| message.content)
            .collect();
        assert_eq!(stored, ["Hello", "ok", "Again", "ok"]);
    }

    #[tokio::test]
    async fn shutdown_waits_for_abandoned_exchanges() {
        let generator = ScriptedGenerator::completing(["a", "b", "c"])
            .with_fragment_delay(Duration::from_millis(10));
        let (store, orchestrator, conversation_id) = setup(generator).await;

        let chat = orchestrator.handle(hello(conversation_id)).await.unwrap();
        drop(chat.records);
        orchestrator.shutdown().await;

        let stored = store.list_messages(conversation_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, "abc");
    }

    #[tokio::test]
    async fn prompt_is_the_role_tagged_history() {
        let generator = Arc::new(ScriptedGenerator::completing(["ok"]));
        let store = Arc::new(MemoryStorage::new());
        let conversation = store
            .create_conversation(NewConversation::new("owner-1", "t"))
            .await
            .unwrap();
        let orchestrator = ChatOrchestrator::new(store.clone(), generator.clone());

        let request = ChatRequest::new(
            conversation.id.to_string(),
            vec![
                ChatTurn::new(Role::User, "Hi"),
                ChatTurn::new(Role::Assistant, "Hello"),
                ChatTurn::new(Role::User, "How are you?"),
            ],
        );
        let chat = orchestrator.handle(request).await.unwrap();
        chat.exchange.await.unwrap();

        assert_eq!(
            generator.prompts(),
            vec!["user: Hi\nassistant: Hello\nuser: How are you?".to_string()]
        );
    }
}
