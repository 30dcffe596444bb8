use immix_llm::GeneratorError;
use immix_storage::StorageError;
use snafu::Snafu;

use super::config::ConfigError;
use super::orchestrator::ChatPhase;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    /// Rejected before any side effect.
    #[snafu(display("invalid chat request: {details}"))]
    InvalidRequest {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("conversation '{conversation_id}' does not exist"))]
    UnknownConversation {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("failed to persist {role} turn on `{stage}`: {source}"))]
    PersistenceFailure {
        stage: &'static str,
        role: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to start generation on `{stage}`: {source}"))]
    GenerationFailure {
        stage: &'static str,
        source: GeneratorError,
    },
    #[snafu(display("chat exchange cannot move from {from:?} to {to:?}"))]
    PhaseRejected {
        stage: &'static str,
        from: ChatPhase,
        to: ChatPhase,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ServerError {
    #[snafu(display("failed to load configuration: {source}"))]
    LoadConfig {
        stage: &'static str,
        source: ConfigError,
    },
    #[snafu(display("failed to open storage '{database_url}': {source}"))]
    OpenStorage {
        stage: &'static str,
        database_url: String,
        source: StorageError,
    },
    #[snafu(display("failed to configure generator: {source}"))]
    ConfigureGenerator {
        stage: &'static str,
        source: GeneratorError,
    },
    #[snafu(display("failed to bind {address}: {source}"))]
    Bind {
        stage: &'static str,
        address: String,
        source: std::io::Error,
    },
    #[snafu(display("server stopped with an error: {source}"))]
    Serve {
        stage: &'static str,
        source: std::io::Error,
    },
}
