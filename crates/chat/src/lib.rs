//! Server side of the chat pipeline: request orchestration, the stream tee
//! and exchange persistence, plus the HTTP surface that exposes them.
pub mod config;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod persister;
pub mod prompt;
pub mod tee;

pub use config::{ConfigError, GeneratorSettings, ServerSettings};
pub use error::{ChatError, ChatResult, ServerError};
pub use http::{AppState, router};
pub use orchestrator::{ChatOrchestrator, ChatPhase, ChatStream, ExchangeOutcome, ExchangeStatus};
pub use persister::ExchangePersister;
pub use tee::{Accumulated, Tee, TeeOutcome, Terminal, tee};
