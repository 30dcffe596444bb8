//! Wire contracts shared by the chat server and its clients.
//!
//! The chat endpoint answers with a text event stream of `data: <JSON>\n\n`
//! records; [`WireRecord`] is one such record and [`SseDecoder`] rebuilds
//! records from arbitrarily split byte chunks on the receiving side.
pub mod decoder;
pub mod error;
pub mod record;
pub mod request;

pub use decoder::SseDecoder;
pub use error::{WireError, WireResult};
pub use record::{EVENT_STREAM_CONTENT_TYPE, WireRecord};
pub use request::{ChatRequest, ChatTurn, Role};
