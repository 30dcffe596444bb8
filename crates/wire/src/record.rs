use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use super::error::{DecodeRecordSnafu, EncodeRecordSnafu, UnexpectedRecordSnafu, WireResult};

/// Content type announced by the chat endpoint.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

const DATA_PREFIX: &str = "data: ";
const RECORD_TERMINATOR: &str = "\n\n";

/// One record of the chat event stream.
///
/// Content chunks serialize as `{"text": ..}`; the stream always ends with exactly
/// one terminal record, either `{"done": true}` or `{"error": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireRecord {
    Text { text: String },
    Done { done: bool },
    Error { error: String },
}

impl WireRecord {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn done() -> Self {
        Self::Done { done: true }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            error: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { done: true } | Self::Error { .. })
    }

    /// JSON payload carried after the `data: ` prefix.
    pub fn to_json(&self) -> WireResult<String> {
        serde_json::to_string(self).context(EncodeRecordSnafu {
            stage: "wire-record-to-json",
        })
    }

    /// Full event-stream framing: `data: <JSON>\n\n`.
    pub fn encode(&self) -> WireResult<String> {
        let payload = self.to_json()?;
        Ok(format!("{DATA_PREFIX}{payload}{RECORD_TERMINATOR}"))
    }

    /// Parses one record payload. `{"done": false}` is rejected: only
    /// `true` marks completion.
    pub fn from_json(payload: &str) -> WireResult<Self> {
        let record: Self = serde_json::from_str(payload).context(DecodeRecordSnafu {
            stage: "wire-record-from-json",
            payload: payload.to_string(),
        })?;
        ensure!(
            !matches!(record, Self::Done { done: false }),
            UnexpectedRecordSnafu {
                stage: "wire-record-from-json",
                payload: payload.to_string(),
            }
        );
        Ok(record)
    }
}
