use immix_wire::WireError;
use snafu::Snafu;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("no conversation is active"))]
    NoActiveConversation { stage: &'static str },
    #[snafu(display("conversation '{conversation_id}' already has a streaming reply"))]
    StoreBusy {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("generation failed: {reason}"))]
    Generation { stage: &'static str, reason: String },
    #[snafu(display("response stream ended before a terminal record"))]
    StreamInterrupted { stage: &'static str },
    #[snafu(display("request failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("server answered {status} on `{stage}`: {message}"))]
    Backend {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("malformed stream record on `{stage}`: {source}"))]
    Decode {
        stage: &'static str,
        source: WireError,
    },
}

impl ClientError {
    /// Whether resending the same message can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Generation { .. } | Self::StreamInterrupted { .. } | Self::Transport { .. } => {
                true
            }
            Self::Backend { status, .. } => *status >= 500,
            Self::NoActiveConversation { .. } | Self::StoreBusy { .. } | Self::Decode { .. } => {
                false
            }
        }
    }
}
