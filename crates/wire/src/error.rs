use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WireError {
    #[snafu(display("failed to encode wire record on `{stage}`: {source}"))]
    EncodeRecord {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode wire record '{payload}' on `{stage}`: {source}"))]
    DecodeRecord {
        stage: &'static str,
        payload: String,
        source: serde_json::Error,
    },
    #[snafu(display("wire record '{payload}' is not a valid record on `{stage}`"))]
    UnexpectedRecord {
        stage: &'static str,
        payload: String,
    },
    #[snafu(display("wire event is not valid utf-8 on `{stage}`: {source}"))]
    InvalidUtf8 {
        stage: &'static str,
        source: std::str::Utf8Error,
    },
}

pub type WireResult<T> = Result<T, WireError>;
