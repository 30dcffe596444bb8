use snafu::Snafu;

pub type GeneratorResult<T> = Result<T, GeneratorError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GeneratorError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("generation prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("model '{model_id}' is not in the configured model list"))]
    UnknownModel {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}
