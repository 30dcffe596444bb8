use std::sync::Arc;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::GeneratorConfig;
use super::error::{
    CompletionsFailedSnafu, EmptyPromptSnafu, GeneratorError, GeneratorResult, HttpClientSnafu,
    MissingApiKeySnafu,
};
use super::fragment::{Fragment, GenerationParams};
use super::generator::{
    FragmentSender, GenerationHandle, Generator, GeneratorWorker, make_fragment_stream,
};
use super::model::ModelHandle;

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// OpenAI-compatible generator backed by rig's streaming completions.
pub struct RigGenerator {
    config: GeneratorConfig,
    models: Arc<ModelHandle>,
}

impl RigGenerator {
    pub fn new(config: GeneratorConfig, models: Arc<ModelHandle>) -> GeneratorResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-generator-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config, models })
    }

    fn build_client(config: &GeneratorConfig) -> GeneratorResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn open_stream(
        config: &GeneratorConfig,
        model_id: &str,
        prompt: String,
        params: &GenerationParams,
    ) -> GeneratorResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(model_id);

        // The transcript already carries role tags, so it travels as one user turn.
        let mut builder = model.completion_request(RigMessage::user(prompt));

        if let Some(temperature) = params.temperature() {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = params.max_tokens() {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<Fragment>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(Fragment::Text(text.text))
            }
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: GeneratorConfig,
        model_id: Arc<String>,
        prompt: String,
        params: GenerationParams,
        sender: FragmentSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = match Self::open_stream(&config, &model_id, prompt, &params).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %model_id,
                    error = %error,
                    "failed to open generator stream"
                );
                sender.error(error.to_string()).await;
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Stop provider IO promptly; nobody is left to read a terminal.
                    tracing::debug!(model_id = %model_id, "generator stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(fragment) = Self::map_stream_item(item)
                                && !sender.send(fragment).await
                            {
                                stream.cancel();
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %model_id,
                                error = %source,
                                "generator stream emitted an error chunk"
                            );
                            let error = GeneratorError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            sender.error(error.to_string()).await;
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        sender.done().await;
    }
}

impl Generator for RigGenerator {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn generate(
        &self,
        prompt: String,
        params: GenerationParams,
    ) -> GeneratorResult<GenerationHandle> {
        ensure!(
            !prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "rig-generate"
            }
        );

        let model_id = self.models.current();
        tracing::debug!(
            provider_id = %self.config.provider_id,
            model_id = %model_id,
            prompt_chars = prompt.len(),
            "starting generation"
        );

        let (sender, stream, cancel_rx) = make_fragment_stream();
        let worker: GeneratorWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            model_id,
            prompt,
            params,
            sender,
            cancel_rx,
        ));

        Ok(GenerationHandle { stream, worker })
    }
}
