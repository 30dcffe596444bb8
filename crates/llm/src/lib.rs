//! Generator adapter: turns a prompt into a finite, ordered sequence of
//! [`Fragment`]s that always ends with exactly one terminal marker.
pub mod error;
pub mod fragment;
pub mod generator;
pub mod model;
pub mod rig_adapter;
pub mod scripted;
pub mod stub;

use std::sync::Arc;

pub use error::{GeneratorError, GeneratorResult};
pub use fragment::{Fragment, GenerationParams, UNTERMINATED_STREAM_REASON};
pub use generator::{
    FragmentSender, FragmentStream, GenerationHandle, Generator, GeneratorWorker,
    make_fragment_stream,
};
pub use model::{Model, ModelHandle};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigGenerator};
pub use scripted::ScriptedGenerator;
pub use stub::{STUB_PROVIDER_ID, StubGenerator};

/// Connection settings for a generator backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl GeneratorConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_ascii_lowercase(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Builds the generator named by `config.provider_id`.
///
/// An OpenAI-compatible provider without an API key falls back to the stub so
/// the pipeline stays usable on machines without credentials.
pub fn create_generator(
    config: GeneratorConfig,
    models: Arc<ModelHandle>,
) -> GeneratorResult<Arc<dyn Generator>> {
    match config.provider_id.as_str() {
        STUB_PROVIDER_ID => Ok(Arc::new(StubGenerator::new(models))),
        RIG_OPENAI_PROVIDER_ID if config.api_key.is_empty() => {
            tracing::warn!(
                provider_id = %config.provider_id,
                "no API key configured; falling back to the stub generator"
            );
            Ok(Arc::new(StubGenerator::new(models)))
        }
        RIG_OPENAI_PROVIDER_ID => Ok(Arc::new(RigGenerator::new(config, models)?)),
        other => error::UnsupportedProviderSnafu {
            stage: "create-generator",
            provider_id: other.to_string(),
        }
        .fail(),
    }
}
