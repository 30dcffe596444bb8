use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use immix_llm::{GeneratorConfig, GeneratorResult, Model, ModelHandle, STUB_PROVIDER_ID};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const CONFIG_FILE_NAME: &str = "immix.json";
pub const CONFIG_PATH_ENV: &str = "IMMIX_CONFIG";
pub const ENV_PREFIX: &str = "IMMIX_";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DATA_DIRECTORY_NAME: &str = "immix";
const DATABASE_FILE_NAME: &str = "immix.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub provider: String,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub models: Vec<String>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            provider: STUB_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: String::new(),
            model: DEFAULT_MODEL.to_string(),
            models: Vec::new(),
        }
    }
}

impl GeneratorSettings {
    fn normalized(mut self) -> Self {
        self.provider = self.provider.trim().to_ascii_lowercase();
        if self.provider.is_empty() {
            self.provider = STUB_PROVIDER_ID.to_string();
        }
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = DEFAULT_MODEL.to_string();
        }
        self.models = self
            .models
            .into_iter()
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .collect();
        self.models.dedup();
        self
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(&self.provider, &self.api_key, &self.endpoint)
    }

    pub fn model_handle(&self) -> GeneratorResult<ModelHandle> {
        let models = self.models.iter().cloned().map(Model::from_id).collect();
        ModelHandle::new(&self.model, models)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// sqlite path or URL; `":memory:"` selects the in-process store.
    pub database_url: String,
    pub generator: GeneratorSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database_url: default_database_path().display().to_string(),
            generator: GeneratorSettings::default(),
        }
    }
}

impl ServerSettings {
    /// Defaults, then the JSON file, then `IMMIX_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults and environment");
        }

        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let settings = figment.extract::<Self>().context(ExtractSnafu {
            stage: "extract-server-settings",
        })?;
        Ok(settings.normalized())
    }

    fn normalized(mut self) -> Self {
        self.host = self.host.trim().to_string();
        if self.host.is_empty() {
            self.host = DEFAULT_HOST.to_string();
        }
        self.database_url = self.database_url.trim().to_string();
        if self.database_url.is_empty() {
            self.database_url = default_database_path().display().to_string();
        }
        self.generator = self.generator.normalized();
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(DATA_DIRECTORY_NAME).join(DATABASE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(DATABASE_FILE_NAME))
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to load server settings on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}
