use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use snafu::ensure;

use super::error::{GeneratorResult, UnknownModelSnafu};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Model {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Process-scoped selection of the active model.
///
/// Generators read the current id once per `generate` call, so a switch only
/// affects generations started after it.
#[derive(Debug)]
pub struct ModelHandle {
    current: ArcSwap<String>,
    available: Vec<Model>,
}

impl ModelHandle {
    /// `default_model` joins `available` when it is not already listed.
    pub fn new(default_model: &str, available: Vec<Model>) -> GeneratorResult<Self> {
        let default_model = default_model.trim();
        ensure!(
            !default_model.is_empty(),
            UnknownModelSnafu {
                stage: "model-handle-new",
                model_id: default_model.to_string(),
            }
        );

        let mut available = available;
        if !available.iter().any(|model| model.id == default_model) {
            available.insert(0, Model::from_id(default_model));
        }

        Ok(Self {
            current: ArcSwap::from_pointee(default_model.to_string()),
            available,
        })
    }

    pub fn current(&self) -> Arc<String> {
        self.current.load_full()
    }

    pub fn available(&self) -> &[Model] {
        &self.available
    }

    pub fn switch(&self, model_id: &str) -> GeneratorResult<Arc<String>> {
        let model_id = model_id.trim();
        ensure!(
            self.available.iter().any(|model| model.id == model_id),
            UnknownModelSnafu {
                stage: "model-handle-switch",
                model_id: model_id.to_string(),
            }
        );

        let next = Arc::new(model_id.to_string());
        let previous = self.current.swap(Arc::clone(&next));
        tracing::info!(from = %previous, to = %next, "switched active model");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeneratorError;

    #[test]
    fn switches_only_between_configured_models() {
        let handle = ModelHandle::new(
            "gpt-4o-mini",
            vec![Model::from_id("gpt-4o"), Model::from_id("gpt-4o-mini")],
        )
        .unwrap();
        assert_eq!(handle.available().len(), 2);

        let held = handle.current();
        handle.switch("gpt-4o").unwrap();
        assert_eq!(handle.current().as_str(), "gpt-4o");
        assert_eq!(held.as_str(), "gpt-4o-mini");

        let error = handle.switch("made-up").unwrap_err();
        assert!(matches!(error, GeneratorError::UnknownModel { .. }));
        assert_eq!(handle.current().as_str(), "gpt-4o");
    }

    #[test]
    fn default_model_is_always_listed() {
        let handle = ModelHandle::new("local", Vec::new()).unwrap();
        assert_eq!(handle.available(), &[Model::from_id("local")]);
        assert!(ModelHandle::new("  ", Vec::new()).is_err());
    }
}
