use std::sync::Arc;

use immix_llm::{Generator, ModelHandle};
use immix_storage::Storage;

use crate::orchestrator::ChatOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Storage>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub models: Arc<ModelHandle>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Storage>,
        generator: Arc<dyn Generator>,
        models: Arc<ModelHandle>,
    ) -> Self {
        Self {
            orchestrator: Arc::new(ChatOrchestrator::new(store.clone(), generator)),
            store,
            models,
        }
    }
}
