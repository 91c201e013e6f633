// Shared state handed to every request
use crate::config::GenerationSettings;
use crate::runtime::ModelRuntime;
use std::sync::Arc;

/// Built once at startup and never mutated afterwards.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<dyn ModelRuntime>,
    pub generation: GenerationSettings,
}

impl AppState {
    pub fn new(runtime: Arc<dyn ModelRuntime>, generation: GenerationSettings) -> Self {
        Self {
            runtime,
            generation,
        }
    }
}
