use std::sync::Arc;

use crate::provider::DriverRegistry;
use crate::run::Orchestrator;
use crate::store::DocumentStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DriverRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn DocumentStore>,
}

impl AppState {
    pub fn new(
        registry: Arc<DriverRegistry>,
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            store,
        }
    }
}
