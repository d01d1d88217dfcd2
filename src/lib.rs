pub mod app;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod features;
pub mod frontend;
pub mod handlers;
pub mod models;
pub mod telemetry;

use artifacts::ArtifactStore;
use frontend::Frontend;

/// Everything a request handler may read. Built once in `main` and never
/// mutated afterwards.
#[derive(Debug)]
pub struct AppState {
    pub store: ArtifactStore,
    pub frontend: Frontend,
}

impl AppState {
    pub fn new(store: ArtifactStore, frontend: Frontend) -> Self {
        Self { store, frontend }
    }
}
