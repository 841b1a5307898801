use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::queue::TaskQueue;
use crate::registry::FileRegistry;
use crate::store::StateStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Job and file records with expiry.
    pub store: StateStore,
    pub registry: FileRegistry,
    pub queue: Arc<dyn TaskQueue>,
    /// Per-route request quotas.
    pub admission: AdmissionController,
    pub config: Arc<Config>,
}
