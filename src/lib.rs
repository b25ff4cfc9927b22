pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::WorkerConfig;
use crate::services::queue::WorkQueue;
use crate::services::staging::StagingArea;
use crate::services::storage::ObjectStore;
use std::sync::Arc;

/// Everything a worker needs, resolved once at startup and passed explicitly.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<WorkerConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub staging: StagingArea,
}

impl WorkerContext {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        let staging = StagingArea::from_config(&config);
        Self {
            config: Arc::new(config),
            store,
            queue,
            staging,
        }
    }
}
