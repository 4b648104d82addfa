// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use mediaq_core::{BatchRegistry, Executor, Hub, JobManager, JobService, MediaqConfig};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub config: MediaqConfig,
    /// Scheduler, hub and executor glue.
    pub jobs: Arc<JobService>,
    pub batches: BatchRegistry,
}

impl AppState {
    /// Build the job service from `config` around the given executor.
    pub fn new(config: MediaqConfig, executor: Arc<dyn Executor>) -> Arc<Self> {
        let hub = Arc::new(Hub::new(config.hub.buffer_size));
        let jobs = JobService::new(
            JobManager::new(config.scheduler.max_concurrent),
            hub,
            executor,
        );
        let batches = BatchRegistry::new(Arc::clone(&jobs), config.storage.tmp_dir.clone());
        Arc::new(Self {
            start_time: Instant::now(),
            config,
            jobs,
            batches,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
