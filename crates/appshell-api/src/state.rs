//! Application state

use appshell_core::{WorkerConfig, WorkerHost};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Handle used to render the Prometheus exposition
pub type MetricsHandle = PrometheusHandle;

/// Largest request body accepted for interception (16MB)
pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<WorkerHost>,
    /// Configuration new workers are derived from on update
    pub worker_config: WorkerConfig,
    pub body_limit: usize,
}

impl AppState {
    pub fn new(host: Arc<WorkerHost>, worker_config: WorkerConfig) -> Self {
        Self {
            host,
            worker_config,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }
}
