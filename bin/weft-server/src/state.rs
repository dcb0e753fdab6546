//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use weft_cluster::Controller;
use weft_qos::QosMonitor;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Request router over the worker fleet.
    pub controller: Controller,
    /// SLO monitor fed by the edge's per-request measurements.
    pub qos: QosMonitor,
}
