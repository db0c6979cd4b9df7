//! Shared application state for the Axum API server.

use std::sync::Arc;

use axion_common::config::AppConfig;
use axion_notifier::queue::JobQueue;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(queue: Arc<dyn JobQueue>, config: AppConfig) -> Self {
        Self { queue, config }
    }
}
