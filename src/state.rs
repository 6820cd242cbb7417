//! Shared application state.

use crate::config::Config;
use crate::executor::Executor;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state. Everything in here is read-only apart from the
/// admission counters inside the executor.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            executor: Arc::new(Executor::new(config)),
            started_at: Instant::now(),
        }
    }
}
