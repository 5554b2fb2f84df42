//! Application state shared across handlers.

use gleaner_core::config::AppConfig;
use gleaner_gc::GcEngine;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration, frozen at startup.
    pub config: Arc<AppConfig>,
    /// The GC engine every admin endpoint delegates to.
    pub engine: Arc<GcEngine>,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<GcEngine>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }
}
