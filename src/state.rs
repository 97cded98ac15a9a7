//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::sessions::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Every live bridge session, shell and file transfer alike.
    pub registry: SessionRegistry,
    pub bridge: Arc<Bridge>,
}

impl AppState {
    pub fn new(config: Arc<Config>, bridge: Bridge) -> Self {
        Self {
            registry: SessionRegistry::new(config.server.max_sessions),
            config,
            start_time: Instant::now(),
            bridge: Arc::new(bridge),
        }
    }
}
