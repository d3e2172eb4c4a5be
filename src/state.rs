//! # Application State
//!
//! Shared state handed to every ops HTTP handler through `web::Data`.
//!
//! ## Contents:
//! - **config**: the validated configuration, read-only after startup
//! - **registry**: live call sessions (same instance the dispatcher uses)
//! - **stats**: process-wide call counters
//! - **stream**: PBX event stream connectivity
//!
//! Everything is behind `Arc` or atomics, so cloning the state per worker is
//! cheap and handlers never lock anything across an await.

use std::sync::Arc;
use std::time::Instant;

use crate::ari::StreamStatus;
use crate::config::AppConfig;
use crate::session::{CallStats, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SessionRegistry>,
    pub stats: Arc<CallStats>,
    pub stream: StreamStatus,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<SessionRegistry>,
        stats: Arc<CallStats>,
        stream: StreamStatus,
    ) -> Self {
        Self {
            config,
            registry,
            stats,
            stream,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
