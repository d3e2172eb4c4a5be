//! # Call Sessions
//!
//! Everything that happens to one call between its start event and its
//! removal from the registry.
//!
//! ## Key Components:
//! - **state**: lifecycle states and end reasons
//! - **call**: the shared `CallSession` record
//! - **registry**: concurrency-safe map of active sessions plus the idle sweep
//! - **lifecycle**: the per-call driver (setup, bridge, cleanup)
//! - **bridge**: the two relay directions between media socket and AI
//! - **dispatcher**: routes PBX events to sessions
//! - **record**: call-completion records

pub mod bridge;
pub mod call;
pub mod dispatcher;
pub mod lifecycle;
pub mod record;
pub mod registry;
pub mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::ai::AiConnector;
use crate::ari::PbxCommands;
use crate::config::AppConfig;

pub use call::{CallSession, CallSummary};
pub use dispatcher::CallDispatcher;
pub use record::CallRecordSink;
pub use registry::SessionRegistry;
pub use state::{CallState, EndReason};

/// Process-wide call counters for the metrics endpoint.
#[derive(Debug, Default)]
pub struct CallStats {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    events_dropped: AtomicU64,
    events_ignored: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CallStatsSnapshot {
    pub calls_started: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub calls_rejected: u64,
    pub events_dropped: u64,
    pub events_ignored: u64,
}

impl CallStats {
    pub fn call_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished call as completed or failed.
    pub fn call_finished(&self, reason: &EndReason) {
        match reason {
            EndReason::Failed(_) => self.failed.fetch_add(1, Ordering::Relaxed),
            _ => self.completed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn call_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_ignored(&self) {
        self.events_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CallStatsSnapshot {
        CallStatsSnapshot {
            calls_started: self.started.load(Ordering::Relaxed),
            calls_completed: self.completed.load(Ordering::Relaxed),
            calls_failed: self.failed.load(Ordering::Relaxed),
            calls_rejected: self.rejected.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
        }
    }
}

/// Collaborators a call needs, shared by every call.
#[derive(Clone)]
pub struct CallContext {
    pub config: Arc<AppConfig>,
    pub commands: Arc<dyn PbxCommands>,
    pub ai: Arc<dyn AiConnector>,
    pub registry: Arc<SessionRegistry>,
    pub records: CallRecordSink,
    pub stats: Arc<CallStats>,
}
