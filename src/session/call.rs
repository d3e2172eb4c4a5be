//! # Call Session
//!
//! Shared per-call state. The lifecycle task (`lifecycle::run_call`) drives a
//! session through its states; the dispatcher, the registry sweep and the
//! ops API only ever *request* an end, which cancels the session's tasks and
//! lets the lifecycle task run cleanup.
//!
//! ## Thread Safety:
//! Everything here is atomics, a `watch` channel for the state and a small
//! mutex for the end reason, so a session can be shared as `Arc<CallSession>`
//! between the registry and its own tasks without an outer lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::state::{CallState, EndReason};

/// Per-call audio and event counters.
#[derive(Debug, Default)]
pub struct CallCounters {
    frames_from_pbx: AtomicU64,
    frames_to_pbx: AtomicU64,
    talk_frames: AtomicU64,
    silence_frames: AtomicU64,
    transcripts: AtomicU64,
    dtmf_digits: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub frames_from_pbx: u64,
    pub frames_to_pbx: u64,
    pub talk_frames: u64,
    pub silence_frames: u64,
    pub transcripts: u64,
    pub dtmf_digits: u64,
}

impl CallCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_from_pbx: self.frames_from_pbx.load(Ordering::Relaxed),
            frames_to_pbx: self.frames_to_pbx.load(Ordering::Relaxed),
            talk_frames: self.talk_frames.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
            transcripts: self.transcripts.load(Ordering::Relaxed),
            dtmf_digits: self.dtmf_digits.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of a call for the ops API.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub channel_id: String,
    pub caller: String,
    pub session_id: Uuid,
    pub state: CallState,
    pub answered: bool,
    pub created_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub idle_secs: f64,
    pub end_reason: Option<String>,
    pub counters: CounterSnapshot,
}

#[derive(Debug)]
pub struct CallSession {
    channel_id: String,
    caller: String,
    session_id: Uuid,
    created_at: DateTime<Utc>,
    started: Instant,
    /// Milliseconds after `started` of the last activity.
    last_activity_ms: AtomicU64,
    state: watch::Sender<CallState>,
    answered: AtomicBool,
    counters: CallCounters,
    end_reason: Mutex<Option<EndReason>>,
    cancel: CancellationToken,
    driver_attached: AtomicBool,
}

impl CallSession {
    pub fn new(channel_id: impl Into<String>, caller: impl Into<String>) -> Self {
        let (state, _) = watch::channel(CallState::Starting);
        Self {
            channel_id: channel_id.into(),
            caller: caller.into(),
            session_id: Uuid::new_v4(),
            created_at: Utc::now(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            state,
            answered: AtomicBool::new(false),
            counters: CallCounters::default(),
            end_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            driver_attached: AtomicBool::new(false),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` (and changes nothing) for a disallowed transition, e.g.
    /// a late failure trying to leave `Closed`.
    pub fn transition(&self, next: CallState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                self.touch();
                info!(
                    channel_id = %self.channel_id,
                    from = %from,
                    to = %next,
                    "Call state changed"
                );
                true
            }
            None => {
                debug!(
                    channel_id = %self.channel_id,
                    current = %self.state(),
                    requested = %next,
                    "Ignoring disallowed state transition"
                );
                false
            }
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last activity.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub fn mark_answered(&self) {
        self.answered.store(true, Ordering::Release);
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }

    pub fn record_inbound_frame(&self, silent: bool) {
        self.counters.frames_from_pbx.fetch_add(1, Ordering::Relaxed);
        if silent {
            self.counters.silence_frames.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.talk_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_outbound_frame(&self) {
        self.counters.frames_to_pbx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transcript(&self) {
        self.counters.transcripts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dtmf(&self) {
        self.counters.dtmf_digits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Ask the call to end. The first reason wins; later requests only log.
    /// Returns whether this request was the first.
    pub fn request_end(&self, reason: EndReason) -> bool {
        let first = {
            let mut slot = self.end_reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(reason.clone());
                true
            } else {
                false
            }
        };

        if first {
            info!(channel_id = %self.channel_id, reason = %reason, "Call end requested");
        } else {
            debug!(channel_id = %self.channel_id, reason = %reason, "Call already ending");
        }
        self.cancel.cancel();
        first
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn end_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once an end has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Token for tasks that must stop when the call ends.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Mark that a lifecycle task owns this session and will run cleanup.
    pub fn attach_driver(&self) {
        self.driver_attached.store(true, Ordering::Release);
    }

    /// Wait until the session reaches `Closed`.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let closed = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal()))
            .await
            .map(|waited| waited.is_ok());
        closed.unwrap_or(false)
    }

    /// End the call and wait for it to close.
    ///
    /// With a lifecycle task attached this waits (bounded) for its cleanup.
    /// Without one, or when cleanup overruns, the state is forced to `Closed`.
    pub async fn close(&self, reason: EndReason, timeout: Duration) -> CallState {
        self.request_end(reason.clone());

        if self.driver_attached.load(Ordering::Acquire) {
            if self.wait_closed(timeout).await {
                return CallState::Closed;
            }
            warn!(
                channel_id = %self.channel_id,
                state = %self.state(),
                "Call cleanup overran, forcing closed"
            );
        }

        if !self.state().is_finishing() {
            self.transition(reason.target_state());
        }
        self.transition(CallState::Closed);
        self.state()
    }

    pub fn summary(&self) -> CallSummary {
        CallSummary {
            channel_id: self.channel_id.clone(),
            caller: self.caller.clone(),
            session_id: self.session_id,
            state: self.state(),
            answered: self.is_answered(),
            created_at: self.created_at,
            duration_secs: self.age().as_secs_f64(),
            idle_secs: self.idle_for().as_secs_f64(),
            end_reason: self.end_reason().map(|r| r.to_string()),
            counters: self.counters(),
        }
    }
}
