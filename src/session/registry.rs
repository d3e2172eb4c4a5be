//! # Session Registry
//!
//! The one piece of state shared across calls: active `CallSession`s keyed by
//! channel id.
//!
//! ## Atomicity Guarantees:
//! - `get_or_create` runs under the map's per-key entry lock, so concurrent
//!   starts for one channel produce exactly one session
//! - The capacity slot is reserved inside the same entry lock
//! - Removal is idempotent; `remove_if_same` only removes the exact session
//!   instance it is handed, so a late cleanup can never evict a newer session
//!   that reused the channel id
//!
//! A periodic sweep reclaims sessions that stopped showing activity, which
//! covers calls whose end event was lost in an event-stream reconnect gap.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::session::call::CallSession;
use crate::session::state::EndReason;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<CallSession>>,
    /// External media channels, mapped to the call channel that owns them.
    auxiliary: DashMap<String, String>,
    active: AtomicUsize,
    capacity: usize,
    close_timeout: Duration,
}

impl SessionRegistry {
    /// ## Parameters:
    /// - **capacity**: maximum concurrent sessions
    /// - **close_timeout**: how long sweep/shutdown wait for a call's own cleanup
    pub fn new(capacity: usize, close_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            auxiliary: DashMap::new(),
            active: AtomicUsize::new(0),
            capacity,
            close_timeout,
        }
    }

    /// Return the session for `channel_id`, creating it if absent.
    ///
    /// ## Returns:
    /// - **Ok((session, true))**: a new session was inserted
    /// - **Ok((session, false))**: the existing session
    /// - **Err(Capacity)**: no session exists and the registry is full
    pub fn get_or_create(
        &self,
        channel_id: &str,
        caller: &str,
    ) -> Result<(Arc<CallSession>, bool), BridgeError> {
        match self.sessions.entry(channel_id.to_string()) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                let capacity = self.capacity;
                self.active
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < capacity).then_some(n + 1)
                    })
                    .map_err(|_| BridgeError::Capacity(capacity))?;

                let session = Arc::new(CallSession::new(channel_id, caller));
                entry.insert(session.clone());
                debug!(channel_id, caller, "Session registered");
                Ok((session, true))
            }
        }
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<CallSession>> {
        self.sessions.get(channel_id).map(|entry| entry.value().clone())
    }

    /// Remove the session for `channel_id`. Removing an absent id is a no-op.
    pub fn remove(&self, channel_id: &str) -> Option<Arc<CallSession>> {
        let removed = self.sessions.remove(channel_id).map(|(_, session)| session);
        if removed.is_some() {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Remove `session` only if it is still the registered instance.
    pub fn remove_if_same(&self, session: &Arc<CallSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.channel_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All active sessions, oldest first.
    pub fn list(&self) -> Vec<Arc<CallSession>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by_key(|session| session.created_at());
        sessions
    }

    pub fn register_auxiliary(&self, channel_id: &str, owner: &str) {
        self.auxiliary.insert(channel_id.to_string(), owner.to_string());
    }

    pub fn remove_auxiliary(&self, channel_id: &str) {
        self.auxiliary.remove(channel_id);
    }

    pub fn is_auxiliary(&self, channel_id: &str) -> bool {
        self.auxiliary.contains_key(channel_id)
    }

    /// Remove and close every session idle for longer than `max_idle`.
    ///
    /// Returns the swept channel ids. Each session is out of the map before
    /// it is closed, so a new call on the same channel gets a fresh session.
    pub async fn sweep(&self, max_idle: Duration) -> Vec<String> {
        let stale: Vec<Arc<CallSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > max_idle)
            .map(|entry| entry.value().clone())
            .collect();

        let removed: Vec<Arc<CallSession>> = stale
            .into_iter()
            .filter(|session| self.remove_if_same(session))
            .collect();

        if removed.is_empty() {
            return Vec::new();
        }

        let timeout = self.close_timeout;
        join_all(removed.iter().map(|session| {
            info!(
                channel_id = %session.channel_id(),
                idle_secs = session.idle_for().as_secs(),
                "Sweeping idle call"
            );
            session.close(EndReason::IdleTimeout, timeout)
        }))
        .await;

        removed.iter().map(|session| session.channel_id().to_string()).collect()
    }

    /// Run `sweep` every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = self.sweep(max_idle).await;
                        if !swept.is_empty() {
                            info!(count = swept.len(), "Sweep reclaimed idle calls");
                        }
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }

    /// End every active call and wait (bounded) for each to close.
    ///
    /// Event intake must already be stopped, so no new call can reuse a
    /// channel id while this runs.
    pub async fn shutdown_all(&self) {
        if self.is_empty() {
            return;
        }

        let sessions = self.list();
        info!(count = sessions.len(), "Ending active calls for shutdown");
        let timeout = self.close_timeout;
        join_all(sessions.iter().map(|session| session.close(EndReason::Shutdown, timeout))).await;

        // Lifecycle tasks usually removed themselves already.
        for session in &sessions {
            self.remove(session.channel_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::CallState;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(8, Duration::from_millis(200)))
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_session() {
        for round in 0..20 {
            let registry = registry();
            let channel = format!("c{}", round);
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let registry = registry.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move { registry.get_or_create(&channel, "1001").unwrap() })
                })
                .collect();

            let mut created = 0;
            let mut first: Option<Arc<CallSession>> = None;
            for handle in handles {
                let (session, was_created) = handle.await.unwrap();
                if was_created {
                    created += 1;
                }
                match &first {
                    Some(existing) => assert!(Arc::ptr_eq(existing, &session)),
                    None => first = Some(session),
                }
            }
            assert_eq!(created, 1);
            assert_eq!(registry.len(), 1);
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = registry();
        registry.get_or_create("c1", "1001").unwrap();
        assert!(registry.remove("c1").is_some());
        assert!(registry.remove("c1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_same_spares_newer_session() {
        let registry = registry();
        let (old, _) = registry.get_or_create("c1", "1001").unwrap();
        registry.remove("c1");
        let (new, created) = registry.get_or_create("c1", "1001").unwrap();
        assert!(created);

        assert!(!registry.remove_if_same(&old));
        assert!(registry.get("c1").is_some());
        assert!(registry.remove_if_same(&new));
        assert!(!registry.remove_if_same(&new));
    }

    #[test]
    fn test_capacity_is_enforced_and_released() {
        let registry = SessionRegistry::new(2, Duration::from_millis(10));
        registry.get_or_create("c1", "1").unwrap();
        registry.get_or_create("c2", "2").unwrap();
        // Existing sessions are still returned when full.
        assert!(!registry.get_or_create("c1", "1").unwrap().1);
        assert_eq!(registry.get_or_create("c3", "3").unwrap_err(), BridgeError::Capacity(2));

        registry.remove("c1");
        assert!(registry.get_or_create("c3", "3").unwrap().1);
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_and_allows_new_session() {
        let registry = registry();
        let (stale, _) = registry.get_or_create("c1", "1001").unwrap();
        stale.transition(CallState::Answering);
        let (_fresh, _) = registry.get_or_create("c2", "1002").unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.get("c2").unwrap().touch();

        let swept = registry.sweep(Duration::from_millis(40)).await;
        assert_eq!(swept, vec!["c1".to_string()]);
        assert_eq!(stale.state(), CallState::Closed);
        assert_eq!(stale.end_reason(), Some(EndReason::IdleTimeout));
        assert!(registry.get("c1").is_none());
        assert!(registry.get("c2").is_some());

        let (replacement, created) = registry.get_or_create("c1", "1001").unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&replacement, &stale));
        assert_eq!(replacement.state(), CallState::Starting);
    }

    #[tokio::test]
    async fn test_sweeper_runs_on_interval() {
        let registry = registry();
        registry.get_or_create("c1", "1001").unwrap();
        let cancel = CancellationToken::new();
        let handle = registry
            .clone()
            .spawn_sweeper(Duration::from_millis(20), Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_all_closes_everything() {
        let registry = registry();
        let (a, _) = registry.get_or_create("c1", "1").unwrap();
        let (b, _) = registry.get_or_create("c2", "2").unwrap();

        registry.shutdown_all().await;
        assert!(registry.is_empty());
        assert_eq!(a.state(), CallState::Closed);
        assert_eq!(b.end_reason(), Some(EndReason::Shutdown));

        // Idempotent, and the freed slots are reusable.
        registry.shutdown_all().await;
        let (c, created) = registry.get_or_create("c1", "1").unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_auxiliary_channels() {
        let registry = registry();
        registry.register_auxiliary("media-1", "c1");
        assert!(registry.is_auxiliary("media-1"));
        registry.remove_auxiliary("media-1");
        assert!(!registry.is_auxiliary("media-1"));
    }
}
