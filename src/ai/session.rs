//! # AI Session
//!
//! Call-facing wrapper around one provider link.
//!
//! ## Responsibilities:
//! - **Rate conversion**: call-rate frames are resampled to the provider rate
//!   before sending, provider audio is resampled back to the call rate
//! - **Expiry**: the provider enforces a hard session duration. The session
//!   carries a deadline set `expiry_margin` before that limit; once it has
//!   passed, `send_audio` refuses frames and the receive side yields a single
//!   `AiEvent::Expired` so the call can renew or end gracefully
//!
//! ## Ownership:
//! The bridge splits a session into a sender (uplink task), a receiver
//! (downlink task) and a guard (held by the call) that tears the link down.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ai::{AiConnector, AiEvent, AiLink};
use crate::audio::codec;
use crate::audio::AudioFrame;
use crate::config::AiConfig;
use crate::error::BridgeError;

/// An open AI session with its expiry deadline.
pub struct AiSession {
    sender: AiSender,
    receiver: AiReceiver,
    guard: AiSessionGuard,
}

impl AiSession {
    /// Open a session whose usable lifetime comes from the configuration.
    ///
    /// ## Returns:
    /// - **Err(Auth | Network)**: provider rejected or unreachable
    /// - **Err(Timeout)**: no link within `connect_timeout`
    pub async fn open(
        connector: &dyn AiConnector,
        config: &AiConfig,
        call_rate: u32,
    ) -> Result<Self, BridgeError> {
        Self::open_with_lifetime(connector, config, call_rate, config.usable_session_duration()).await
    }

    /// Open a session that expires `lifetime` after the link is established.
    pub async fn open_with_lifetime(
        connector: &dyn AiConnector,
        config: &AiConfig,
        call_rate: u32,
        lifetime: Duration,
    ) -> Result<Self, BridgeError> {
        let timeout = config.connect_timeout();
        let link = tokio::time::timeout(timeout, connector.connect(config))
            .await
            .map_err(|_| BridgeError::Timeout(format!("connecting to the AI provider for {:?}", timeout)))??;

        let expires_at = Instant::now() + lifetime;
        info!(
            api_rate = config.sample_rate,
            call_rate,
            lifetime_secs = lifetime.as_secs(),
            "AI session opened"
        );

        Ok(Self::from_link(link, config.sample_rate, call_rate, expires_at))
    }

    fn from_link(link: AiLink, api_rate: u32, call_rate: u32, expires_at: Instant) -> Self {
        let AiLink {
            outbound,
            inbound,
            task,
        } = link;

        Self {
            sender: AiSender {
                outbound,
                api_rate,
                expires_at,
            },
            receiver: AiReceiver {
                inbound,
                call_rate,
                expires_at,
                expiry_signalled: false,
            },
            guard: AiSessionGuard { task },
        }
    }

    /// Separate the two directions so they can run in different tasks.
    /// Dropping or closing the guard closes the session.
    pub fn split(self) -> (AiSender, AiReceiver, AiSessionGuard) {
        (self.sender, self.receiver, self.guard)
    }
}

/// Outbound half: call audio headed for the provider.
#[derive(Clone)]
pub struct AiSender {
    outbound: mpsc::Sender<AudioFrame>,
    api_rate: u32,
    expires_at: Instant,
}

impl AiSender {
    /// Resample to the provider rate and forward.
    ///
    /// ## Returns:
    /// - **Err(Expired)**: the deadline has passed; the frame was not sent
    /// - **Err(Network)**: the provider link is gone
    pub async fn send_audio(&self, frame: AudioFrame) -> Result<(), BridgeError> {
        if self.is_expired() {
            return Err(BridgeError::Expired);
        }

        let frame = codec::resample(&frame, self.api_rate);
        self.outbound
            .send(frame)
            .await
            .map_err(|_| BridgeError::Network("AI session link closed".to_string()))
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Inbound half: provider output headed for the call.
pub struct AiReceiver {
    inbound: mpsc::Receiver<AiEvent>,
    call_rate: u32,
    expires_at: Instant,
    expiry_signalled: bool,
}

impl AiReceiver {
    /// Next event from the provider, audio already at the call rate.
    ///
    /// `Expired` is yielded exactly once, as soon as the deadline passes, ahead
    /// of any queued provider output. Returns `None` once the remote session
    /// has closed.
    pub async fn recv(&mut self) -> Option<AiEvent> {
        if !self.expiry_signalled {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(self.expires_at) => {
                    self.expiry_signalled = true;
                    debug!("AI session deadline reached");
                    return Some(AiEvent::Expired);
                }
                event = self.inbound.recv() => {
                    return event.map(|event| self.to_call_rate(event));
                }
            }
        }

        self.inbound.recv().await.map(|event| self.to_call_rate(event))
    }

    fn to_call_rate(&mut self, event: AiEvent) -> AiEvent {
        match event {
            AiEvent::Audio(frame) => AiEvent::Audio(codec::resample(&frame, self.call_rate)),
            AiEvent::Expired => {
                self.expiry_signalled = true;
                AiEvent::Expired
            }
            other => other,
        }
    }
}

/// Owns the provider pump; closing it tears the link down.
pub struct AiSessionGuard {
    task: Option<JoinHandle<()>>,
}

impl AiSessionGuard {
    /// Stop the provider pump. Idempotent.
    pub fn close(&mut self) {
        if let Some(handle) = self.task.take() {
            handle.abort();
            debug!("AI session closed");
        }
    }
}

impl Drop for AiSessionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Provider fake: hands out links whose far ends are kept for inspection.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub(crate) far_ends: Mutex<Vec<(mpsc::Receiver<AudioFrame>, mpsc::Sender<AiEvent>)>>,
        pub(crate) connects: AtomicUsize,
        pub(crate) fail_with: Option<BridgeError>,
    }

    impl FakeConnector {
        pub(crate) fn failing(error: BridgeError) -> Self {
            Self {
                fail_with: Some(error),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl AiConnector for FakeConnector {
        async fn connect(&self, _config: &AiConfig) -> Result<AiLink, BridgeError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = &self.fail_with {
                return Err(error.clone());
            }
            let (out_tx, out_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            self.far_ends.lock().await.push((out_rx, in_tx));
            Ok(AiLink {
                outbound: out_tx,
                inbound: in_rx,
                task: None,
            })
        }
    }

    struct HangingConnector;

    #[async_trait]
    impl AiConnector for HangingConnector {
        async fn connect(&self, _config: &AiConfig) -> Result<AiLink, BridgeError> {
            std::future::pending().await
        }
    }

    fn ai_config() -> AiConfig {
        AiConfig {
            sample_rate: 24_000,
            connect_timeout_ms: 50,
            ..crate::config::AppConfig::default().ai
        }
    }

    #[tokio::test]
    async fn test_audio_is_resampled_both_ways() {
        let connector = FakeConnector::default();
        let session = AiSession::open(&connector, &ai_config(), 8_000).await.unwrap();
        let (sender, mut receiver, _guard) = session.split();

        sender.send_audio(AudioFrame::silence(160, 8_000)).await.unwrap();
        let (mut provider_rx, provider_tx) = connector.far_ends.lock().await.pop().unwrap();
        let sent = provider_rx.recv().await.unwrap();
        assert_eq!(sent.sample_rate(), 24_000);
        assert_eq!(sent.len(), 480);

        provider_tx
            .send(AiEvent::Audio(AudioFrame::silence(480, 24_000)))
            .await
            .unwrap();
        match receiver.recv().await {
            Some(AiEvent::Audio(frame)) => {
                assert_eq!(frame.sample_rate(), 8_000);
                assert_eq!(frame.len(), 160);
            }
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_session_refuses_audio_and_signals_once() {
        let connector = FakeConnector::default();
        let session = AiSession::open_with_lifetime(&connector, &ai_config(), 8_000, Duration::from_millis(30))
            .await
            .unwrap();
        let (sender, mut receiver, _guard) = session.split();

        assert_eq!(receiver.recv().await, Some(AiEvent::Expired));
        assert!(sender.is_expired());
        assert_eq!(
            sender.send_audio(AudioFrame::silence(160, 8_000)).await,
            Err(BridgeError::Expired)
        );

        // No second Expired: the stream ends when the provider side goes away.
        connector.far_ends.lock().await.clear();
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_receive_ends_when_remote_closes() {
        let connector = FakeConnector::default();
        let (_sender, mut receiver, _guard) = AiSession::open(&connector, &ai_config(), 8_000).await.unwrap().split();

        let (_rx, tx) = connector.far_ends.lock().await.pop().unwrap();
        tx.send(AiEvent::SpeechStarted).await.unwrap();
        drop(tx);

        assert_eq!(receiver.recv().await, Some(AiEvent::SpeechStarted));
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn test_connect_is_bounded_by_timeout() {
        let result = AiSession::open(&HangingConnector, &ai_config(), 8_000).await;
        assert!(matches!(result, Err(BridgeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_auth_failure_is_surfaced() {
        let connector = FakeConnector::failing(BridgeError::Auth("bad key".into()));
        let result = AiSession::open(&connector, &ai_config(), 8_000).await;
        assert!(matches!(result, Err(BridgeError::Auth(_))));
    }

    #[tokio::test]
    async fn test_send_after_remote_close_is_network_error() {
        let connector = FakeConnector::default();
        let (sender, _receiver, _guard) = AiSession::open(&connector, &ai_config(), 8_000).await.unwrap().split();
        connector.far_ends.lock().await.clear();

        let result = sender.send_audio(AudioFrame::silence(160, 8_000)).await;
        assert!(matches!(result, Err(BridgeError::Network(_))));
    }
}
