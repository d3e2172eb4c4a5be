//! # AI Session Adapter
//!
//! One streaming connection per call to the cloud speech API.
//!
//! ## Layers:
//! - **`AiConnector`**: opens the raw provider link. Audio on a link is always
//!   at the provider's rate. `realtime::RealtimeConnector` is the production
//!   implementation; tests plug in channel-backed fakes.
//! - **`AiSession`**: wraps a link with the call-facing contract: resampling
//!   in both directions and the expiry deadline.

pub mod realtime;
pub mod session;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::AudioFrame;
use crate::config::AiConfig;
use crate::error::BridgeError;

pub use realtime::RealtimeConnector;
pub use session::{AiReceiver, AiSender, AiSession, AiSessionGuard};

/// Who said a transcribed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Agent,
}

/// Something the AI side produced for the call.
#[derive(Debug, Clone, PartialEq)]
pub enum AiEvent {
    /// Agent speech.
    Audio(AudioFrame),
    /// A finished transcript line.
    Transcript { speaker: Speaker, text: String },
    /// The provider heard the caller start talking (barge-in).
    SpeechStarted,
    /// The agent finished its current spoken response.
    ResponseDone,
    /// The session is about to hit the provider's duration limit.
    Expired,
}

/// A freshly opened provider link.
///
/// `outbound` accepts frames at the provider rate; `inbound` ends when the
/// remote session closes. `task`, when present, is the pump driving the
/// underlying connection and is aborted on close.
pub struct AiLink {
    pub outbound: mpsc::Sender<AudioFrame>,
    pub inbound: mpsc::Receiver<AiEvent>,
    pub task: Option<JoinHandle<()>>,
}

/// Opens provider links.
#[async_trait]
pub trait AiConnector: Send + Sync {
    async fn connect(&self, config: &AiConfig) -> Result<AiLink, BridgeError>;
}
