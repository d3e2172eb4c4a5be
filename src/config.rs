//! # Configuration Management
//!
//! Loads bridge configuration from multiple sources:
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (prefix `BRIDGE`, nested keys joined with `__`)
//! - Default values (the `Default` impl below)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (`HOST`, `PORT`, `OPENAI_API_KEY`)
//! 2. Environment variables (`BRIDGE_ARI__PASSWORD`, `BRIDGE_MEDIA__SAMPLE_RATE`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values
//!
//! ## Sections:
//! - **server**: ops HTTP endpoint (health, metrics, call listing)
//! - **ari**: PBX event stream and REST command interface
//! - **reconnect**: event stream backoff policy
//! - **media**: external media socket and native audio format
//! - **ai**: realtime speech API session
//! - **audio**: codec tuning (gain, silence detection)
//! - **sessions**: registry capacity, sweep and call records

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ari: AriConfig,
    pub reconnect: ReconnectConfig,
    pub media: MediaConfig,
    pub ai: AiConfig,
    pub audio: AudioConfig,
    pub sessions: SessionConfig,
}

/// Ops HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// PBX call-control settings (Asterisk REST Interface).
///
/// ## Fields:
/// - `base_url`: HTTP root of the PBX, e.g. `http://127.0.0.1:8088`
/// - `app_name`: Stasis application registered on the event stream
/// - `connect_timeout_ms`: bound on the event stream websocket handshake
/// - `ping_interval_ms`: keepalive ping period on the open event stream; a
///   stream silent for two periods (no events, no pongs) is treated as lost
/// - `external_media_transport` / `external_media_encapsulation`: passed
///   through verbatim when asking the PBX for an external media channel.
///   The default pair (`tcp`, `none`) streams raw signed-linear frames and is
///   meant for a PBX-side media adapter that speaks that format. Stock
///   Asterisk only accepts TCP with `audiosocket` encapsulation, whose framing
///   this bridge does not speak
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AriConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub app_name: String,
    pub command_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub external_media_transport: String,
    pub external_media_encapsulation: String,
}

/// Exponential backoff for the event stream reconnect loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

/// External media socket settings.
///
/// ## Frame size:
/// `sample_rate * frame_ms / 1000` samples of 16-bit mono PCM. Both ends share
/// this constant; there is no framing header on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Interface the per-call listeners bind to
    pub bind_host: String,
    /// Address the PBX is told to connect to
    pub advertise_host: String,
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub attach_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// A frame write to the PBX stalled longer than this closes the transport
    pub write_timeout_ms: u64,
    /// Upper bound on buffered AI speech waiting to be played to the caller
    pub playout_max_ms: u32,
}

/// Realtime speech API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub voice: String,
    pub instructions: String,
    pub sample_rate: u32,
    pub connect_timeout_ms: u64,
    /// A websocket write to the provider stalled longer than this drops the link
    pub send_timeout_ms: u64,
    /// Provider's hard limit on one streaming session
    pub max_session_secs: u64,
    /// How long before the hard limit `Expired` is raised
    pub expiry_margin_secs: u64,
    /// Open a fresh AI session on expiry instead of ending the call
    pub renew_on_expiry: bool,
}

/// Codec tuning applied to caller audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub target_rms: f64,
    pub max_gain: f64,
    pub silence_threshold: f64,
    pub normalize_inbound: bool,
}

/// Session registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub sweep_interval_secs: u64,
    pub max_idle_secs: u64,
    /// Optional JSON-lines file receiving call-completion records
    pub record_path: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            ari: AriConfig {
                base_url: "http://127.0.0.1:8088".to_string(),
                username: "asterisk".to_string(),
                password: "asterisk".to_string(),
                app_name: "voice-bridge".to_string(),
                command_timeout_ms: 5_000,
                connect_timeout_ms: 10_000,
                ping_interval_ms: 20_000,
                external_media_transport: "tcp".to_string(),
                external_media_encapsulation: "none".to_string(),
            },
            reconnect: ReconnectConfig {
                initial_backoff_ms: 1_000,
                max_backoff_ms: 30_000,
                multiplier: 2.0,
            },
            media: MediaConfig {
                bind_host: "0.0.0.0".to_string(),
                advertise_host: "127.0.0.1".to_string(),
                sample_rate: 8_000,
                frame_ms: 20,
                attach_timeout_ms: 5_000,
                read_timeout_ms: 10_000,
                write_timeout_ms: 1_000,
                playout_max_ms: 5_000,
            },
            ai: AiConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview".to_string(),
                api_key: String::new(),
                voice: "alloy".to_string(),
                instructions: "You are a helpful phone assistant. Keep answers short.".to_string(),
                sample_rate: 24_000,
                connect_timeout_ms: 10_000,
                send_timeout_ms: 5_000,
                max_session_secs: 1_800,
                expiry_margin_secs: 30,
                renew_on_expiry: false,
            },
            audio: AudioConfig {
                target_rms: 3_000.0,
                max_gain: 4.0,
                silence_threshold: 200.0,
                normalize_inbound: true,
            },
            sessions: SessionConfig {
                max_concurrent_sessions: 50,
                sweep_interval_secs: 30,
                max_idle_secs: 120,
                record_path: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `BRIDGE_ARI__BASE_URL=http://pbx:8088`
    /// - `BRIDGE_MEDIA__ADVERTISE_HOST=10.0.0.5`
    /// - `BRIDGE_AI__RENEW_ON_EXPIRY=true`
    /// - `HOST` / `PORT`: ops server address (deployment platforms)
    /// - `OPENAI_API_KEY`: AI provider key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("BRIDGE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("ai.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.ari.app_name.trim().is_empty() {
            return Err(anyhow::anyhow!("ARI application name cannot be empty"));
        }

        let timeouts = [
            ("ari.command_timeout_ms", self.ari.command_timeout_ms),
            ("ari.connect_timeout_ms", self.ari.connect_timeout_ms),
            ("ari.ping_interval_ms", self.ari.ping_interval_ms),
            ("media.attach_timeout_ms", self.media.attach_timeout_ms),
            ("media.read_timeout_ms", self.media.read_timeout_ms),
            ("media.write_timeout_ms", self.media.write_timeout_ms),
            ("ai.connect_timeout_ms", self.ai.connect_timeout_ms),
            ("ai.send_timeout_ms", self.ai.send_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(anyhow::anyhow!("{} must be greater than 0", name));
        }

        if self.reconnect.initial_backoff_ms == 0
            || self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms
        {
            return Err(anyhow::anyhow!(
                "Reconnect backoff must satisfy 0 < initial ({}) <= max ({})",
                self.reconnect.initial_backoff_ms,
                self.reconnect.max_backoff_ms
            ));
        }

        if self.reconnect.multiplier < 1.0 {
            return Err(anyhow::anyhow!("Reconnect multiplier must be at least 1.0"));
        }

        if self.media.sample_rate == 0 || self.ai.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if !(10..=100).contains(&self.media.frame_ms) {
            return Err(anyhow::anyhow!(
                "Frame duration must be between 10 and 100 ms, got {}",
                self.media.frame_ms
            ));
        }

        if (self.media.sample_rate * self.media.frame_ms) % 1000 != 0 {
            return Err(anyhow::anyhow!(
                "{} ms frames at {} Hz do not contain a whole number of samples",
                self.media.frame_ms,
                self.media.sample_rate
            ));
        }

        if self.ai.expiry_margin_secs >= self.ai.max_session_secs {
            return Err(anyhow::anyhow!(
                "AI expiry margin ({}s) must be smaller than the session limit ({}s)",
                self.ai.expiry_margin_secs,
                self.ai.max_session_secs
            ));
        }

        if self.audio.max_gain < 1.0 {
            return Err(anyhow::anyhow!("Maximum gain must be at least 1.0"));
        }

        if self.sessions.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Copy of the configuration with secrets masked, for the ops API.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.ari.password = mask(&copy.ari.password);
        copy.ai.api_key = mask(&copy.ai.api_key);
        copy
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "********".to_string()
    }
}

impl AriConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

impl MediaConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// PBX format name for the native rate (signed linear).
    pub fn pbx_format(&self) -> String {
        match self.sample_rate {
            8_000 => "slin".to_string(),
            rate => format!("slin{}", rate / 1000),
        }
    }
}

impl AiConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Usable lifetime of one AI session before `Expired` is raised.
    pub fn usable_session_duration(&self) -> Duration {
        Duration::from_secs(self.max_session_secs.saturating_sub(self.expiry_margin_secs))
    }
}

impl SessionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.media.sample_rate, 8_000);
        assert_eq!(config.media.frame_duration(), Duration::from_millis(20));
        assert_eq!(config.media.pbx_format(), "slin");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reconnect.initial_backoff_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.ai.expiry_margin_secs = config.ai.max_session_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.media.sample_rate = 11_025;
        config.media.frame_ms = 30;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.media.write_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.ari.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wideband_format_name() {
        let mut config = AppConfig::default();
        config.media.sample_rate = 16_000;
        assert_eq!(config.media.pbx_format(), "slin16");
    }

    #[test]
    fn test_redaction_masks_secrets() {
        let mut config = AppConfig::default();
        config.ai.api_key = "sk-live".to_string();
        let redacted = config.redacted();
        assert_eq!(redacted.ai.api_key, "********");
        assert_eq!(redacted.ari.password, "********");
        assert_eq!(redacted.ari.username, config.ari.username);
    }

    #[test]
    fn test_example_file_parses() {
        let raw = include_str!("../config.example.toml");
        let parsed: AppConfig = toml::from_str(raw).expect("example config should parse");
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.ari.app_name, "voice-bridge");
    }

    #[test]
    fn test_usable_session_duration() {
        let config = AppConfig::default();
        assert_eq!(config.ai.usable_session_duration(), Duration::from_secs(1_770));
    }
}
