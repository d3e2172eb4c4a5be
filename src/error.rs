//! # Error Handling
//!
//! Two error families live here:
//!
//! - **`BridgeError`**: the call-bridging taxonomy. Every per-call failure is
//!   expressed as one of these variants and contained inside the Call Session
//!   that produced it.
//! - **`AppError`**: errors returned by the ops HTTP handlers, converted into
//!   JSON responses through actix-web's `ResponseError`.
//!
//! ## Propagation policy:
//! - `Auth` / `Network` / `Timeout` at connection level are retried with backoff
//! - `TransportClosed` and `Expired` steer a session toward `Ending`
//! - `Decode` is logged and the offending event or frame is dropped
//! - Nothing in this module is ever allowed to bring down the process mid-call

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures that can occur while bridging a call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BridgeError {
    /// Credentials were rejected by the PBX or the AI provider.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Transient connectivity problem.
    #[error("network error: {0}")]
    Network(String),

    /// The external media socket has closed.
    #[error("media transport closed")]
    TransportClosed,

    /// A malformed event or frame.
    #[error("decode error: {0}")]
    Decode(String),

    /// The AI session is about to hit the provider's hard duration limit.
    #[error("AI session expired")]
    Expired,

    /// A bounded operation did not finish in time.
    #[error("timed out while {0}")]
    Timeout(String),

    /// The PBX rejected a call-control command.
    #[error("PBX command failed: {0}")]
    Command(String),

    /// The session registry is full.
    #[error("session capacity reached ({0} active calls)")]
    Capacity(usize),
}

impl BridgeError {
    /// Short machine-readable label, used in logs and call records.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Auth(_) => "auth",
            BridgeError::Network(_) => "network",
            BridgeError::TransportClosed => "transport_closed",
            BridgeError::Decode(_) => "decode",
            BridgeError::Expired => "expired",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::Command(_) => "command",
            BridgeError::Capacity(_) => "capacity",
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => BridgeError::TransportClosed,
            ErrorKind::TimedOut => BridgeError::Timeout(err.to_string()),
            _ => BridgeError::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return BridgeError::Timeout(format!("waiting for PBX: {}", err));
        }
        match err.status() {
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                BridgeError::Auth(err.to_string())
            }
            Some(_) => BridgeError::Command(err.to_string()),
            None => BridgeError::Network(err.to_string()),
        }
    }
}

impl From<tungstenite::Error> for BridgeError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let status = response.status().as_u16();
                if status == 401 || status == 403 {
                    BridgeError::Auth(format!("websocket upgrade rejected with HTTP {}", status))
                } else {
                    BridgeError::Network(format!("websocket upgrade failed with HTTP {}", status))
                }
            }
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                BridgeError::Network("websocket closed".to_string())
            }
            tungstenite::Error::Io(io) => BridgeError::Network(io.to_string()),
            other => BridgeError::Network(other.to_string()),
        }
    }
}

/// Errors returned by the ops HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500
/// - NotFound → 404
/// - Bridge(Capacity) → 503, other bridge failures → 502
#[derive(Debug)]
pub enum AppError {
    /// Unexpected server-side failure
    Internal(String),

    /// Requested call does not exist
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// A bridging failure surfaced through the API
    Bridge(BridgeError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Bridge(err) => write!(f, "Bridge error: {}", err),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            AppError::Bridge(err @ BridgeError::Capacity(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, err.kind(), err.to_string())
            }
            AppError::Bridge(err) => (StatusCode::BAD_GATEWAY, err.kind(), err.to_string()),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        AppError::Bridge(err)
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(BridgeError::Auth("bad".into()).kind(), "auth");
        assert_eq!(BridgeError::TransportClosed.kind(), "transport_closed");
        assert_eq!(BridgeError::Timeout("slow".into()).kind(), "timeout");
        assert_eq!(BridgeError::Capacity(4).kind(), "capacity");
    }

    #[test]
    fn test_io_error_mapping() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(BridgeError::from(eof), BridgeError::TransportClosed);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(BridgeError::from(refused), BridgeError::Network(_)));
    }

    #[test]
    fn test_capacity_maps_to_service_unavailable() {
        let response = AppError::Bridge(BridgeError::Capacity(3)).error_response();
        assert_eq!(response.status().as_u16(), 503);

        let response = AppError::NotFound("c1".into()).error_response();
        assert_eq!(response.status().as_u16(), 404);
    }
}
