//! # Call Lifecycle States
//!
//! ```text
//! Starting → Answering → MediaBound → Bridging → Ending → Closed
//!     └──────────┴────────────┴───────────┴──→ Error ──→ Closed
//! ```
//!
//! Any of the first four states may also move straight to `Ending` when the
//! call is torn down on purpose (remote hangup, operator, sweep, shutdown).
//! `Error` is reserved for failures. Both `Ending` and `Error` run the same
//! cleanup before `Closed`, which is terminal.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Starting,
    Answering,
    MediaBound,
    Bridging,
    Ending,
    Error,
    Closed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Starting => "starting",
            CallState::Answering => "answering",
            CallState::MediaBound => "media_bound",
            CallState::Bridging => "bridging",
            CallState::Ending => "ending",
            CallState::Error => "error",
            CallState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == CallState::Closed
    }

    /// `Ending`, `Error` and `Closed`: the call is on its way out.
    pub fn is_finishing(&self) -> bool {
        matches!(self, CallState::Ending | CallState::Error | CallState::Closed)
    }

    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Starting, Answering) | (Answering, MediaBound) | (MediaBound, Bridging) => true,
            (Starting | Answering | MediaBound | Bridging, Ending | Error) => true,
            (Ending | Error, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The PBX reported the channel gone.
    RemoteHangup,
    /// The AI session reached its deadline and was not renewed.
    AiExpired,
    /// The AI provider closed the session.
    AiClosed,
    /// The media socket closed or timed out.
    TransportClosed,
    /// Reclaimed by the registry sweep.
    IdleTimeout,
    /// Hung up through the ops API.
    Operator,
    /// Process shutdown.
    Shutdown,
    /// A setup step or the bridge failed.
    Failed(String),
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::RemoteHangup => "remote_hangup",
            EndReason::AiExpired => "ai_expired",
            EndReason::AiClosed => "ai_closed",
            EndReason::TransportClosed => "transport_closed",
            EndReason::IdleTimeout => "idle_timeout",
            EndReason::Operator => "operator",
            EndReason::Shutdown => "shutdown",
            EndReason::Failed(_) => "failed",
        }
    }

    /// State a session moves to when it ends for this reason.
    pub fn target_state(&self) -> CallState {
        match self {
            EndReason::Failed(_) => CallState::Error,
            _ => CallState::Ending,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Failed(detail) => write!(f, "failed: {}", detail),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CallState; 7] = [
        CallState::Starting,
        CallState::Answering,
        CallState::MediaBound,
        CallState::Bridging,
        CallState::Ending,
        CallState::Error,
        CallState::Closed,
    ];

    #[test]
    fn test_happy_path_is_allowed() {
        let path = [
            CallState::Starting,
            CallState::Answering,
            CallState::MediaBound,
            CallState::Bridging,
            CallState::Ending,
            CallState::Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_reachable_from_first_four_only() {
        for state in ALL {
            let expected = matches!(
                state,
                CallState::Starting | CallState::Answering | CallState::MediaBound | CallState::Bridging
            );
            assert_eq!(state.can_transition_to(CallState::Error), expected, "{}", state);
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(CallState::Closed.is_terminal());
        for state in ALL {
            assert!(!CallState::Closed.can_transition_to(state));
        }
        assert!(!CallState::Bridging.can_transition_to(CallState::Closed));
        assert!(!CallState::Bridging.can_transition_to(CallState::Starting));
    }

    #[test]
    fn test_failures_route_to_error() {
        assert_eq!(EndReason::Failed("x".into()).target_state(), CallState::Error);
        assert_eq!(EndReason::RemoteHangup.target_state(), CallState::Ending);
        assert_eq!(EndReason::Failed("no media".into()).to_string(), "failed: no media");
    }
}
