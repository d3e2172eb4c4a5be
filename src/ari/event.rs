//! # PBX Events
//!
//! Decoding of the ARI event stream. Only the boundary fields are interpreted
//! (`type`, `channel.id`, `channel.name`, `channel.caller.number`,
//! `channel.state`, `digit`, `args`); everything else is ignored.
//!
//! Decoding never fails. A well-formed event of a type the bridge does not
//! act on (`ChannelVarset`, `BridgeCreated`, ...) becomes `AriEvent::Ignored`.
//! Anything malformed, including a handled type missing the fields it needs,
//! becomes `AriEvent::Unknown` carrying the raw payload.

use serde::Deserialize;

/// A decoded PBX event, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AriEvent {
    CallStarted {
        channel: String,
        caller: String,
        /// Technology-prefixed channel name, e.g. `PJSIP/1001-00000001`.
        name: String,
        args: Vec<String>,
    },
    CallEnded {
        channel: String,
    },
    DtmfReceived {
        channel: String,
        digit: String,
    },
    ChannelStateChanged {
        channel: String,
        state: String,
    },
    /// A valid event the bridge has no use for.
    Ignored {
        kind: String,
    },
    /// A payload that could not be decoded.
    Unknown {
        raw: String,
    },
}

impl AriEvent {
    /// Channel the event refers to, if any.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            AriEvent::CallStarted { channel, .. }
            | AriEvent::CallEnded { channel }
            | AriEvent::DtmfReceived { channel, .. }
            | AriEvent::ChannelStateChanged { channel, .. } => Some(channel),
            AriEvent::Ignored { .. } | AriEvent::Unknown { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AriEvent::CallStarted { .. } => "call_started",
            AriEvent::CallEnded { .. } => "call_ended",
            AriEvent::DtmfReceived { .. } => "dtmf_received",
            AriEvent::ChannelStateChanged { .. } => "channel_state_changed",
            AriEvent::Ignored { .. } => "ignored",
            AriEvent::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    channel: Option<RawChannel>,
    #[serde(default)]
    args: Vec<String>,
    digit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    name: String,
    state: Option<String>,
    caller: Option<RawCaller>,
}

#[derive(Debug, Deserialize)]
struct RawCaller {
    #[serde(default)]
    number: String,
}

/// Decode one text frame from the event stream.
pub fn decode(text: &str) -> AriEvent {
    let unknown = || AriEvent::Unknown {
        raw: text.to_string(),
    };

    let raw: RawEvent = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(_) => return unknown(),
    };

    const HANDLED: [&str; 6] = [
        "StasisStart",
        "StasisEnd",
        "ChannelDestroyed",
        "ChannelHangupRequest",
        "ChannelDtmfReceived",
        "ChannelStateChange",
    ];
    if !HANDLED.contains(&raw.kind.as_str()) {
        return AriEvent::Ignored { kind: raw.kind };
    }

    let Some(channel) = raw.channel else {
        return unknown();
    };

    match raw.kind.as_str() {
        "StasisStart" => AriEvent::CallStarted {
            caller: channel.caller.map(|c| c.number).unwrap_or_default(),
            name: channel.name,
            channel: channel.id,
            args: raw.args,
        },
        "StasisEnd" | "ChannelDestroyed" | "ChannelHangupRequest" => AriEvent::CallEnded {
            channel: channel.id,
        },
        "ChannelDtmfReceived" => match raw.digit {
            Some(digit) => AriEvent::DtmfReceived {
                channel: channel.id,
                digit,
            },
            None => unknown(),
        },
        "ChannelStateChange" => match channel.state {
            Some(state) => AriEvent::ChannelStateChanged {
                channel: channel.id,
                state,
            },
            None => unknown(),
        },
        _ => unknown(),
    }
}
