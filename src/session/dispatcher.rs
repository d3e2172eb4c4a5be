//! # Event Dispatcher
//!
//! Consumes the PBX event sequence and routes each event to the session
//! layer. Dispatch never blocks on a call: new calls get their own lifecycle
//! task, everything else is a registry lookup plus a signal.
//!
//! ## Routing:
//! - `CallStarted` → `get_or_create`; a newly created session gets a
//!   lifecycle task, a duplicate start is ignored, a call over capacity is
//!   hung up without entering the registry
//! - `CallEnded` → end requested with `RemoteHangup`
//! - `DtmfReceived` / `ChannelStateChanged` → activity recorded and logged
//! - `Ignored` → counted, logged at debug
//! - `Unknown` → counted as dropped, warning
//!
//! External media channels re-enter the application as calls of their own;
//! they are recognised (registered auxiliary ids, `UnicastRTP/` and
//! `AudioSocket/` channel names) and ignored.

use futures_util::{Stream, StreamExt};
use tracing::{debug, info, trace, warn};

use crate::ari::AriEvent;
use crate::error::BridgeError;
use crate::session::lifecycle::run_call;
use crate::session::state::EndReason;
use crate::session::CallContext;

const AUXILIARY_PREFIXES: [&str; 2] = ["UnicastRTP/", "AudioSocket/"];

pub struct CallDispatcher {
    ctx: CallContext,
}

impl CallDispatcher {
    pub fn new(ctx: CallContext) -> Self {
        Self { ctx }
    }

    /// Dispatch events until the sequence ends.
    pub async fn run<S>(&self, mut events: S)
    where
        S: Stream<Item = AriEvent> + Unpin,
    {
        while let Some(event) = events.next().await {
            self.dispatch(event);
        }
        debug!("Event sequence ended, dispatcher stopping");
    }

    /// Route one event. Must be called from within a tokio runtime.
    pub fn dispatch(&self, event: AriEvent) {
        trace!(kind = event.kind(), channel_id = ?event.channel_id(), "PBX event");
        match event {
            AriEvent::CallStarted {
                channel,
                caller,
                name,
                args,
            } => {
                if self.is_auxiliary(&channel, &name) {
                    debug!(channel_id = %channel, name = %name, "Ignoring external media channel");
                    return;
                }
                self.start_call(channel, caller, args);
            }
            AriEvent::CallEnded { channel } => {
                if self.ctx.registry.is_auxiliary(&channel) {
                    return;
                }
                match self.ctx.registry.get(&channel) {
                    Some(session) => {
                        session.request_end(EndReason::RemoteHangup);
                    }
                    None => debug!(channel_id = %channel, "End event for unknown call"),
                }
            }
            AriEvent::DtmfReceived { channel, digit } => {
                if let Some(session) = self.ctx.registry.get(&channel) {
                    session.record_dtmf();
                    info!(channel_id = %channel, digit = %digit, "DTMF received");
                }
            }
            AriEvent::ChannelStateChanged { channel, state } => {
                if let Some(session) = self.ctx.registry.get(&channel) {
                    session.touch();
                    debug!(channel_id = %channel, pbx_state = %state, "Channel state changed");
                }
            }
            AriEvent::Ignored { kind } => {
                self.ctx.stats.event_ignored();
                debug!(kind = %kind, "Ignoring unhandled PBX event");
            }
            AriEvent::Unknown { raw } => {
                self.ctx.stats.event_dropped();
                let preview: String = raw.chars().take(160).collect();
                warn!(len = raw.len(), payload = %preview, "Dropping unrecognised PBX event");
            }
        }
    }

    fn is_auxiliary(&self, channel: &str, name: &str) -> bool {
        self.ctx.registry.is_auxiliary(channel)
            || AUXILIARY_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
    }

    fn start_call(&self, channel: String, caller: String, args: Vec<String>) {
        match self.ctx.registry.get_or_create(&channel, &caller) {
            Ok((session, true)) => {
                self.ctx.stats.call_started();
                info!(channel_id = %channel, caller = %caller, args = ?args, "Call started");
                tokio::spawn(run_call(session, self.ctx.clone()));
            }
            Ok((_, false)) => {
                debug!(channel_id = %channel, "Duplicate start for active call ignored");
            }
            Err(BridgeError::Capacity(limit)) => {
                self.ctx.stats.call_rejected();
                warn!(channel_id = %channel, limit, "Session capacity reached, rejecting call");
                let commands = self.ctx.commands.clone();
                tokio::spawn(async move {
                    if let Err(e) = commands.hangup(&channel).await {
                        warn!(channel_id = %channel, error = %e, "Failed to hang up rejected call");
                    }
                });
            }
            Err(e) => {
                warn!(channel_id = %channel, error = %e, "Could not create session");
            }
        }
    }
}
