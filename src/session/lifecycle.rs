//! # Call Lifecycle
//!
//! `run_call` is the single task that owns a call from `Starting` to `Closed`.
//!
//! ## Setup:
//! 1. Answer the channel → `Answering`
//! 2. Bind a media listener and ask the PBX to attach external media to it
//! 3. Accept the PBX's media connection within the attach timeout → `MediaBound`
//! 4. Open the AI session → `Bridging`
//!
//! ## Cleanup (always, on every exit path):
//! `Ending`/`Error` → media and AI released → PBX resources released →
//! channel hung up (unless the PBX already ended it) → record emitted →
//! `Closed` → removed from the registry (only if still the registered
//! instance).

use std::future::Future;
use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::ai::AiSession;
use crate::ari::ExternalMedia;
use crate::error::BridgeError;
use crate::media::{MediaFormat, MediaListener, MediaTimeouts};
use crate::session::bridge;
use crate::session::call::CallSession;
use crate::session::record::CallRecord;
use crate::session::state::{CallState, EndReason};
use crate::session::CallContext;

/// PBX-side resources to release during cleanup.
#[derive(Default)]
struct Held {
    external_media: Option<ExternalMedia>,
}

/// Drive one call to `Closed`.
pub async fn run_call(session: Arc<CallSession>, ctx: CallContext) {
    session.attach_driver();
    let span = info_span!(
        "call",
        channel_id = %session.channel_id(),
        caller = %session.caller(),
        session_id = %session.session_id()
    );

    async move {
        let mut held = Held::default();
        let outcome = drive(&session, &ctx, &mut held).await;

        let proposed = match outcome {
            Ok(reason) => reason,
            Err(e) => {
                warn!(error = %e, kind = e.kind(), state = %session.state(), "Call failed");
                EndReason::Failed(e.to_string())
            }
        };
        session.request_end(proposed.clone());
        let reason = session.end_reason().unwrap_or(proposed);

        cleanup(&session, &ctx, held, &reason).await;
    }
    .instrument(span)
    .await
}

/// Run `fut` unless the call is ended first. `Ok(None)` means it was ended.
async fn or_ended<T, F>(session: &CallSession, fut: F) -> Result<Option<T>, BridgeError>
where
    F: Future<Output = Result<T, BridgeError>>,
{
    tokio::select! {
        biased;
        _ = session.cancelled() => Ok(None),
        result = fut => result.map(Some),
    }
}

async fn drive(session: &Arc<CallSession>, ctx: &CallContext, held: &mut Held) -> Result<EndReason, BridgeError> {
    let config = &ctx.config;
    let channel = session.channel_id();

    ctx.commands.answer(channel).await?;
    session.mark_answered();
    if session.end_requested() || !session.transition(CallState::Answering) {
        return Ok(bridge::pending_end(session));
    }

    let listener = MediaListener::start_server(
        &config.media.bind_host,
        0,
        MediaFormat::from(&config.media),
        MediaTimeouts::from(&config.media),
    )
    .await?;
    let external_host = format!("{}:{}", config.media.advertise_host, listener.local_addr()?.port());

    let media = ctx.commands.attach_external_media(channel, &external_host).await?;
    ctx.registry.register_auxiliary(&media.channel_id, channel);
    held.external_media = Some(media);

    let Some(connection) = or_ended(session, listener.accept(config.media.attach_timeout())).await? else {
        return Ok(bridge::pending_end(session));
    };
    if !session.transition(CallState::MediaBound) {
        return Ok(bridge::pending_end(session));
    }

    let open = AiSession::open(ctx.ai.as_ref(), &config.ai, config.media.sample_rate);
    let Some(ai) = or_ended(session, open).await? else {
        return Ok(bridge::pending_end(session));
    };
    if !session.transition(CallState::Bridging) {
        return Ok(bridge::pending_end(session));
    }

    Ok(bridge::run(session, ctx, connection, ai).await)
}

async fn cleanup(session: &Arc<CallSession>, ctx: &CallContext, held: Held, reason: &EndReason) {
    session.transition(reason.target_state());

    if let Some(media) = held.external_media {
        ctx.commands.release_external_media(&media).await;
        ctx.registry.remove_auxiliary(&media.channel_id);
    }

    if *reason != EndReason::RemoteHangup {
        if let Err(e) = ctx.commands.hangup(session.channel_id()).await {
            warn!(error = %e, "Failed to hang up channel");
        }
    }

    ctx.stats.call_finished(reason);
    ctx.records.emit(CallRecord::from_session(session, reason));

    session.transition(CallState::Closed);
    ctx.registry.remove_if_same(session);
    info!(reason = %reason, "Call closed");
}
