//! # Audio Bridge
//!
//! The `Bridging` state: two relay tasks per call, FIFO in each direction.
//!
//! ## Directions:
//! - **Uplink** (PBX → AI): read native frames, count talk/silence, normalise
//!   speech, hand to the AI sender (which resamples to the provider rate)
//! - **Downlink** (AI → PBX): queue AI audio in a playout buffer and release
//!   one native frame per frame interval. A caller speech-start clears the
//!   queue (barge-in)
//!
//! ## Ending a round:
//! Whichever direction stops first ends the round; the other is cancelled and
//! hands its media half back. Every wait inside a relay, including a send
//! to a stalled PBX or provider, is raced against the round's cancel token,
//! so an end request always stops both directions. On AI expiry the downlink first plays out what
//! is already queued, so the agent is not cut off mid-sentence. With
//! `ai.renew_on_expiry` a fresh AI session is opened and a new round starts
//! on the same media socket; otherwise the call ends.

use std::sync::Arc;

use futures_util::future::Either;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::ai::{AiEvent, AiReceiver, AiSender, AiSession};
use crate::audio::buffer::PlayoutBuffer;
use crate::audio::codec;
use crate::config::{AudioConfig, MediaConfig};
use crate::error::BridgeError;
use crate::media::{MediaConnection, MediaReceiver, MediaSender};
use crate::session::call::CallSession;
use crate::session::state::EndReason;
use crate::session::CallContext;

/// How one relay direction stopped.
#[derive(Debug, Clone, PartialEq)]
enum RelayEnd {
    /// The round's token fired.
    Cancelled,
    Finished(EndReason),
}

type Uplink<S> = JoinHandle<(RelayEnd, MediaReceiver<ReadHalf<S>>)>;
type Downlink<S> = JoinHandle<(RelayEnd, MediaSender<WriteHalf<S>>)>;

/// Relay audio until the call ends; returns why it ended.
pub async fn run<S>(
    session: &Arc<CallSession>,
    ctx: &CallContext,
    connection: MediaConnection<S>,
    ai: AiSession,
) -> EndReason
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut media_rx, mut media_tx) = connection.split();
    let mut ai = ai;
    let mut round = 0u32;

    loop {
        round += 1;
        let (sender, receiver, mut guard) = ai.split();
        let cancel = session.child_token();

        let mut up: Uplink<S> = tokio::spawn(uplink(
            session.clone(),
            media_rx,
            sender,
            ctx.config.audio.clone(),
            cancel.clone(),
        ));
        let mut down: Downlink<S> = tokio::spawn(downlink(
            session.clone(),
            receiver,
            media_tx,
            ctx.config.media.clone(),
            cancel.clone(),
        ));

        let first = tokio::select! {
            result = &mut up => Either::Left(result),
            result = &mut down => Either::Right(result),
        };
        cancel.cancel();
        let (up_result, down_result, uplink_first) = match first {
            Either::Left(up_result) => (up_result, down.await, true),
            Either::Right(down_result) => (up.await, down_result, false),
        };
        guard.close();

        let ((up_end, rx), (down_end, tx)) = match (up_result, down_result) {
            (Ok(up), Ok(down)) => (up, down),
            (Err(e), _) | (_, Err(e)) => {
                warn!(channel_id = %session.channel_id(), error = %e, "Relay task failed");
                return EndReason::Failed(format!("relay task failed: {}", e));
            }
        };
        media_rx = rx;
        media_tx = tx;

        let (first, second) = if uplink_first {
            (up_end, down_end)
        } else {
            (down_end, up_end)
        };
        let reason = match (first, second) {
            (RelayEnd::Finished(reason), _) | (RelayEnd::Cancelled, RelayEnd::Finished(reason)) => reason,
            (RelayEnd::Cancelled, RelayEnd::Cancelled) => pending_end(session),
        };
        debug!(channel_id = %session.channel_id(), round, reason = %reason, "Bridge round ended");

        if reason == EndReason::AiExpired && ctx.config.ai.renew_on_expiry && !session.end_requested() {
            match renew(session, ctx).await {
                Some(renewed) => {
                    info!(channel_id = %session.channel_id(), round = round + 1, "AI session renewed");
                    ai = renewed;
                    continue;
                }
                None => {
                    media_tx.close().await;
                    return pending_end_or(session, EndReason::AiExpired);
                }
            }
        }

        media_tx.close().await;
        return reason;
    }
}

/// The reason an end was requested with, defaulting to a remote hangup.
pub(crate) fn pending_end(session: &CallSession) -> EndReason {
    pending_end_or(session, EndReason::RemoteHangup)
}

fn pending_end_or(session: &CallSession, fallback: EndReason) -> EndReason {
    session.end_reason().unwrap_or(fallback)
}

async fn renew(session: &Arc<CallSession>, ctx: &CallContext) -> Option<AiSession> {
    let open = AiSession::open(ctx.ai.as_ref(), &ctx.config.ai, ctx.config.media.sample_rate);
    tokio::select! {
        biased;
        _ = session.cancelled() => None,
        result = open => match result {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "AI session renewal failed");
                None
            }
        },
    }
}

async fn uplink<R>(
    session: Arc<CallSession>,
    mut media: MediaReceiver<R>,
    ai: AiSender,
    audio: AudioConfig,
    cancel: CancellationToken,
) -> (RelayEnd, MediaReceiver<R>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut expired = false;

    let end = loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayEnd::Cancelled,
            received = media.receive() => received,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(channel_id = %session.channel_id(), "PBX closed the media socket");
                break RelayEnd::Finished(EndReason::TransportClosed);
            }
            Err(BridgeError::Decode(detail)) => {
                warn!(error = %detail, "Dropping undecodable media frame");
                continue;
            }
            Err(e) => {
                warn!(channel_id = %session.channel_id(), error = %e, "Media receive failed");
                break RelayEnd::Finished(EndReason::TransportClosed);
            }
        };

        session.touch();
        let silent = codec::is_silence(&frame, audio.silence_threshold);
        session.record_inbound_frame(silent);
        trace!(samples = frame.len(), silent, "Uplink frame");

        // Past the deadline the downlink drives the ending; keep draining the
        // socket so a hangup is still noticed.
        if expired {
            continue;
        }

        let frame = if audio.normalize_inbound && !silent {
            codec::normalize(&frame, audio.target_rms, audio.max_gain)
        } else {
            frame
        };

        let captured_at = frame.captured_at();
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayEnd::Cancelled,
            sent = ai.send_audio(frame) => sent,
        };
        match sent {
            Ok(()) => trace!(relay_us = captured_at.elapsed().as_micros() as u64, "Uplink frame handed to AI"),
            Err(BridgeError::Expired) => {
                debug!(channel_id = %session.channel_id(), "AI session expired, uplink paused");
                expired = true;
            }
            Err(e) => {
                warn!(channel_id = %session.channel_id(), error = %e, "AI send failed");
                break RelayEnd::Finished(EndReason::AiClosed);
            }
        }
    };

    (end, media)
}

async fn downlink<W>(
    session: Arc<CallSession>,
    mut ai: AiReceiver,
    mut media: MediaSender<W>,
    config: MediaConfig,
    cancel: CancellationToken,
) -> (RelayEnd, MediaSender<W>)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut playout = PlayoutBuffer::new(config.sample_rate, config.frame_ms, config.playout_max_ms);
    let mut ticker = tokio::time::interval(config.frame_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut draining = false;

    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayEnd::Cancelled,
            event = ai.recv(), if !draining => match event {
                Some(AiEvent::Audio(frame)) => playout.push(&frame),
                Some(AiEvent::ResponseDone) => {
                    playout.pad_tail();
                }
                Some(AiEvent::SpeechStarted) => {
                    if !playout.is_empty() {
                        let cleared = playout.clear();
                        debug!(channel_id = %session.channel_id(), cleared_samples = cleared, "Caller barge-in, playout cleared");
                    }
                }
                Some(AiEvent::Transcript { speaker, text }) => {
                    session.record_transcript();
                    info!(channel_id = %session.channel_id(), speaker = ?speaker, text = %text, "Transcript");
                }
                Some(AiEvent::Expired) => {
                    info!(
                        channel_id = %session.channel_id(),
                        queued_samples = playout.len(),
                        "AI session expiring, finishing playout"
                    );
                    playout.pad_tail();
                    draining = true;
                }
                None => {
                    debug!(channel_id = %session.channel_id(), "AI session closed by provider");
                    break RelayEnd::Finished(EndReason::AiClosed);
                }
            },
            _ = ticker.tick() => {
                if let Some(frame) = playout.pop_frame() {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break RelayEnd::Cancelled,
                        sent = media.send(frame) => sent,
                    };
                    if let Err(e) = sent {
                        debug!(channel_id = %session.channel_id(), error = %e, "Media send failed");
                        break RelayEnd::Finished(EndReason::TransportClosed);
                    }
                    session.record_outbound_frame();
                } else if draining {
                    break RelayEnd::Finished(EndReason::AiExpired);
                }
            }
        }
    };

    if playout.dropped_samples() > 0 {
        debug!(
            channel_id = %session.channel_id(),
            dropped_samples = playout.dropped_samples(),
            "Playout overflowed during call"
        );
    }

    (end, media)
}
