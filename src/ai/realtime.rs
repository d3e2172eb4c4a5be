//! # Realtime Speech API Connector
//!
//! Production `AiConnector` speaking the OpenAI-style realtime websocket
//! protocol.
//!
//! ## Protocol Flow:
//! 1. Connect to `{url}?model={model}` with bearer auth and the realtime beta header
//! 2. Send `session.update` (pcm16 both ways, voice, instructions, server VAD)
//! 3. Outbound audio: `input_audio_buffer.append` with base64 PCM16
//! 4. Inbound: audio deltas, transcripts and the speech-start signal are
//!    turned into `AiEvent`s; everything else is ignored
//!
//! One pump task per session owns the socket and shuttles between the
//! websocket and the link channels. Every websocket write is bounded by
//! `ai.send_timeout_ms`; a stalled provider drops the link, which the call
//! sees as the AI session closing.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::ai::{AiConnector, AiEvent, AiLink, Speaker};
use crate::audio::AudioFrame;
use crate::config::AiConfig;
use crate::error::BridgeError;

const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;

/// Connects to the realtime websocket API.
#[derive(Debug, Default, Clone)]
pub struct RealtimeConnector;

impl RealtimeConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AiConnector for RealtimeConnector {
    async fn connect(&self, config: &AiConfig) -> Result<AiLink, BridgeError> {
        let url = format!("{}?model={}", config.url, config.model);
        let mut request = url.as_str().into_client_request()?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| BridgeError::Auth("API key contains invalid header characters".to_string()))?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _response) = connect_async(request).await?;
        info!(url = %config.url, model = %config.model, "Connected to realtime API");

        let send_timeout = config.send_timeout();
        let (mut sink, mut stream) = ws.split();
        tokio::time::timeout(send_timeout, sink.send(Message::Text(session_update(config).to_string())))
            .await
            .map_err(|_| BridgeError::Timeout(format!("sending session.update exceeded {:?}", send_timeout)))??;

        let (out_tx, mut out_rx) = mpsc::channel::<AudioFrame>(OUTBOUND_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<AiEvent>(INBOUND_QUEUE);
        let api_rate = config.sample_rate;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            let sent = tokio::time::timeout(send_timeout, sink.send(Message::Text(append_message(&frame)))).await;
                            match sent {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    warn!(error = %e, "Failed to send audio to realtime API");
                                    break;
                                }
                                Err(_) => {
                                    warn!(timeout_ms = send_timeout.as_millis() as u64, "Realtime API stopped accepting audio");
                                    break;
                                }
                            }
                        }
                        None => {
                            let _ = tokio::time::timeout(send_timeout, sink.send(Message::Close(None))).await;
                            break;
                        }
                    },
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_server_event(&text, api_rate) {
                                if in_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "Realtime API closed the session");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Realtime API connection failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("Realtime pump stopped");
        });

        Ok(AiLink {
            outbound: out_tx,
            inbound: in_rx,
            task: Some(task),
        })
    }
}

/// The `session.update` sent right after connecting.
pub fn session_update(config: &AiConfig) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "modalities": ["audio", "text"],
            "instructions": config.instructions,
            "voice": config.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": { "model": "whisper-1" },
            "turn_detection": { "type": "server_vad" }
        }
    })
}

fn append_message(frame: &AudioFrame) -> String {
    json!({
        "type": "input_audio_buffer.append",
        "audio": STANDARD.encode(frame.to_pcm_bytes()),
    })
    .to_string()
}

/// Translate one server message into an `AiEvent`.
///
/// Returns `None` for messages the bridge does not act on and for malformed
/// payloads (logged and dropped).
pub fn parse_server_event(text: &str, api_rate: u32) -> Option<AiEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Dropping malformed realtime message");
            return None;
        }
    };

    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "response.audio.delta" | "response.output_audio.delta" => {
            let delta = value.get("delta").and_then(Value::as_str)?;
            let bytes = match STANDARD.decode(delta) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "Dropping audio delta with invalid base64");
                    return None;
                }
            };
            match AudioFrame::from_pcm_bytes(&bytes, api_rate) {
                Ok(frame) if frame.is_empty() => None,
                Ok(frame) => Some(AiEvent::Audio(frame)),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable audio delta");
                    None
                }
            }
        }
        "response.audio.done" | "response.output_audio.done" => Some(AiEvent::ResponseDone),
        "response.audio_transcript.done" | "response.output_audio_transcript.done" => {
            transcript(&value, Speaker::Agent)
        }
        "conversation.item.input_audio_transcription.completed" => transcript(&value, Speaker::Caller),
        "input_audio_buffer.speech_started" => Some(AiEvent::SpeechStarted),
        "error" => {
            let error = value.get("error");
            let code = error
                .and_then(|e| e.get("code"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let message = error
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            warn!(code, error_message = message, "Realtime API reported an error");
            // The provider's own limit hit before our deadline.
            if code == "session_expired" {
                Some(AiEvent::Expired)
            } else {
                None
            }
        }
        other => {
            trace!(kind = other, "Ignoring realtime message");
            None
        }
    }
}

fn transcript(value: &Value, speaker: Speaker) -> Option<AiEvent> {
    let text = value.get("transcript").and_then(Value::as_str)?.trim();
    if text.is_empty() {
        return None;
    }
    Some(AiEvent::Transcript {
        speaker,
        text: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_delta_decodes_at_api_rate() {
        let pcm = AudioFrame::new(vec![1, -1, 300], 24_000).to_pcm_bytes();
        let message = json!({ "type": "response.audio.delta", "delta": STANDARD.encode(pcm) }).to_string();

        match parse_server_event(&message, 24_000) {
            Some(AiEvent::Audio(frame)) => {
                assert_eq!(frame.sample_rate(), 24_000);
                assert_eq!(frame.samples(), &[1, -1, 300]);
            }
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[test]
    fn test_transcripts_are_attributed() {
        let agent = r#"{"type":"response.audio_transcript.done","transcript":"Hello there"}"#;
        let caller = r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":" hi "}"#;

        assert_eq!(
            parse_server_event(agent, 24_000),
            Some(AiEvent::Transcript {
                speaker: Speaker::Agent,
                text: "Hello there".to_string()
            })
        );
        assert_eq!(
            parse_server_event(caller, 24_000),
            Some(AiEvent::Transcript {
                speaker: Speaker::Caller,
                text: "hi".to_string()
            })
        );
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(
            parse_server_event(r#"{"type":"input_audio_buffer.speech_started"}"#, 24_000),
            Some(AiEvent::SpeechStarted)
        );
        assert_eq!(
            parse_server_event(r#"{"type":"response.audio.done"}"#, 24_000),
            Some(AiEvent::ResponseDone)
        );
        assert_eq!(
            parse_server_event(
                r#"{"type":"error","error":{"code":"session_expired","message":"limit"}}"#,
                24_000
            ),
            Some(AiEvent::Expired)
        );
    }

    #[test]
    fn test_malformed_and_unknown_messages_are_dropped() {
        assert_eq!(parse_server_event("not json", 24_000), None);
        assert_eq!(parse_server_event(r#"{"type":"session.created"}"#, 24_000), None);
        assert_eq!(
            parse_server_event(r#"{"type":"response.audio.delta","delta":"!!"}"#, 24_000),
            None
        );
        // Three bytes cannot be 16-bit PCM.
        let odd = json!({ "type": "response.audio.delta", "delta": STANDARD.encode([1u8, 2, 3]) }).to_string();
        assert_eq!(parse_server_event(&odd, 24_000), None);
        let empty = r#"{"type":"response.audio.delta","delta":""}"#;
        assert_eq!(parse_server_event(empty, 24_000), None);
    }

    #[test]
    fn test_session_update_carries_voice_and_formats() {
        let config = crate::config::AppConfig::default().ai;
        let update = session_update(&config);
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["voice"], config.voice.as_str());
        assert_eq!(update["session"]["input_audio_format"], "pcm16");
    }

    #[test]
    fn test_append_message_is_base64_pcm() {
        let frame = AudioFrame::new(vec![0x0102], 24_000);
        let value: Value = serde_json::from_str(&append_message(&frame)).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        assert_eq!(value["audio"], STANDARD.encode([0x02u8, 0x01]));
    }
}
