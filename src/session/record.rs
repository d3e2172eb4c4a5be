//! # Call-Completion Records
//!
//! One record per finished call, emitted on the `call_record` tracing target
//! and, when `sessions.record_path` is set, appended to a JSON-lines file.
//! Writing is fire-and-forget: a failed append is logged and never affects
//! the call.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::session::call::{CallSession, CounterSnapshot};
use crate::session::state::EndReason;

#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub channel_id: String,
    pub caller: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub answered: bool,
    pub end_reason: String,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

impl CallRecord {
    pub fn from_session(session: &CallSession, reason: &EndReason) -> Self {
        Self {
            channel_id: session.channel_id().to_string(),
            caller: session.caller().to_string(),
            session_id: session.session_id(),
            started_at: session.created_at(),
            ended_at: Utc::now(),
            duration_secs: session.age().as_secs_f64(),
            answered: session.is_answered(),
            end_reason: reason.to_string(),
            counters: session.counters(),
        }
    }
}

/// Where finished-call records go.
#[derive(Debug, Clone, Default)]
pub struct CallRecordSink {
    path: Option<PathBuf>,
}

impl CallRecordSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Log the record and, if configured, append it in the background.
    pub fn emit(&self, record: CallRecord) {
        info!(
            target: "call_record",
            channel_id = %record.channel_id,
            caller = %record.caller,
            duration_secs = record.duration_secs,
            end_reason = %record.end_reason,
            frames_from_pbx = record.counters.frames_from_pbx,
            frames_to_pbx = record.counters.frames_to_pbx,
            transcripts = record.counters.transcripts,
            "Call completed"
        );

        if self.path.is_some() {
            let sink = self.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.append(&record).await {
                    warn!(channel_id = %record.channel_id, error = %e, "Failed to persist call record");
                }
            });
        }
    }

    /// Append one JSON line. A sink without a path accepts and drops records.
    pub async fn append(&self, record: &CallRecord) -> Result<(), BridgeError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_append_as_json_lines() {
        let path = std::env::temp_dir().join(format!("voice-bridge-records-{}.jsonl", Uuid::new_v4()));
        let sink = CallRecordSink::new(Some(path.clone()));

        let session = CallSession::new("c1", "1001");
        session.mark_answered();
        session.record_inbound_frame(false);

        sink.append(&CallRecord::from_session(&session, &EndReason::RemoteHangup))
            .await
            .unwrap();
        sink.append(&CallRecord::from_session(&session, &EndReason::Failed("boom".into())))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["channel_id"], "c1");
        assert_eq!(lines[0]["end_reason"], "remote_hangup");
        assert_eq!(lines[0]["answered"], true);
        assert_eq!(lines[0]["frames_from_pbx"], 1);
        assert_eq!(lines[1]["end_reason"], "failed: boom");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_sink_without_path_is_noop() {
        let sink = CallRecordSink::default();
        let session = CallSession::new("c1", "1001");
        sink.append(&CallRecord::from_session(&session, &EndReason::Operator))
            .await
            .unwrap();
    }
}
