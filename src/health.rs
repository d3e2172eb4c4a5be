//! # Health and Metrics Endpoints
//!
//! ## Endpoints:
//! - `GET /health`, `GET /api/v1/health`: liveness plus event stream status.
//!   Reports `degraded` while the PBX event stream is disconnected; the
//!   process itself keeps serving calls already in progress
//! - `GET /api/v1/metrics`: call counters, session occupancy, reconnects and
//!   process memory

use std::process;

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::state::AppState;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let connected = state.stream.is_connected();

    HttpResponse::Ok().json(json!({
        "status": if connected { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "ari_app": state.config.ari.app_name
        },
        "ari": {
            "connected": connected,
            "reconnects": state.stream.reconnects()
        },
        "sessions": {
            "active": state.registry.len(),
            "capacity": state.registry.capacity()
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.stats.snapshot();
    let uptime_seconds = state.uptime_seconds();
    let finished = stats.calls_completed + stats.calls_failed;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "calls": {
            "started": stats.calls_started,
            "completed": stats.calls_completed,
            "failed": stats.calls_failed,
            "rejected": stats.calls_rejected,
            "failure_rate": if finished > 0 {
                stats.calls_failed as f64 / finished as f64
            } else {
                0.0
            }
        },
        "sessions": {
            "active": state.registry.len(),
            "capacity": state.registry.capacity()
        },
        "ari": {
            "connected": state.stream.is_connected(),
            "reconnects": state.stream.reconnects(),
            "events_dropped": stats.events_dropped,
            "events_ignored": stats.events_ignored
        },
        "memory": memory_info()
    }))
}

fn memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "pid": process::id(),
        "available": false
    })
}
