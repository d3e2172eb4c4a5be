//! # Call Inspection Handlers
//!
//! ## Endpoints:
//! - `GET /api/v1/calls`: every active call, oldest first
//! - `GET /api/v1/calls/{channel_id}`: one call
//! - `DELETE /api/v1/calls/{channel_id}`: operator hangup. The request only
//!   signals the call; its lifecycle task performs the cleanup and the PBX
//!   hangup, so the response is `202 Accepted`

use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::session::{CallSummary, EndReason};
use crate::state::AppState;

pub async fn list_calls(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let calls: Vec<CallSummary> = state.registry.list().iter().map(|s| s.summary()).collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": calls.len(),
        "capacity": state.registry.capacity(),
        "calls": calls
    })))
}

pub async fn get_call(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let channel_id = path.into_inner();
    let session = state
        .registry
        .get(&channel_id)
        .ok_or_else(|| AppError::NotFound(format!("call {}", channel_id)))?;

    Ok(HttpResponse::Ok().json(session.summary()))
}

pub async fn hangup_call(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let channel_id = path.into_inner();
    let session = state
        .registry
        .get(&channel_id)
        .ok_or_else(|| AppError::NotFound(format!("call {}", channel_id)))?;

    let accepted = session.request_end(EndReason::Operator);
    info!(channel_id = %channel_id, accepted, "Operator hangup requested");

    Ok(HttpResponse::Accepted().json(json!({
        "channel_id": channel_id,
        "end_requested": accepted,
        "end_reason": session.end_reason().map(|r| r.to_string()),
        "state": session.state()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ari::StreamStatus;
    use crate::config::AppConfig;
    use crate::session::{CallStats, SessionRegistry};
    use actix_web::{test, App};
    use std::sync::Arc;
    use std::time::Duration;

    fn state() -> AppState {
        AppState::new(
            Arc::new(AppConfig::default()),
            Arc::new(SessionRegistry::new(4, Duration::from_secs(1))),
            Arc::new(CallStats::default()),
            StreamStatus::default(),
        )
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new().app_data(web::Data::new($state)).service(
                    web::scope("/api/v1")
                        .route("/calls", web::get().to(list_calls))
                        .route("/calls/{channel_id}", web::get().to(get_call))
                        .route("/calls/{channel_id}", web::delete().to(hangup_call)),
                ),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_list_and_get_calls() {
        let state = state();
        state.registry.get_or_create("c1", "1001").unwrap();
        state.registry.get_or_create("c2", "1002").unwrap();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/api/v1/calls").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 2);
        let mut ids: Vec<&str> = body["calls"]
            .as_array()
            .unwrap()
            .iter()
            .map(|call| call["channel_id"].as_str().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, ["c1", "c2"]);
        assert_eq!(body["calls"][0]["state"], "starting");

        let req = test::TestRequest::get().uri("/api/v1/calls/c2").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["caller"], "1002");
    }

    #[actix_web::test]
    async fn test_unknown_call_is_not_found() {
        let app = app!(state());

        let req = test::TestRequest::get().uri("/api/v1/calls/missing").to_request();
        let response = test::call_service(&app, req).await;
        assert_eq!(response.status().as_u16(), 404);

        let req = test::TestRequest::delete().uri("/api/v1/calls/missing").to_request();
        let response = test::call_service(&app, req).await;
        assert_eq!(response.status().as_u16(), 404);
    }

    #[actix_web::test]
    async fn test_operator_hangup_requests_end_once() {
        let state = state();
        let (session, _) = state.registry.get_or_create("c1", "1001").unwrap();
        let app = app!(state);

        let req = test::TestRequest::delete().uri("/api/v1/calls/c1").to_request();
        let response = test::call_service(&app, req).await;
        assert_eq!(response.status().as_u16(), 202);
        assert_eq!(session.end_reason(), Some(EndReason::Operator));

        let req = test::TestRequest::delete().uri("/api/v1/calls/c1").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["end_requested"], false);
        assert_eq!(body["end_reason"], "operator");
    }
}
