use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::AppResult;
use crate::state::AppState;

/// `GET /api/v1/config`: the running configuration with secrets masked.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.redacted()
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

    #[actix_web::test]
    async fn test_config_masks_secrets() {
        let mut config = AppConfig::default();
        config.ai.api_key = "sk-secret".to_string();
        config.ari.password = "hunter2".to_string();
        let state = AppState::new(
            Arc::new(config),
            Arc::new(SessionRegistry::new(1, Duration::from_secs(1))),
            Arc::new(CallStats::default()),
            StreamStatus::default(),
        );

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let rendered = body.to_string();
        assert!(!rendered.contains("sk-secret"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(body["config"]["ai"]["api_key"], "********");
        assert_eq!(body["config"]["media"]["sample_rate"], 8000);
    }
}
