//! Control endpoints for the live voice session.

use std::time::Duration;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{error::AppError, state::AppState};

/// How long `stop` waits for the session to settle before answering.
const STOP_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    pub prompt: Option<String>,
}

/// Current state, last status event and counters.
pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    }))
}

/// Start a session and answer once it is streaming, or with the failure.
pub async fn activate(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    info!("Activation requested");
    let session_state = state.session.activate().await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "active",
        "state": session_state,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    })))
}

/// Stop the session. Always succeeds while the driver runs.
pub async fn stop(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.stop()?;

    let mut watch = state.session.watch();
    let settled = tokio::time::timeout(STOP_SETTLE_TIMEOUT, watch.wait_for(|s| !s.state.is_busy()))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
    if !settled {
        warn!("Session did not settle after stop within {:?}", STOP_SETTLE_TIMEOUT);
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "stopped",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    })))
}

/// Set or clear the prompt sent when the next session opens.
pub async fn set_prompt(
    state: web::Data<AppState>,
    body: web::Json<PromptRequest>,
) -> Result<HttpResponse, AppError> {
    let mut config = state.get_config();
    config.live.initial_prompt = body.into_inner().prompt.unwrap_or_default();
    let prompt = config.initial_prompt();

    state.update_config(config).map_err(AppError::ValidationError)?;
    state.session.set_initial_prompt(prompt.clone())?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "has_prompt": prompt.is_some(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Stop and rebuild the remote connector.
pub async fn reset(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let connector_ready = state.session.reset().await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": if connector_ready { "ready" } else { "unavailable" },
        "connector_ready": connector_ready,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    })))
}

/// Latest visualizer snapshots.
pub async fn analyzers(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.session.snapshot().analyzers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/session", web::get().to(get_session))
            .route("/session/activate", web::post().to(activate))
            .route("/session/stop", web::post().to(stop))
            .route("/session/prompt", web::put().to(set_prompt))
            .route("/session/reset", web::post().to(reset))
            .route("/session/analyzers", web::get().to(analyzers));
    }

    #[actix_web::test]
    async fn test_activate_without_api_key() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let response = test::call_service(&app, test::TestRequest::post().uri("/session/activate").to_request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "api_key_missing");

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/session").to_request()).await;
        assert_eq!(body["session"]["state"], "error");
        assert_eq!(body["session"]["error_code"], "api_key_missing");
    }

    #[actix_web::test]
    async fn test_stop_prompt_and_analyzers() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(web::Data::new(state.clone())).configure(routes)).await;

        let response = test::call_service(&app, test::TestRequest::post().uri("/session/stop").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let request = test::TestRequest::put()
            .uri("/session/prompt")
            .set_json(json!({ "prompt": "You are a tough negotiator." }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body["has_prompt"], true);
        assert_eq!(state.get_config().live.initial_prompt, "You are a tough negotiator.");

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/session/analyzers").to_request()).await;
        assert_eq!(body["input"].as_array().unwrap().len(), 16);
        assert_eq!(body["output"].as_array().unwrap().len(), 16);

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::post().uri("/session/reset").to_request()).await;
        assert_eq!(body["connector_ready"], false);
    }
}
