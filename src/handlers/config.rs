use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration, API key redacted.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config().redacted();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Partial runtime update. A changed initial prompt is pushed to the live
/// session; model and voice changes apply to the next server start.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let previous_config = state.get_config();
    let mut current_config = previous_config.clone();
    current_config.update_from_json(&json_str).map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(current_config.clone()).map_err(AppError::ValidationError)?;

    if current_config.initial_prompt() != previous_config.initial_prompt() {
        state.session.set_initial_prompt(current_config.initial_prompt())?;
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_round_trip_hides_key() {
        let state = test_state();
        {
            let mut config = state.get_config();
            config.live.api_key = "super-secret".to_string();
            state.update_config(config).unwrap();
        }
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/config").to_request()).await;
        assert_eq!(body["config"]["live"]["api_key"], crate::config::REDACTED);

        let request = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "live": { "initial_prompt": "Stay in character." } }))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert!(response.status().is_success());
        assert_eq!(state.get_config().initial_prompt().as_deref(), Some("Stay in character."));

        let request = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "server": { "port": 0 } }))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::BAD_REQUEST);
    }
}
