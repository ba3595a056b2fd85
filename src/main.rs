//! # Live Voice Server - Main Application Entry Point
//!
//! Hosts one live voice session behind a small HTTP/WebSocket control surface.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared application state, request metrics, the session handle
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and metrics collection
//! - **handlers**: config and session control endpoints
//! - **websocket**: `/ws/events`, the live event stream
//! - **error**: HTTP error responses
//!
//! The session itself lives in the `live_voice` library and runs on its own
//! driver task; this binary only wires it to the outside world.

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod websocket;

use std::env;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::state::AppState;
use live_voice::audio::{AudioBackend, AudioContexts, HeadlessBackend};
use live_voice::remote::{GeminiLiveConnector, RemoteConnector};
use live_voice::session::{ConnectorFactory, SessionDriver};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.live.model,
        voice = %config.live.voice,
        backend = %config.audio.backend,
        "Configuration loaded"
    );
    if config.live.api_key.is_empty() {
        warn!("No API key configured (GEMINI_API_KEY / API_KEY); sessions will report api_key_missing");
    }

    let backend = build_backend(&config)?;
    let (session, driver_task) = SessionDriver::spawn(
        config.session_settings(),
        AudioContexts::new(backend),
        connector_factory(&config),
        config.visualizer_interval(),
    );

    let app_state = AppState::new(config.clone(), session.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .service(
                        web::scope("/session")
                            .route("", web::get().to(handlers::session::get_session))
                            .route("/activate", web::post().to(handlers::session::activate))
                            .route("/stop", web::post().to(handlers::session::stop))
                            .route("/prompt", web::put().to(handlers::session::set_prompt))
                            .route("/reset", web::post().to(handlers::session::reset))
                            .route("/analyzers", web::get().to(handlers::session::analyzers)),
                    ),
            )
            .route("/ws/events", web::get().to(websocket::events_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    session.shutdown();
    if let Err(e) = driver_task.await {
        error!("Session driver task error: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; defaults to debug for this crate.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice=debug,live_voice_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

fn build_backend(config: &AppConfig) -> Result<Arc<dyn AudioBackend>> {
    match config.audio.backend.as_str() {
        "headless" => Ok(Arc::new(HeadlessBackend::new())),
        #[cfg(feature = "device-audio")]
        "device" => {
            match live_voice::audio::device::DeviceBackend::list_input_devices() {
                Ok(devices) => info!(?devices, "Input devices"),
                Err(e) => warn!("Could not list input devices: {}", e),
            }
            Ok(Arc::new(live_voice::audio::device::DeviceBackend::new()?))
        }
        #[cfg(not(feature = "device-audio"))]
        "device" => Err(anyhow::anyhow!(
            "Audio backend 'device' requires building with the device-audio feature"
        )),
        other => Err(anyhow::anyhow!("Unknown audio backend '{}'", other)),
    }
}

/// Builds a Gemini connector on demand. The key is re-read from the
/// environment on every call so a session reset picks up a rotated key.
fn connector_factory(config: &AppConfig) -> ConnectorFactory {
    let configured_key = config.live.api_key.clone();
    let endpoint = config.live.endpoint.clone();

    Box::new(move || {
        let api_key = env::var("GEMINI_API_KEY")
            .or_else(|_| env::var("API_KEY"))
            .unwrap_or_else(|_| configured_key.clone());
        let connector: Arc<dyn RemoteConnector> =
            Arc::new(GeminiLiveConnector::with_endpoint(api_key, endpoint.clone())?);
        Ok(connector)
    })
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
