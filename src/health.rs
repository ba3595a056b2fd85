use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let session = state.session.snapshot();

    HttpResponse::Ok().json(json!({
        "status": if state.session.is_running() { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "event_subscribers": metrics.event_subscribers
        },
        "memory": get_memory_info(),
        "live": {
            "model": config.live.model,
            "voice": config.live.voice,
            "api_key_configured": !config.live.api_key.is_empty(),
            "audio_backend": config.audio.backend,
            "driver_running": state.session.is_running(),
            "state": session.state,
            "error_code": session.error_code
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let session = state.session.snapshot();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "event_subscribers": metrics.event_subscribers,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "session": {
            "state": session.state,
            "activations": session.stats.activations,
            "frames_sent": session.stats.frames_sent,
            "chunks_scheduled": session.stats.chunks_scheduled,
            "interruptions": session.stats.interruptions,
            "playback_errors": session.stats.playback_errors,
            "active_sources": session.active_sources
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0)
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb() * 1024;
                } else if line.starts_with("VmSize:") {
                    vm_size = kb() * 1024;
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_session() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["live"]["api_key_configured"], false);
        assert_eq!(body["live"]["error_code"], "api_key_missing");

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert_eq!(body["session"]["activations"], 0);
    }
}
