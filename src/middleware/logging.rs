//! Per-request logging with a request id.
//!
//! Every request gets a fresh id, echoed back in `x-request-id`, so a client
//! report can be matched to the server log. Health checks log at debug level.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

fn is_health_path(path: &str) -> bool {
    path == "/health" || path == "/api/v1/health"
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let request_id = Uuid::new_v4();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let remote_addr = req.connection_info().realip_remote_addr().unwrap_or("unknown").to_string();
        let quiet = is_health_path(&path);

        if quiet {
            debug!(%request_id, method = %method, path = %path, "Request started");
        } else {
            info!(%request_id, method = %method, path = %path, remote_addr = %remote_addr, "Request started");
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let mut result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            match &mut result {
                Ok(response) => {
                    let status = response.status();
                    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
                        response
                            .headers_mut()
                            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
                    }
                    if status.is_server_error() {
                        warn!(%request_id, method = %method, path = %path, status = status.as_u16(), duration_ms, "Request completed with server error");
                    } else if quiet {
                        debug!(%request_id, status = status.as_u16(), duration_ms, "Request completed");
                    } else {
                        info!(%request_id, method = %method, path = %path, status = status.as_u16(), duration_ms, "Request completed");
                    }
                }
                Err(err) => {
                    error!(
                        %request_id,
                        method = %method,
                        path = %path,
                        remote_addr = %remote_addr,
                        duration_ms,
                        error = %err,
                        "Request failed"
                    );
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    #[actix_web::test]
    async fn test_request_id_header_is_set() {
        let app = test::init_service(
            App::new()
                .wrap(RequestLogging)
                .route("/ping", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let response = test::call_service(&app, test::TestRequest::get().uri("/ping").to_request()).await;
        let header = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(header.to_str().unwrap()).is_ok());
    }

    #[actix_web::test]
    async fn test_health_paths_log_quietly() {
        assert!(is_health_path("/health"));
        assert!(is_health_path("/api/v1/health"));
        assert!(!is_health_path("/api/v1/session"));
    }
}
