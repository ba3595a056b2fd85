//! # Application State Management
//!
//! State shared by every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>>
//! - **Arc**: every worker thread's copy of `AppState` points at the same data
//! - **RwLock**: many readers or one writer; config reads vastly outnumber writes
//!
//! ### Handles instead of locks
//! The live session itself is not behind a lock. It runs on its own driver
//! task and is reached through a [`SessionHandle`], which is just a set of
//! channel senders and is cheap to clone into every worker.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use live_voice::session::SessionHandle;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the metrics middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// The live voice session driver
    pub session: SessionHandle,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Currently connected `/ws/events` clients
    pub event_subscribers: u32,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

// A panicking handler must not take the whole server down with it, so a
// poisoned lock is recovered rather than propagated.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl AppState {
    pub fn new(config: AppConfig, session: SessionHandle) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            session,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *write(&self.config) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    /// Record one finished request for `endpoint` (e.g. "POST /api/v1/session/activate").
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn subscriber_connected(&self) {
        write(&self.metrics).event_subscribers += 1;
    }

    /// Saturates at zero.
    pub fn subscriber_disconnected(&self) {
        let mut metrics = write(&self.metrics);
        metrics.event_subscribers = metrics.event_subscribers.saturating_sub(1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
