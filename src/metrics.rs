//! Runtime metrics
//!
//! Thin wrappers around the `metrics` macros so every component records
//! the same metric names and labels.
//!
//! # Metrics
//!
//! - `turns_total{surface,outcome}`: Counter of finished turns
//! - `turn_duration_seconds{outcome}`: Histogram of turn latency
//! - `turns_active`: Gauge of turns in flight
//! - `backend_attempts_total{backend,outcome}`: Counter of backend calls
//! - `backend_fallbacks_total{from}`: Counter of fallbacks past a backend
//! - `capability_invocations_total{capability,outcome}`: Counter of dispatches
//! - `transport_reconnects_total{surface}`: Counter of reconnect attempts
//! - `transport_dropped_replies_total{surface}`: Counter of dropped replies

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::cell::Cell;
use std::time::{Duration, Instant};

/// Metrics for one agent turn
///
/// Increments the active gauge on creation and records completion exactly
/// once, either explicitly or on drop.
#[derive(Debug)]
pub struct TurnMetrics {
    surface: String,
    start: Instant,
    recorded: Cell<bool>,
}

impl TurnMetrics {
    /// Start tracking a turn on `surface`
    pub fn start(surface: &str) -> Self {
        increment_gauge!("turns_active", 1.0);
        Self {
            surface: surface.to_string(),
            start: Instant::now(),
            recorded: Cell::new(false),
        }
    }

    /// Record completion with `outcome` ("ok", "failed", "ignored", ...)
    pub fn finish(&self, outcome: &str) {
        if self.recorded.replace(true) {
            return;
        }
        histogram!(
            "turn_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "outcome" => outcome.to_string()
        );
        increment_counter!(
            "turns_total",
            "surface" => self.surface.clone(),
            "outcome" => outcome.to_string()
        );
        decrement_gauge!("turns_active", 1.0);
    }

    /// Time since the turn started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for TurnMetrics {
    fn drop(&mut self) {
        if !self.recorded.get() {
            self.finish("cancelled");
        }
    }
}

/// Record one backend call
pub fn record_backend_attempt(backend: &str, outcome: &str) {
    increment_counter!(
        "backend_attempts_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    );
}

/// Record moving past `from` to the next backend in the chain
pub fn record_fallback(from: &str) {
    increment_counter!("backend_fallbacks_total", "from" => from.to_string());
}

/// Record one capability dispatch
pub fn record_capability(capability: &str, outcome: &str) {
    increment_counter!(
        "capability_invocations_total",
        "capability" => capability.to_string(),
        "outcome" => outcome.to_string()
    );
}

/// Record a reconnect attempt on `surface`
pub fn record_reconnect(surface: &str) {
    increment_counter!("transport_reconnects_total", "surface" => surface.to_string());
}

/// Record a queued reply dropped on `surface`
pub fn record_dropped_reply(surface: &str) {
    increment_counter!("transport_dropped_replies_total", "surface" => surface.to_string());
}

/// Record a reply given up on after repeated send rejections on `surface`
pub fn record_undeliverable_reply(surface: &str) {
    increment_counter!("transport_undeliverable_replies_total", "surface" => surface.to_string());
}

/// Initializes the metrics exporter for Prometheus
///
/// Only has an effect when compiled with the `prometheus` feature and a
/// listen address is configured; otherwise the metrics macros are no-ops.
pub fn init_metrics_exporter(listen: Option<&str>) {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        if let Some(addr) = listen {
            match addr.parse::<std::net::SocketAddr>() {
                Ok(addr) => {
                    let _ = PrometheusBuilder::new()
                        .with_http_listener(addr)
                        .install()
                        .map_err(|e| {
                            tracing::warn!("Failed to install Prometheus exporter: {}", e);
                        });
                }
                Err(e) => tracing::warn!("Invalid metrics listen address {}: {}", addr, e),
            }
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        if listen.is_some() {
            tracing::warn!("metrics.listen is set but the prometheus feature is not enabled");
        }
    }
}
