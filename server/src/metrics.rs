//! # Prometheus Metrics
//!
//! Exposes operational metrics for the authentication server. Scraped by
//! Prometheus at the `/metrics` HTTP endpoint on the configured metrics port.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] so they
//! do not collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the server.
///
/// Clone-friendly (wraps `Arc` internally via prometheus handles) so it can
/// be shared across request handlers and background tasks.
#[derive(Clone)]
pub struct ServerMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Total number of SQRL protocol exchanges handled on `/sqrl`.
    pub exchanges_total: IntCounter,
    /// Total number of login URL bundles issued to browsers.
    pub urls_issued_total: IntCounter,
    /// Total number of out-of-band codes successfully redeemed.
    pub codes_redeemed_total: IntCounter,
    /// Total number of code redemption attempts that were refused.
    pub codes_rejected_total: IntCounter,
    /// Total number of expired or redeemed nuts removed by the sweeper.
    pub nuts_swept_total: IntCounter,
    /// Number of browser sessions currently logged in.
    pub active_sessions: IntGauge,
    /// Histogram of `/sqrl` exchange handling latency in seconds.
    pub exchange_duration_seconds: Histogram,
}

impl ServerMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("sqrl".into()), None)
            .expect("failed to create prometheus registry");

        let exchanges_total = IntCounter::new(
            "exchanges_total",
            "Total number of SQRL protocol exchanges handled",
        )
        .expect("metric creation");
        registry
            .register(Box::new(exchanges_total.clone()))
            .expect("metric registration");

        let urls_issued_total = IntCounter::new(
            "urls_issued_total",
            "Total number of login URL bundles issued",
        )
        .expect("metric creation");
        registry
            .register(Box::new(urls_issued_total.clone()))
            .expect("metric registration");

        let codes_redeemed_total = IntCounter::new(
            "codes_redeemed_total",
            "Total number of out-of-band login codes redeemed",
        )
        .expect("metric creation");
        registry
            .register(Box::new(codes_redeemed_total.clone()))
            .expect("metric registration");

        let codes_rejected_total = IntCounter::new(
            "codes_rejected_total",
            "Total number of code redemption attempts refused",
        )
        .expect("metric creation");
        registry
            .register(Box::new(codes_rejected_total.clone()))
            .expect("metric registration");

        let nuts_swept_total = IntCounter::new(
            "nuts_swept_total",
            "Total number of expired or redeemed nuts removed by the sweeper",
        )
        .expect("metric creation");
        registry
            .register(Box::new(nuts_swept_total.clone()))
            .expect("metric registration");

        let active_sessions = IntGauge::new(
            "active_sessions",
            "Number of browser sessions currently logged in",
        )
        .expect("metric creation");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("metric registration");

        let exchange_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "exchange_duration_seconds",
                "SQRL exchange handling latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(exchange_duration_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            exchanges_total,
            urls_issued_total,
            codes_redeemed_total,
            codes_rejected_total,
            nuts_swept_total,
            active_sessions,
            exchange_duration_seconds,
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers via `State`.
pub type SharedMetrics = Arc<ServerMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
