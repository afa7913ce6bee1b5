//! Prometheus metrics shared by every service, plus the HTTP
//! exposition endpoint.
//!
//! Three collectors cover the whole pipeline: a labelled gauge for
//! point-in-time state, a labelled counter for cumulative totals, and a
//! per-service histogram of cycle durations. The cycle loop feeds the
//! standard series (`cycles_success`, `cycles_failed`, `errors_<kind>`,
//! `consecutive_failures`, `last_cycle_timestamp`); services add their
//! own through the same two collectors.

use axum::Router;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use once_cell::sync::Lazy;
use prometheus::{Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};

use crate::config::MetricsConfig;
use crate::error::Result;
use crate::models::service_state::ServiceName;
use crate::services::Shutdown;

static SERVICE_GAUGE: Lazy<GaugeVec> = Lazy::new(|| {
    let gauge = GaugeVec::new(
        Opts::new("service_gauge", "Service gauge values (point-in-time state)"),
        &["service", "name"],
    )
    .expect("service_gauge definition");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("service_gauge registration");
    gauge
});

static SERVICE_COUNTER: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("service_counter", "Service counter values (cumulative totals)"),
        &["service", "name"],
    )
    .expect("service_counter definition");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("service_counter registration");
    counter
});

static CYCLE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new("cycle_duration_seconds", "Duration of service cycle in seconds")
            .buckets(vec![
                1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
            ]),
        &["service"],
    )
    .expect("cycle_duration_seconds definition");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("cycle_duration_seconds registration");
    histogram
});

pub fn set_gauge(service: ServiceName, name: &str, value: f64) {
    SERVICE_GAUGE
        .with_label_values(&[service.as_str(), name])
        .set(value);
}

pub fn inc_counter(service: ServiceName, name: &str, value: u64) {
    SERVICE_COUNTER
        .with_label_values(&[service.as_str(), name])
        .inc_by(value);
}

pub fn observe_cycle_duration(service: ServiceName, seconds: f64) {
    CYCLE_DURATION_SECONDS
        .with_label_values(&[service.as_str()])
        .observe(seconds);
}

#[cfg(test)]
pub fn counter_value(service: ServiceName, name: &str) -> u64 {
    SERVICE_COUNTER
        .with_label_values(&[service.as_str(), name])
        .get()
}

#[cfg(test)]
pub fn gauge_value(service: ServiceName, name: &str) -> f64 {
    SERVICE_GAUGE
        .with_label_values(&[service.as_str(), name])
        .get()
}

async fn render_metrics() -> impl IntoResponse {
    let families = prometheus::gather();
    let mut body = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut body) {
        tracing::error!(target: "bigbrotr::metrics", error = %e, "metrics_encode_failed");
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Serve the Prometheus exposition endpoint until shutdown. No-op when
/// metrics are disabled.
pub async fn serve(config: MetricsConfig, shutdown: Shutdown) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let app = Router::new().route(&config.path, get(render_metrics));
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(
        target: "bigbrotr::metrics",
        host = %config.host,
        port = config.port,
        path = %config.path,
        "metrics_server_started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let before = counter_value(ServiceName::Seeder, "test_metric_total");
        inc_counter(ServiceName::Seeder, "test_metric_total", 3);
        inc_counter(ServiceName::Seeder, "test_metric_total", 2);
        assert_eq!(
            counter_value(ServiceName::Seeder, "test_metric_total"),
            before + 5
        );
    }

    #[test]
    fn test_gauges_overwrite() {
        set_gauge(ServiceName::Seeder, "test_gauge", 7.0);
        set_gauge(ServiceName::Seeder, "test_gauge", 3.0);
        assert_eq!(gauge_value(ServiceName::Seeder, "test_gauge"), 3.0);
    }

    #[tokio::test]
    async fn test_disabled_server_returns_immediately() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        serve(config, Shutdown::new()).await.unwrap();
    }
}
