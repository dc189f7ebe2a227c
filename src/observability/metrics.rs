//! Prometheus/OTLP metrics implementation.
//!
//! Key metrics:
//! - chatstore_queries_total: Counter of engine operations by kind and outcome
//! - chatstore_query_duration_seconds: Histogram of operation latency by kind
//! - chatstore_pool_wait_seconds: Histogram of time spent acquiring a connection
//! - chatstore_pool_exhausted_total: Counter of acquisitions that timed out

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Chatstore metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Engine operations, labelled by kind and outcome.
    pub queries_total: Counter<u64>,
    /// Engine operation latency in seconds.
    pub query_duration: Histogram<f64>,
    /// Connection acquisition latency in seconds.
    pub pool_wait: Histogram<f64>,
    /// Acquisitions that gave up with `PoolExhausted`.
    pub pool_exhausted_total: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            queries_total: meter
                .u64_counter("chatstore_queries_total")
                .with_description("Total number of storage engine operations")
                .with_unit("1")
                .init(),
            query_duration: meter
                .f64_histogram("chatstore_query_duration_seconds")
                .with_description("Storage operation latency including acquisition")
                .with_unit("s")
                .init(),
            pool_wait: meter
                .f64_histogram("chatstore_pool_wait_seconds")
                .with_description("Time spent waiting for a pooled connection")
                .with_unit("s")
                .init(),
            pool_exhausted_total: meter
                .u64_counter("chatstore_pool_exhausted_total")
                .with_description("Acquisitions that timed out on a full pool")
                .with_unit("1")
                .init(),
        }
    }
}

fn install_manual_reader() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
/// With an endpoint, metrics are exported over OTLP/gRPC every ten seconds;
/// this needs a running Tokio runtime.
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, using no-op metrics");
                    install_manual_reader();
                }
            }
        } else {
            // Recorded but not exported.
            install_manual_reader();
        }

        let meter = global::meter("chatstore");
        Metrics::new(&meter)
    });
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// The global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record one engine operation.
pub fn record_query(kind: &str, duration_seconds: f64, failed: bool) {
    if let Some(m) = METRICS.get() {
        let outcome = if failed { "error" } else { "ok" };
        m.queries_total.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
        m.query_duration
            .record(duration_seconds, &[KeyValue::new("kind", kind.to_string())]);
    }
}

/// Record how long a successful acquisition waited.
pub fn record_pool_wait(wait_seconds: f64) {
    if let Some(m) = METRICS.get() {
        m.pool_wait.record(wait_seconds, &[]);
    }
}

/// Record an acquisition that timed out.
pub fn record_pool_exhausted() {
    if let Some(m) = METRICS.get() {
        m.pool_exhausted_total.add(1, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
        assert!(metrics().is_some());
    }

    #[test]
    fn test_record_functions_after_init() {
        init_metrics();
        // Should not panic
        record_query("SELECT", 0.001, false);
        record_query("INSERT", 0.002, true);
        record_pool_wait(0.0);
        record_pool_exhausted();
    }
}
