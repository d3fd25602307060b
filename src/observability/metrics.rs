//! OTLP metrics implementation.
//!
//! Key metrics:
//! - pgbridge_publish_total: Counter for attempted publishes
//! - pgbridge_publish_failures_total: Counter for publishes the transport rejected
//! - pgbridge_deliveries_total: Counter for messages handed to consumers
//! - pgbridge_bridge_backlog: Gauge for values buffered in a bridge

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// pgbridge metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub publish_total: Counter<u64>,
    pub publish_failures: Counter<u64>,
    /// Messages delivered, by consumer kind (`subscription` or `bridge`).
    pub deliveries_total: Counter<u64>,
    pub bridge_backlog: Gauge<i64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            publish_total: meter
                .u64_counter("pgbridge_publish_total")
                .with_description("Publishes forwarded to the notifier")
                .with_unit("1")
                .init(),
            publish_failures: meter
                .u64_counter("pgbridge_publish_failures_total")
                .with_description("Publishes rejected by the notifier")
                .with_unit("1")
                .init(),
            deliveries_total: meter
                .u64_counter("pgbridge_deliveries_total")
                .with_description("Messages handed to subscribers and bridges")
                .with_unit("1")
                .init(),
            bridge_backlog: meter
                .i64_gauge("pgbridge_bridge_backlog")
                .with_description("Values buffered in a bridge awaiting a pull")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
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
            install_manual_reader();
        }

        let meter = global::meter("pgbridge");
        Metrics::new(&meter)
    });
}

/// Metrics are recorded but not exported.
fn install_manual_reader() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record a publish forwarded to the notifier.
pub fn record_publish(channel: &str, succeeded: bool) {
    if let Some(m) = METRICS.get() {
        let attrs = [KeyValue::new("channel", channel.to_string())];
        m.publish_total.add(1, &attrs);
        if !succeeded {
            m.publish_failures.add(1, &attrs);
        }
    }
}

/// Record a message handed to a consumer.
pub fn record_delivery(consumer: &'static str) {
    if let Some(m) = METRICS.get() {
        m.deliveries_total
            .add(1, &[KeyValue::new("consumer", consumer)]);
    }
}

/// Record the number of values buffered in a bridge.
pub fn record_bridge_backlog(buffered: usize) {
    if let Some(m) = METRICS.get() {
        m.bridge_backlog
            .record(i64::try_from(buffered).unwrap_or(i64::MAX), &[]);
    }
}
