//! Logging, tracing and metrics setup for chartflow processes.
//!
//! Every process logs to stderr through `tracing`. With an OTLP endpoint
//! configured, spans, metrics and log records are also exported there,
//! tagged with the service name and the item queue the process works on.

pub mod metrics;
pub mod spans;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

/// Directives appended to the configured level: per-statement sqlx logs
/// and the exporter's gRPC transport are only interesting when they fail.
const QUIET_TARGETS: &str = "sqlx::query=warn,h2=warn,tonic=warn,hyper=warn";

/// Settings for [`init_telemetry`].
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. `None` logs to stderr only.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Reported as the `chartflow.item_queue` resource attribute.
    pub item_queue: String,
}

impl From<&Config> for TelemetryConfig {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: config.service_name.clone(),
            log_level: config.log_level.clone(),
            item_queue: config.item_queue.clone(),
        }
    }
}

/// The three OTLP pipelines, all sharing one resource.
struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Exporters {
    fn connect(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }

    /// Flush and stop. Logs go first so shutdown spans still export.
    fn shutdown(self) {
        let _ = self.logger.shutdown();
        let _ = self.meter.shutdown();
        let _ = self.tracer.shutdown();
    }
}

fn exporter_error<E: std::fmt::Display>(signal: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn resource(config: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes([
            KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ),
            KeyValue::new("chartflow.item_queue", config.item_queue.clone()),
        ])
        .build()
}

/// `RUST_LOG` wins when set; otherwise the configured level plus
/// [`QUIET_TARGETS`].
fn log_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},{QUIET_TARGETS}")))
}

/// Keeps the exporters alive. Dropping it flushes and shuts them down.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Whether signals are exported over OTLP.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            exporters.shutdown();
        }
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines.
///
/// Hold the returned guard until the process exits.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let exporters = config
        .endpoint
        .as_deref()
        .map(|endpoint| Exporters::connect(endpoint, resource(&config)))
        .transpose()?;
    let guard = TelemetryGuard { exporters };

    let trace_layer = guard.exporters.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.tracer.tracer("chartflow"))
    });
    let log_layer = guard
        .exporters
        .as_ref()
        .map(|e| OpenTelemetryTracingBridge::new(&e.logger));
    if let Some(e) = &guard.exporters {
        opentelemetry::global::set_meter_provider(e.meter.clone());
    }

    tracing_subscriber::registry()
        .with(log_filter(&config.log_level))
        .with(tracing_subscriber::fmt::layer().with_target(!guard.is_exporting()))
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    info!(
        service = %config.service_name,
        item_queue = %config.item_queue,
        otlp = guard.is_exporting(),
        "telemetry initialized"
    );
    Ok(guard)
}
