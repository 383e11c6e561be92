//! Logging, tracing and metrics setup.
//!
//! Logs always go to stderr through tracing-subscriber. With an OTLP
//! endpoint configured, spans, metrics and log records are exported there
//! as well, tagged with the service name and the broker client id so several
//! listeners can be told apart.

pub mod job;
pub mod metrics;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

/// Instrumentation scope for spans emitted by the engine.
const TRACER_NAME: &str = "jobcast";

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317". `None` keeps
    /// everything local.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Reported as `service.instance.id`.
    pub instance_id: Option<String>,
    /// Filter directive used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config, service_name: &str) -> Self {
        Self {
            endpoint: config.telemetry.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            instance_id: Some(config.connection.client_id.clone())
                .filter(|id| !id.is_empty()),
            log_level: config.telemetry.log_level.clone(),
        }
    }

    pub fn resource(&self) -> Resource {
        let builder = Resource::builder().with_service_name(self.service_name.clone());
        match &self.instance_id {
            Some(id) => builder
                .with_attribute(KeyValue::new("service.instance.id", id.clone()))
                .build(),
            None => builder.build(),
        }
    }
}

/// Providers feeding the OTLP exporter.
struct OtlpPipelines {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl OtlpPipelines {
    fn build(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let tracer = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let meter = SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build();

        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;
        let logger = SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build();

        Ok(Self {
            tracer,
            meter,
            logger,
        })
    }

    fn shutdown(self) {
        // Logs first so records emitted while spans close still go out.
        let _ = self.logger.shutdown();
        let _ = self.meter.shutdown();
        let _ = self.tracer.shutdown();
    }
}

fn exporter_error(signal: &str, err: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {err}"))
}

/// Flushes and shuts down the OTLP pipelines when dropped. Hold it for the
/// lifetime of the process.
pub struct TelemetryGuard {
    otlp: Option<OtlpPipelines>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.otlp.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(otlp) = self.otlp.take() {
            otlp.shutdown();
        }
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let otlp = match config.endpoint.as_deref() {
        Some(endpoint) => Some(OtlpPipelines::build(endpoint, config.resource())?),
        None => None,
    };
    if let Some(otlp) = &otlp {
        opentelemetry::global::set_meter_provider(otlp.meter.clone());
    }

    let trace_layer = otlp
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer.tracer(TRACER_NAME)));
    let log_layer = otlp
        .as_ref()
        .map(|p| opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&p.logger));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { otlp })
}
