//! Logging and tracing setup
//!
//! Logs go to stdout through `tracing-subscriber`. When
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans are additionally exported over
//! OTLP. The log filter sits behind a reload handle so the override
//! ConfigMap can change the level at runtime.

use opentelemetry::KeyValue;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "telemetry-operator";

/// Handle to change the active log filter
pub struct LogLevel {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevel {
    /// Apply a log level such as `debug`, or go back to the startup filter on `None`
    pub fn apply(&self, level: Option<&str>) -> Result<()> {
        let filter = match level {
            Some(level) => EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .parse(level)
                .map_err(|e| Error::ValidationError(format!("invalid log level {level:?}: {e}")))?,
            None => default_filter(),
        };
        self.handle
            .reload(filter)
            .map_err(|e| Error::ConfigError(format!("failed to reload log filter: {e}")))?;
        info!("Log level set to {}", level.unwrap_or("default"));
        Ok(())
    }
}

/// `RUST_LOG` if set, `info` otherwise
fn default_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy()
}

fn init_tracer() -> Result<sdktrace::Tracer> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(
            sdktrace::config().with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                SERVICE_NAME,
            )])),
        )
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("failed to initialize OTLP exporter: {e}")))
}

/// Install the global subscriber
pub fn init_telemetry() -> Result<LogLevel> {
    let (filter, handle) = reload::Layer::new(default_filter());
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true));

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();
    let init = if otel_enabled {
        let tracer = init_tracer()?;
        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
    } else {
        registry.try_init()
    };
    init.map_err(|e| Error::ConfigError(format!("failed to install subscriber: {e}")))?;

    if otel_enabled {
        info!("OpenTelemetry tracing initialized");
    } else {
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
    Ok(LogLevel { handle })
}

/// Flush any remaining spans
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
