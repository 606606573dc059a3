//! Tracing subscriber wiring: fmt layer plus OTLP span export.

use anyhow::{Context, Result};
use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{runtime, trace, Resource};
use std::time::Duration;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Initialize the global subscriber.
///
/// Spans are exported over OTLP/gRPC to the endpoint resolved from the
/// standard `OTEL_EXPORTER_OTLP_*` environment. The `RUST_LOG` filter still
/// applies on top of the verbosity default.
///
/// # Errors
/// Returns an error if the exporter cannot be built or a global subscriber
/// is already installed.
pub fn init(verbosity: Option<tracing::Level>) -> Result<()> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to build OTLP span exporter")?;

    let provider = trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();

    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));
    opentelemetry::global::set_tracer_provider(provider);

    let telemetry = OpenTelemetryLayer::new(tracer);

    let fmt_layer = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    // RUST_LOG=
    let env_filter = EnvFilter::builder()
        .with_default_directive(verbosity.unwrap_or(tracing::Level::ERROR).into())
        .from_env_lossy();

    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(telemetry)
        .with(env_filter);

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
