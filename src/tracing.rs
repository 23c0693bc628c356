use std::io::IsTerminal;

use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use tracing::error;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, Layer};

use crate::config::{ServerConfig, TracingExporter};

pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    // RUST_LOG used to control logging level.
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

pub fn get_log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    // The stdout exporter prints each span with its timing when it closes.
    let span_events = match config.telemetry.tracing_exporter {
        Some(TracingExporter::Stdout) => FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    };

    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_list(false)
                .flatten_event(true)
                .with_span_events(span_events),
        );
    }

    Box::new(
        tracing_subscriber::fmt::layer()
            .with_ansi(std::io::stderr().is_terminal())
            .with_span_events(span_events)
            .compact(),
    )
}

fn otlp_tracer_provider(config: &ServerConfig) -> Result<SdkTracerProvider> {
    let mut span_exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint.clone());
    }
    let span_exporter = span_exporter.build()?;

    let tracer_provider = TracerProviderBuilder::default()
        .with_resource(
            Resource::builder_empty()
                .with_service_name("scan-scheduler-server")
                .build(),
        )
        .with_simple_exporter(span_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());
    Ok(tracer_provider)
}

/// Installs the global subscriber. Returns the tracer provider when spans are
/// exported over OTLP, so that the caller can flush it on shutdown.
pub fn setup_tracing(config: &ServerConfig) -> Result<Option<SdkTracerProvider>> {
    let log_layer = get_log_layer(config).with_filter(get_env_filter());
    let base = tracing_subscriber::Registry::default().with(log_layer);

    let Some(TracingExporter::Otlp) = config.telemetry.tracing_exporter else {
        if let Err(e) = tracing::subscriber::set_global_default(base) {
            error!("logger was already initiated, continuing: {:?}", e);
        }
        return Ok(None);
    };

    let tracer_provider = otlp_tracer_provider(config)?;
    let span_layer = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer("scan-scheduler-server"))
        .with_filter(get_env_filter());
    if let Err(e) = tracing::subscriber::set_global_default(base.with(span_layer)) {
        error!("logger was already initiated, continuing: {:?}", e);
    }
    Ok(Some(tracer_provider))
}
