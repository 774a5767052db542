use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Layer, Registry};

/// Output format of the log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> Option<TraceId> {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    match tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
    {
        TraceId::INVALID => None,
        valid => Some(valid),
    }
}

#[cfg(feature = "telemetry")]
fn tracer_provider() -> anyhow::Result<opentelemetry_sdk::trace::SdkTracerProvider> {
    use anyhow::Context as _;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};

    let endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
        .context("Need a otel tracing collector configured via OPENTELEMETRY_ENDPOINT_URL")?;

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("Failed to create OTLP span exporter")?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name("example-operator")
                .build(),
        )
        .build())
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` selects the filter and falls back to `info` when unset or invalid.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "telemetry")]
    let collector = {
        use opentelemetry::trace::TracerProvider as _;
        let provider = tracer_provider()?;
        let tracer = provider.tracer("example-operator");
        // the global provider keeps the batch exporter alive
        opentelemetry::global::set_tracer_provider(provider);
        Registry::default()
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .with(fmt_layer(format))
            .with(env_filter)
    };
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default().with(fmt_layer(format)).with(env_filter);

    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}
