use opentelemetry::trace::TracerProvider;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LoggingFormat, TelemetryConfig};

/// Flushes and shuts down the OTLP exporter when dropped.
pub struct OtelGuard {
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.as_mut()
            && let Err(err) = provider.shutdown()
        {
            eprintln!("{err:?}");
        }
    }
}

fn resource(name: &str) -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(name.to_string())
        .with_schema_url(
            [
                opentelemetry::KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
                    env!("CARGO_PKG_VERSION"),
                ),
                opentelemetry::KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
                    name.to_string(),
                ),
            ],
            opentelemetry_semantic_conventions::SCHEMA_URL,
        )
        .build()
}

fn init_tracer_provider(
    name: &str,
) -> anyhow::Result<opentelemetry_sdk::trace::SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;

    Ok(opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_sampler(opentelemetry_sdk::trace::Sampler::ParentBased(Box::new(
            opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(1.0),
        )))
        .with_id_generator(opentelemetry_sdk::trace::RandomIdGenerator::default())
        .with_resource(resource(name))
        .with_batch_exporter(exporter)
        .build())
}

/// Default filter when `RUST_LOG` is unset. HTTP client internals stay at
/// `warn` so storage fetches do not flood the log.
fn default_directives(config: &TelemetryConfig) -> String {
    format!(
        "{},axum={},hyper=warn,reqwest=warn",
        tracing::Level::from(config.level),
        tracing::Level::from(config.axum_level),
    )
}

/// Initializes the global subscriber. Keep the returned guard alive for the
/// life of the process.
pub fn init(config: &TelemetryConfig) -> anyhow::Result<OtelGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));

    let fmt_layer = match config.format {
        LoggingFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .boxed(),
        LoggingFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .boxed(),
    };

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if !config.otlp_enabled {
        registry.try_init()?;
        return Ok(OtelGuard {
            tracer_provider: None,
        });
    }

    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );

    let tracer_provider = init_tracer_provider(&config.service_name)?;
    let tracer = tracer_provider.tracer("bindery");

    registry
        .with(tracing_opentelemetry::OpenTelemetryLayer::new(tracer))
        .try_init()?;

    Ok(OtelGuard {
        tracer_provider: Some(tracer_provider),
    })
}
