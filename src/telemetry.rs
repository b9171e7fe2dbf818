use anyhow::{Context, Result, anyhow};
use opentelemetry::trace::{TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::{Context as OtelContext, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, SdkTracer, SdkTracerProvider, SpanExporter,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::callgraph::MethodId;

const SERVICE: &str = "nullflow";
const TRACES_PATH: &str = "/v1/traces";

/// Session phase wrapped in its own span.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Summaries,
    Nullness,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Summaries => "summaries",
            Self::Nullness => "nullness",
        }
    }
}

/// OTLP span export for analysis sessions.
pub(crate) struct Telemetry {
    tracer: SdkTracer,
    provider: SdkTracerProvider,
}

impl Telemetry {
    /// Export spans to an OTLP HTTP collector at `endpoint`.
    pub(crate) fn connect(endpoint: &str) -> Result<Self> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(trace_endpoint(endpoint)?)
            .build()
            .context("build OTLP span exporter")?;
        Ok(Self::with_exporter(exporter))
    }

    /// Flush queued spans.
    pub(crate) fn shutdown(&self) -> Result<()> {
        self.provider
            .shutdown()
            .map_err(|err| anyhow!("shut down tracer provider: {err}"))
    }

    fn with_exporter<E: SpanExporter + 'static>(exporter: E) -> Self {
        // Method spans close on rayon workers; export happens on the processor thread.
        let batch = BatchConfigBuilder::default()
            .with_max_queue_size(65_536)
            .with_max_export_batch_size(4096)
            .with_scheduled_delay(Duration::from_millis(200))
            .build();
        let provider = SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name(SERVICE).build())
            .with_span_processor(
                BatchSpanProcessor::builder(exporter)
                    .with_batch_config(batch)
                    .build(),
            )
            .build();
        let tracer = provider.tracer(SERVICE);
        Self { tracer, provider }
    }

    fn span<T>(&self, name: &'static str, attributes: Vec<KeyValue>, f: impl FnOnce() -> T) -> T {
        self.tracer.in_span(name, |cx| {
            let span = cx.span();
            for attribute in attributes {
                span.set_attribute(attribute);
            }
            f()
        })
    }
}

/// Collector base URLs get the trace path appended.
fn trace_endpoint(endpoint: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(endpoint)
        .with_context(|| format!("parse OTLP endpoint {endpoint}"))?;
    if !url.path().ends_with(TRACES_PATH) {
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}{TRACES_PATH}"));
    }
    Ok(url.to_string())
}

/// Install the stderr subscriber; `NULLFLOW_LOG` overrides the filter.
pub(crate) fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "nullflow=info,warn" };
    let filter = EnvFilter::try_from_env("NULLFLOW_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub(crate) fn phase<T>(telemetry: Option<&Telemetry>, phase: Phase, f: impl FnOnce() -> T) -> T {
    match telemetry {
        Some(telemetry) => telemetry.span(
            "nullflow.phase",
            vec![KeyValue::new("nullflow.phase", phase.as_str())],
            f,
        ),
        None => f(),
    }
}

pub(crate) fn method<T>(telemetry: Option<&Telemetry>, id: &MethodId, f: impl FnOnce() -> T) -> T {
    match telemetry {
        Some(telemetry) => telemetry.span(
            "nullflow.method",
            vec![
                KeyValue::new("nullflow.class", id.class_name.clone()),
                KeyValue::new("nullflow.method", id.name.clone()),
                KeyValue::new("nullflow.descriptor", id.descriptor.clone()),
            ],
            f,
        ),
        None => f(),
    }
}

/// Attach the fixpoint cost to the enclosing method span, if any.
pub(crate) fn record_convergence(passes: usize, blocks: usize) {
    let cx = OtelContext::current();
    let span = cx.span();
    if !span.span_context().is_valid() {
        return;
    }
    span.add_event(
        "converged",
        vec![
            KeyValue::new("nullflow.passes", passes as i64),
            KeyValue::new("nullflow.blocks", blocks as i64),
        ],
    );
}
