//! Logging and metrics for the pdk binaries.
//!
//! Logs go to stdout, formatted for humans unless `RUST_LOG_FORMAT=json`.
//! Traces and metrics are exported over OTLP only when `OTEL_SDK_DISABLED` is
//! set to `false`. Library crates only ever call [`meter`] and the `tracing`
//! macros; counters recorded before initialization are dropped.
use std::{borrow::Cow, time::Duration};

use opentelemetry::{InstrumentationScope, global, trace::TracerProvider as _};
use opentelemetry_otlp::{ExporterBuildError, MetricExporter, SpanExporter};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::SdkTracerProvider,
};
use snafu::{ResultExt, Snafu};
use tracing::Subscriber;
use tracing_opentelemetry::MetricsLayer;
use tracing_subscriber::{EnvFilter, Layer, prelude::*, registry::LookupSpan};

pub use opentelemetry::{
    KeyValue,
    metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter},
};

use crate::format::PdkFormat;

mod format;

const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";
const RUST_LOG_FORMAT: &str = "RUST_LOG_FORMAT";
const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum ObservabilityError {
    #[snafu(display("Failed to build exporter"))]
    Exporter { source: ExporterBuildError },
    #[snafu(display("Failed to install the tracing subscriber"))]
    Subscriber {
        source: tracing_subscriber::util::TryInitError,
    },
}

/// Keeps the OpenTelemetry providers alive.
///
/// Dropping the guard flushes pending spans and metrics.
#[must_use = "dropping the guard shuts down the exporters"]
pub struct ObservabilityGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

pub fn meter(name: &'static str) -> Meter {
    global::meter(name)
}

pub fn init_observability(
    package_name: impl Into<Cow<'static, str>>,
    package_version: impl Into<Cow<'static, str>>,
) -> Result<ObservabilityGuard, ObservabilityError> {
    // Unlike the otel sdk, exports are disabled unless explicitly enabled.
    let sdk_enabled = std::env::var(OTEL_SDK_DISABLED)
        .map(|v| v == "false")
        .unwrap_or(false);

    let (tracer_provider, meter_provider) = providers(sdk_enabled)?;

    let scope = InstrumentationScope::builder(package_name.into())
        .with_version(package_version.into())
        .build();
    let tracer = tracer_provider.tracer_with_scope(scope);

    let otel_layer = env_filter()
        .and_then(MetricsLayer::new(meter_provider.clone()))
        .and_then(tracing_opentelemetry::layer().with_tracer(tracer))
        .boxed();

    tracing_subscriber::registry()
        .with(vec![stdout(), otel_layer])
        .try_init()
        .context(SubscriberSnafu {})?;

    Ok(ObservabilityGuard {
        tracer_provider,
        meter_provider,
    })
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn stdout<S>() -> BoxedLayer<S>
where
    S: Subscriber,
    for<'a> S: LookupSpan<'a>,
{
    let json_fmt = std::env::var(RUST_LOG_FORMAT)
        .map(|val| val == "json")
        .unwrap_or(false);

    if json_fmt {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(env_filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .event_format(PdkFormat::default())
            .fmt_fields(PdkFormat::default())
            .with_filter(env_filter())
            .boxed()
    }
}

fn providers(
    sdk_enabled: bool,
) -> Result<(SdkTracerProvider, SdkMeterProvider), ObservabilityError> {
    let resource = Resource::builder().build();

    let mut tracer_provider = SdkTracerProvider::builder().with_resource(resource.clone());
    let mut meter_provider = SdkMeterProvider::builder().with_resource(resource);

    if sdk_enabled {
        let span_exporter = SpanExporter::builder()
            .with_tonic()
            .build()
            .context(ExporterSnafu {})?;
        tracer_provider = tracer_provider.with_batch_exporter(span_exporter);

        let metric_exporter = MetricExporter::builder()
            .with_tonic()
            .build()
            .context(ExporterSnafu {})?;
        let reader = PeriodicReader::builder(metric_exporter)
            .with_interval(METRICS_EXPORT_INTERVAL)
            .build();
        meter_provider = meter_provider.with_reader(reader);
    }

    let tracer_provider = tracer_provider.build();
    let meter_provider = meter_provider.build();
    global::set_meter_provider(meter_provider.clone());

    Ok((tracer_provider, meter_provider))
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        // Errors only mean there was nothing left to flush.
        let _ = self.meter_provider.shutdown();
        let _ = self.tracer_provider.shutdown();
    }
}
