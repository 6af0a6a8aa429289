//! Log and trace bootstrap for the `tako` binary.
//!
//! [`init_tracing`] installs the process-global subscriber: a compact fmt
//! layer filtered by `RUST_LOG` (defaulting to `info` when unset), and,
//! when requested, an OpenTelemetry bridge exporting spans to stdout. The
//! stdout exporter is deliberate: swapping in OTLP is a deployment
//! concern, not something the engine decides.

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Provider handle kept for the final flush in [`shutdown_tracing`].
static OTEL_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the global subscriber. Call once, early in `main`.
///
/// # Errors
///
/// Fails if another subscriber was already installed.
pub fn init_tracing(enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().compact().with_target(true);
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    if !enable_otel {
        registry.try_init()?;
        return Ok(());
    }

    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    let bridge = tracing_opentelemetry::layer().with_tracer(provider.tracer("tako"));
    let _ = OTEL_PROVIDER.set(provider);

    registry.with(bridge).try_init()?;
    Ok(())
}

/// Flush buffered spans before process exit. No-op when OTel was never
/// enabled.
pub fn shutdown_tracing() {
    let Some(provider) = OTEL_PROVIDER.get() else {
        return;
    };
    if let Err(err) = provider.shutdown() {
        tracing::warn!(%err, "otel provider shutdown failed");
    }
}
