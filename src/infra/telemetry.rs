//! Logging and trace-context plumbing
//!
//! `init_logging` sets up the `tracing` subscriber. `Telemetry` owns the
//! OpenTelemetry tracer provider for the lifetime of the process; nothing in
//! this crate registers it globally, so trace context always travels as an
//! explicit `opentelemetry::Context`.

use crate::domain::message::OutboundMessage;
use hyper::HeaderMap;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use tracing::warn;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging with configurable level via RUST_LOG env var
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();
}

/// Process-wide tracer provider handle
pub struct Telemetry {
    provider: SdkTracerProvider,
}

impl Telemetry {
    /// Provider without an exporter. Spans still get real trace/span ids,
    /// which is all propagation needs.
    pub fn new() -> Self {
        Self { provider: SdkTracerProvider::builder().build() }
    }

    pub fn tracer(&self, name: &'static str) -> SdkTracer {
        self.provider.tracer(name)
    }

    pub fn shutdown(self) {
        if let Err(e) = self.provider.shutdown() {
            warn!(error = %e, "tracer_provider_shutdown_failed");
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts W3C trace context headers from an HTTP header map.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

/// Writes propagation fields as message properties.
pub struct PropertyInjector<'a>(pub &'a mut OutboundMessage);

impl Injector for PropertyInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        // the propagator always emits tracestate, even when it has no entries
        if value.is_empty() {
            return;
        }
        self.0.insert_property(key, value);
    }
}

/// Parent context carried by incoming request headers. Returns an empty
/// context when the request carries none.
pub fn extract_from_headers(headers: &HeaderMap) -> Context {
    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}

/// Add `traceparent` (and `tracestate` when non-empty) for `cx` to the message
pub fn inject_into_message(cx: &Context, message: &mut OutboundMessage) {
    TraceContextPropagator::new().inject_context(cx, &mut PropertyInjector(message));
}
