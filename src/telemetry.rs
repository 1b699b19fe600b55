//! Tracing and OpenTelemetry wiring.
//!
//! [`init`] installs the `tracing` subscriber (fmt + `RUST_LOG` filter) and,
//! when an OTLP endpoint is configured, an OpenTelemetry export layer. The
//! W3C trace-context propagator is registered globally either way, so
//! [`inject_trace_context`] always has a propagator to call; without a
//! configured exporter it simply injects nothing.

use opentelemetry::global;
use opentelemetry::propagation::Injector;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing::warn;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Errors during telemetry setup.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(#[from] opentelemetry::trace::TraceError),

    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Guard keeping the tracer provider alive; flushes spans on drop.
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.provider {
            if let Err(error) = provider.shutdown() {
                warn!(error = %error, "tracer provider shutdown failed");
            }
        }
    }
}

/// Install the global subscriber and propagator.
///
/// Call once at process start and hold the returned guard for the process
/// lifetime.
pub fn init(config: &TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    let provider = match &config.otlp_endpoint {
        Some(endpoint) => {
            use opentelemetry_otlp::WithExportConfig;

            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;

            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(
                    Resource::builder()
                        .with_service_name(config.service_name.clone())
                        .build(),
                )
                .build();

            global::set_tracer_provider(provider.clone());
            Some(provider)
        }
        None => None,
    };

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("user-notifier")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(Telemetry { provider })
}

/// Adapter writing propagation pairs into an ordered header list.
struct HeaderInjector<'a>(&'a mut Vec<(String, String)>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.push((key.to_string(), value));
    }
}

/// Inject the current span's trace context into message headers.
///
/// Uses the globally registered text-map propagator; with the W3C
/// propagator this adds `traceparent` (and `tracestate` when present) so
/// the consumer side can continue the distributed trace.
pub fn inject_trace_context(headers: &mut Vec<(String, String)>) {
    let context = tracing::Span::current().context();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut HeaderInjector(headers));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_injector_appends_pairs() {
        let mut headers = Vec::new();
        let mut injector = HeaderInjector(&mut headers);

        injector.set("traceparent", "00-abc-def-01".to_string());
        injector.set("tracestate", "vendor=1".to_string());

        assert_eq!(
            headers,
            vec![
                ("traceparent".to_string(), "00-abc-def-01".to_string()),
                ("tracestate".to_string(), "vendor=1".to_string()),
            ]
        );
    }

    #[test]
    fn test_inject_without_active_span_is_empty() {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let mut headers = Vec::new();
        inject_trace_context(&mut headers);

        // No recording span, nothing to propagate
        assert!(headers.is_empty());
    }
}
