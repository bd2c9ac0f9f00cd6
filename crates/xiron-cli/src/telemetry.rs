//! Tracing setup for the `xiron` binary.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `XIRON_LOG_FORMAT=json` | Newline-delimited JSON logs instead of compact text. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | When set, spans are also exported over OTLP/HTTP. |
//!
//! Logs go to stderr so command output on stdout stays pipeable.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Hold the returned guard until exit; dropping
/// it flushes exported spans.
///
/// Calling this twice leaves the first subscriber in place.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var("XIRON_LOG_FORMAT").as_deref() == Ok("json");

    let provider = build_provider(service_name, std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok());
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("xiron")));

    let (json_layer, compact_layer) = if use_json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().compact().with_writer(std::io::stderr)))
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(json_layer)
        .with(compact_layer)
        .try_init();

    TracerProviderGuard(provider)
}

/// Shuts the OTLP provider down on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[xiron] OpenTelemetry shutdown error: {e}");
        }
    }
}

/// `None` when no endpoint is configured or the exporter cannot be built.
fn build_provider(service_name: &str, endpoint: Option<String>) -> Option<SdkTracerProvider> {
    let endpoint = endpoint?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[xiron] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder().with_service_name(service_name.to_string()).build();

    // Simple exporter: tracing starts before the Tokio runtime exists.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_endpoint_means_no_provider() {
        assert!(build_provider("xiron-test", None).is_none());
    }

    #[test]
    fn empty_guard_drops_cleanly() {
        drop(TracerProviderGuard(None));
    }

    #[test]
    fn init_twice_does_not_panic() {
        let _a = init_tracing("xiron-test");
        let _b = init_tracing("xiron-test");
        tracing::info!("still logging");
    }
}
