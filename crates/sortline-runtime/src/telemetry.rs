//! Process-wide log and span setup for the `sortline` binary.
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | `EnvFilter` directives, `info` when unset or invalid |
//! | `SORTLINE_LOG_FORMAT` | `json` for newline-delimited JSON, anything else for compact text |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | When set, `detection_cycle` spans go to this OTLP/HTTP collector |

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Console log encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Interpret a `SORTLINE_LOG_FORMAT` value.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Install the global subscriber.  Call once, before the first log line.
///
/// Keep the returned guard alive until exit: dropping it flushes and shuts
/// down span export.
pub fn init_tracing(service_name: &str) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::from_setting(std::env::var("SORTLINE_LOG_FORMAT").ok().as_deref());
    let provider = otlp_provider(
        service_name,
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
    );

    let spans = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("sortline")));
    let registry = tracing_subscriber::registry().with(filter).with(spans);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .init(),
    }

    TelemetryGuard { provider }
}

/// Owns the span exporter, if any.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("[sortline] span export shutdown failed: {e}");
        }
    }
}

/// Span exporter for `endpoint`; `None` without an endpoint or when the
/// exporter cannot be built (reported on stderr, logging continues).
fn otlp_provider(service_name: &str, endpoint: Option<String>) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint?)
        .build()
        .map_err(|e| eprintln!("[sortline] OTLP exporter init failed: {e}"))
        .ok()?;

    // Synchronous export; nothing here depends on a running runtime.
    let provider = SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .with_simple_exporter(exporter)
        .build();
    Some(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_setting() {
        assert_eq!(LogFormat::from_setting(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::from_setting(Some(" JSON ")), LogFormat::Json);
        assert_eq!(LogFormat::from_setting(Some("pretty")), LogFormat::Compact);
        assert_eq!(LogFormat::from_setting(None), LogFormat::Compact);
    }

    #[test]
    fn no_endpoint_means_no_export() {
        assert!(otlp_provider("sortline-test", None).is_none());
    }

    #[test]
    fn idle_guard_drops_quietly() {
        let guard = TelemetryGuard { provider: None };
        assert!(!guard.is_exporting());
        drop(guard);
    }
}
