//! Log and trace output of the bridge daemon.
//!
//! [`init_tracing`] installs one global subscriber made of three layers:
//!
//! 1. an [`EnvFilter`] – `RUST_LOG` when set, otherwise the `--loglevel`
//!    flag mapped through [`level_directive`];
//! 2. an OpenTelemetry layer, present only when
//!    `OTEL_EXPORTER_OTLP_ENDPOINT` names a collector;
//! 3. a console formatter, compact or JSON lines (`SERIALLINK_LOG_FORMAT`).
//!
//! ```rust,no_run
//! let _guard = seriallink_bridge::telemetry::init_tracing("seriallink-bridge", "info");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Console output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON lines; anything else, or nothing, is
    /// compact.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    fn from_env() -> Self {
        Self::parse(std::env::var("SERIALLINK_LOG_FORMAT").ok().as_deref())
    }
}

/// Install the global subscriber.  Keep the returned guard alive until exit.
pub fn init_tracing(service_name: &str, default_level: &str) -> TracerProviderGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    let provider = otlp_provider(service_name);
    let spans = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("seriallink")));

    tracing_subscriber::registry()
        .with(console)
        .with(spans)
        .with(filter)
        .init();

    TracerProviderGuard(provider)
}

/// Map a `--loglevel` choice onto an [`EnvFilter`] directive.  The
/// `warning` and `critical` spellings are accepted alongside the `tracing`
/// level names.
pub fn level_directive(name: &str) -> &'static str {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

/// Flushes and shuts down the span exporter when dropped.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        let Some(provider) = self.0.take() else {
            return;
        };
        // The subscriber may already be gone, so report on stderr.
        if let Err(e) = provider.shutdown() {
            eprintln!("seriallink-bridge: span exporter shutdown failed: {e}");
        }
    }
}

fn otlp_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint.clone())
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("seriallink-bridge: no span export to {endpoint}: {e}");
            return None;
        }
    };

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();
    // Blocking export: the bridge runs on plain threads.
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
    fn no_endpoint_means_no_span_export() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(otlp_provider("seriallink-test").is_none());
        drop(TracerProviderGuard(None));
    }

    #[test]
    fn log_format_defaults_to_compact() {
        assert_eq!(LogFormat::parse(None), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("text")), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("JSON")), LogFormat::Json);
    }

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(level_directive("debug"), "debug");
        assert_eq!(level_directive("WARNING"), "warn");
        assert_eq!(level_directive("critical"), "error");
        assert_eq!(level_directive("info"), "info");
    }
}
