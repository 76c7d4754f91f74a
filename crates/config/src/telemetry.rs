use std::{collections::HashMap, net::SocketAddr, time::Duration};

use clap::Parser;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use opentelemetry::KeyValue;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{ExporterBuildError, LogExporter, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::{Resource, logs::SdkLoggerProvider};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// The environment variable holding the bearer token of the OTLP logs endpoint.
const OTLP_TOKEN_ENV: &str = "KEEL_OTLP_TOKEN";

/// Telemetry-related configuration options
#[derive(Debug, Clone, Parser)]
pub struct TelemetryOpts {
    /// Whether to use ANSI colors in the logs. Disable if you're piping logs to a file or using
    /// third party services to collect logs, like kubectl/cloudwatch/loki etc.
    #[clap(long = "telemetry.use-ansi", env = "KEEL_TELEMETRY_USE_ANSI", default_value_t = true)]
    pub use_ansi: bool,
    /// An OTLP/HTTP logs endpoint to export logs to, in addition to stdout. The bearer token,
    /// if any, is read from `KEEL_OTLP_TOKEN`.
    #[clap(long = "telemetry.otlp-endpoint", env = "KEEL_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<Url>,
    /// The port to listen for Prometheus metrics. Default is `9090`.
    #[clap(long = "metrics.port", env = "KEEL_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,
    /// Disable metrics collection. Default is `false`.
    #[clap(long = "metrics.disable", env = "KEEL_DISABLE_METRICS", default_value_t = false)]
    pub disable_metrics: bool,
}

/// Errors raised while setting up telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The Prometheus exporter could not be installed.
    #[error("Failed to install Prometheus exporter: {0}")]
    Prometheus(#[from] BuildError),
    /// The OTLP log exporter could not be built.
    #[error("Failed to build OTLP log exporter: {0}")]
    Otlp(#[from] ExporterBuildError),
}

/// A wrapper around the OpenTelemetry logger provider.
#[derive(Debug, Default)]
pub struct LogProvider {
    inner: Option<SdkLoggerProvider>,
}

impl LogProvider {
    /// Set the OpenTelemetry logger provider.
    pub fn set_provider(&mut self, provider: SdkLoggerProvider) {
        self.inner = Some(provider);
    }

    /// Shutdown the OpenTelemetry logger provider, flushing pending logs.
    pub fn shutdown(&self) {
        if let Some(provider) = self.inner.as_ref() {
            // Nothing left to report to at this point.
            let _ = provider.shutdown();
        }
    }
}

impl TelemetryOpts {
    /// Setup the telemetry stack for Keel.
    ///
    /// 1. Tracing to stdout, and to an OTLP endpoint if configured
    /// 2. Metrics collection with Prometheus (if enabled)
    pub fn setup(&self, instance_name: &str) -> Result<LogProvider, TelemetryError> {
        let mut global_provider = LogProvider::default();
        let registry = tracing_subscriber::registry()
            .with(EnvFilter::from_env("RUST_LOG"))
            .with(tracing_subscriber::fmt::layer().with_ansi(self.use_ansi));

        if let Some(endpoint) = &self.otlp_endpoint {
            let provider = build_otlp_provider(endpoint, instance_name)?;
            let layer = OpenTelemetryTracingBridge::new(&provider);
            global_provider.set_provider(provider);
            registry.with(layer).init();
            info!(%endpoint, "OTLP log export enabled");
        } else {
            registry.init();
        }

        if !self.disable_metrics {
            let prometheus_address = SocketAddr::from(([0, 0, 0, 0], self.metrics_port));

            PrometheusBuilder::new()
                .with_http_listener(prometheus_address)
                .add_global_label("instance", instance_name)
                .install()?;

            info!("Metrics enabled on {}", prometheus_address);
        }

        Ok(global_provider)
    }
}

/// Builds an OTLP/HTTP log provider exporting to `endpoint`.
fn build_otlp_provider(endpoint: &Url, name: &str) -> Result<SdkLoggerProvider, ExporterBuildError> {
    let mut headers = HashMap::new();
    if let Ok(token) = std::env::var(OTLP_TOKEN_ENV) {
        headers.insert("Authorization".to_owned(), format!("Bearer {}", token));
    }

    let exporter = LogExporter::builder()
        .with_http()
        .with_headers(headers)
        .with_endpoint(endpoint.as_str())
        .with_timeout(Duration::from_secs(5))
        .build()?;

    let provider = SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                // OTLP convention
                .with_attribute(KeyValue::new("service.name", name.to_owned()))
                .build(),
        )
        .build();

    Ok(provider)
}
