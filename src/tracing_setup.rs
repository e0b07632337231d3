use eyre::{Result, WrapErr};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::Targets,
    layer::{Layered, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingConfig};

/// Target of the per-request summary records.
pub const ACCESS_LOG_TARGET: &str = "edgeway::access";

/// Target used by the log span exporter.
pub const SPAN_LOG_TARGET: &str = "edgeway::spans";

/// Build the filter directive from the configured level and per-target overrides,
/// e.g. `info,hyper=warn,reqwest=warn`.
pub fn filter_directive(config: &LoggingConfig) -> String {
    let mut targets: Vec<_> = config.filters.iter().collect();
    targets.sort();

    let mut directive = config.level.clone();
    for (target, level) in targets {
        directive.push(',');
        directive.push_str(target);
        directive.push('=');
        directive.push_str(level);
    }
    directive
}

/// Layer forwarding access log records (and nothing else) to an OpenTelemetry
/// logger provider, which ships them to the collector as OTLP logs.
pub fn access_log_layer<S>(provider: &SdkLoggerProvider) -> impl Layer<S> + Send + Sync + use<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    OpenTelemetryTracingBridge::new(provider)
        .with_filter(Targets::new().with_target(ACCESS_LOG_TARGET, Level::INFO))
}

/// Initialize structured logging from the logging configuration.
///
/// `RUST_LOG` takes precedence over the configured level and filters when set.
/// With a logger provider, access log records are also exported over OTLP.
pub fn init_tracing(config: &LoggingConfig, logs: Option<&SdkLoggerProvider>) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directive = filter_directive(config);
            EnvFilter::try_new(&directive)
                .wrap_err_with(|| format!("Invalid log filter: {directive}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(logs.map(access_log_layer::<Layered<EnvFilter, Registry>>))
            .with(
                fmt_layer
                    .json()
                    .with_current_span(false)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(logs.map(access_log_layer::<Layered<EnvFilter, Registry>>))
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init(),
    }
    .wrap_err("Failed to install the tracing subscriber")?;

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        otlp_logs = logs.is_some(),
        "edgeway logging initialized"
    );
    Ok(())
}
