//! Span exporters: OTLP (gRPC or HTTP), structured log, in-memory and no-op.
//!
//! The OTLP exporters turn [`FinishedSpan`]s into SDK [`SpanData`] and hand them to
//! `opentelemetry-otlp`, which owns the wire encoding. The same collector also
//! receives summary records as OTLP logs through [`build_log_provider`].
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use opentelemetry::{
    InstrumentationScope, KeyValue,
    trace::{self as otel, SpanContext, SpanId, Status},
};
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    logs::{SdkLoggerProvider, log_processor_with_async_runtime::BatchLogProcessor},
    runtime,
    trace::{SpanData, SpanEvents, SpanExporter as _, SpanLinks},
};
use opentelemetry_semantic_conventions::resource::{
    DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_INSTANCE_ID, SERVICE_VERSION,
};
use uuid::Uuid;

use crate::{
    config::{ExportProtocol, TelemetryConfig},
    core::{
        error::EdgeError,
        trace::{FinishedSpan, SpanKind},
    },
    ports::span_exporter::{SpanExporter, SpanSink},
    tracing_setup::SPAN_LOG_TARGET,
};

/// OpenTelemetry resource describing this process. Build it once and share it
/// between the span exporter and the log provider so both carry the same
/// `service.instance.id`.
pub fn telemetry_resource(config: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes([
            KeyValue::new(SERVICE_VERSION, config.service_version.clone()),
            KeyValue::new(SERVICE_INSTANCE_ID, Uuid::new_v4().to_string()),
            KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, config.environment.clone()),
        ])
        .build()
}

/// Build the exporter selected by the telemetry configuration.
pub fn build_exporter(
    config: &TelemetryConfig,
    resource: &Resource,
) -> Result<Arc<dyn SpanExporter>, EdgeError> {
    let exporter: Arc<dyn SpanExporter> = match config.exporter.protocol {
        ExportProtocol::Log => Arc::new(LogSpanExporter),
        ExportProtocol::None => Arc::new(NoopExporter),
        ExportProtocol::OtlpGrpc | ExportProtocol::OtlpHttp | ExportProtocol::OtlpHttpJson => {
            Arc::new(OtlpSpanExporter::new(config, resource)?)
        }
    };
    tracing::info!(
        exporter = exporter.name(),
        endpoint = %config.exporter.endpoint,
        "span exporter configured"
    );
    Ok(exporter)
}

/// Logger provider shipping `edgeway::access` records to the collector, or `None`
/// when no OTLP protocol is configured or log export is disabled.
///
/// Batching runs on the Tokio runtime, so this must be called from within one.
pub fn build_log_provider(
    config: &TelemetryConfig,
    resource: &Resource,
) -> Result<Option<SdkLoggerProvider>, EdgeError> {
    let Some(protocol) = otlp_protocol(config.exporter.protocol) else {
        return Ok(None);
    };
    if !config.export_logs {
        return Ok(None);
    }

    let endpoint = signal_endpoint(&config.exporter.endpoint, protocol, "logs");
    let timeout = export_timeout(config)?;
    let builder = opentelemetry_otlp::LogExporter::builder();
    let exporter = match protocol {
        Protocol::Grpc => builder
            .with_tonic()
            .with_endpoint(endpoint)
            .with_timeout(timeout)
            .build(),
        _ => builder
            .with_http()
            .with_protocol(protocol)
            .with_endpoint(endpoint)
            .with_timeout(timeout)
            .build(),
    }
    .map_err(|e| EdgeError::ConfigInvalid(format!("OTLP log exporter: {e}")))?;

    let processor = BatchLogProcessor::builder(exporter, runtime::Tokio).build();
    Ok(Some(
        SdkLoggerProvider::builder()
            .with_resource(resource.clone())
            .with_log_processor(processor)
            .build(),
    ))
}

fn otlp_protocol(protocol: ExportProtocol) -> Option<Protocol> {
    match protocol {
        ExportProtocol::OtlpGrpc => Some(Protocol::Grpc),
        ExportProtocol::OtlpHttp => Some(Protocol::HttpBinary),
        ExportProtocol::OtlpHttpJson => Some(Protocol::HttpJson),
        ExportProtocol::Log | ExportProtocol::None => None,
    }
}

/// Per-signal endpoint. gRPC takes the collector address as is; HTTP transports
/// post to `{base}/v1/{signal}`. A base already ending in a signal path is reduced
/// to the collector root first.
pub fn signal_endpoint(base: &str, protocol: Protocol, signal: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = base
        .strip_suffix("/v1/traces")
        .or_else(|| base.strip_suffix("/v1/logs"))
        .unwrap_or(base);
    match protocol {
        Protocol::Grpc => base.to_string(),
        _ => format!("{base}/v1/{signal}"),
    }
}

fn export_timeout(config: &TelemetryConfig) -> Result<Duration, EdgeError> {
    humantime::parse_duration(&config.exporter.timeout).map_err(|e| {
        EdgeError::ConfigInvalid(format!(
            "telemetry.exporter.timeout '{}': {e}",
            config.exporter.timeout
        ))
    })
}

/// Instrumentation scope stamped on every exported span.
fn edge_scope() -> InstrumentationScope {
    InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .build()
}

/// Convert a finished edge span into the SDK's exportable form.
///
/// A root span carries [`SpanId::INVALID`] as parent, which OTLP encodes as an
/// empty parent id. A server span with a parent continues a remote caller.
pub fn to_span_data(span: FinishedSpan, scope: &InstrumentationScope) -> SpanData {
    let parent_span_is_remote = span.kind == SpanKind::Server && span.parent_span_id.is_some();
    let status = if span.error {
        Status::error(span.outcome.as_str())
    } else {
        Status::Unset
    };

    SpanData {
        span_context: SpanContext::new(
            span.trace_id,
            span.span_id,
            span.trace_flags,
            false,
            span.trace_state,
        ),
        parent_span_id: span.parent_span_id.unwrap_or(SpanId::INVALID),
        parent_span_is_remote,
        span_kind: match span.kind {
            SpanKind::Server => otel::SpanKind::Server,
            SpanKind::Client => otel::SpanKind::Client,
        },
        name: span.name,
        start_time: span.start,
        end_time: span.end,
        attributes: span
            .tags
            .into_iter()
            .map(|(key, value)| KeyValue::new(key, value))
            .collect(),
        dropped_attributes_count: span.dropped_tags,
        events: SpanEvents::default(),
        links: SpanLinks::default(),
        status,
        instrumentation_scope: scope.clone(),
    }
}

/// Ships spans to an OpenTelemetry collector over OTLP.
#[derive(Debug)]
pub struct OtlpSpanExporter {
    inner: opentelemetry_otlp::SpanExporter,
    scope: InstrumentationScope,
    name: &'static str,
}

impl OtlpSpanExporter {
    pub fn new(config: &TelemetryConfig, resource: &Resource) -> Result<Self, EdgeError> {
        let protocol = otlp_protocol(config.exporter.protocol).ok_or_else(|| {
            EdgeError::ConfigInvalid(format!(
                "telemetry.exporter.protocol {:?} is not an OTLP protocol",
                config.exporter.protocol
            ))
        })?;
        let endpoint = signal_endpoint(&config.exporter.endpoint, protocol, "traces");
        let timeout = export_timeout(config)?;

        let builder = opentelemetry_otlp::SpanExporter::builder();
        let mut inner = match protocol {
            Protocol::Grpc => builder
                .with_tonic()
                .with_endpoint(endpoint)
                .with_timeout(timeout)
                .build(),
            _ => builder
                .with_http()
                .with_protocol(protocol)
                .with_endpoint(endpoint)
                .with_timeout(timeout)
                .build(),
        }
        .map_err(|e| EdgeError::ConfigInvalid(format!("OTLP span exporter: {e}")))?;
        inner.set_resource(resource);

        let name = match protocol {
            Protocol::Grpc => "otlp_grpc",
            Protocol::HttpJson => "otlp_http_json",
            _ => "otlp_http",
        };
        Ok(Self {
            inner,
            scope: edge_scope(),
            name,
        })
    }
}

#[async_trait]
impl SpanExporter for OtlpSpanExporter {
    async fn export(&self, batch: Vec<FinishedSpan>) -> Result<(), EdgeError> {
        let batch = batch
            .into_iter()
            .map(|span| to_span_data(span, &self.scope))
            .collect();
        self.inner
            .export(batch)
            .await
            .map_err(|e| EdgeError::ExportFailure(e.to_string()))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Writes every span as one `tracing` event on the span log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSpanExporter;

#[async_trait]
impl SpanExporter for LogSpanExporter {
    async fn export(&self, batch: Vec<FinishedSpan>) -> Result<(), EdgeError> {
        for span in batch {
            let tags = span
                .tags
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!(
                target: SPAN_LOG_TARGET,
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                parent_span_id = %span.parent_span_id.map(|id| id.to_string()).unwrap_or_default(),
                name = %span.name,
                kind = span.kind.as_str(),
                duration_ms = span.duration().as_secs_f64() * 1000.0,
                error = span.error,
                outcome = %span.outcome,
                dropped_tags = span.dropped_tags,
                tags = %tags,
                "span"
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Discards spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

#[async_trait]
impl SpanExporter for NoopExporter {
    async fn export(&self, _batch: Vec<FinishedSpan>) -> Result<(), EdgeError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Keeps spans in memory. Usable both as an exporter and as a direct sink.
#[derive(Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Mutex<Vec<FinishedSpan>>,
}

impl InMemorySpanExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans
            .lock()
            .map(|spans| spans.clone())
            .unwrap_or_default()
    }

    fn push(&self, spans: impl IntoIterator<Item = FinishedSpan>) {
        if let Ok(mut stored) = self.spans.lock() {
            stored.extend(spans);
        }
    }
}

#[async_trait]
impl SpanExporter for InMemorySpanExporter {
    async fn export(&self, batch: Vec<FinishedSpan>) -> Result<(), EdgeError> {
        self.push(batch);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

impl SpanSink for InMemorySpanExporter {
    fn submit(&self, span: FinishedSpan) {
        self.push([span]);
    }
}
