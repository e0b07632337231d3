use async_trait::async_trait;

use crate::core::{error::EdgeError, trace::FinishedSpan};

/// Ships batches of finished spans to a telemetry backend.
///
/// Implementations may be slow or fail; they are only ever driven by the export
/// worker, never from the request path.
#[async_trait]
pub trait SpanExporter: Send + Sync + 'static {
    /// Export one batch. Failures are reported as [`EdgeError::ExportFailure`].
    async fn export(&self, batch: Vec<FinishedSpan>) -> Result<(), EdgeError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Non-blocking hand-off point for spans leaving the request path.
pub trait SpanSink: Send + Sync + 'static {
    /// Accept a finished span. Must never block or wait on I/O.
    fn submit(&self, span: FinishedSpan);
}
