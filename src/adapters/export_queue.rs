//! Bounded, non-blocking span export pipeline.
//!
//! Request paths hand spans to [`ExportQueue`] with `try_send` only. A background
//! [`ExportWorker`] batches them by size or flush interval and calls the exporter
//! with a timeout. A full queue drops the new span; a failing exporter loses the
//! batch. Neither ever reaches the request.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TelemetryConfig,
    core::{error::EdgeError, trace::FinishedSpan},
    metrics,
    ports::span_exporter::{SpanExporter, SpanSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSettings {
    pub capacity: usize,
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    pub export_timeout: Duration,
}

impl ExportSettings {
    pub fn from_config(config: &TelemetryConfig) -> Result<Self, EdgeError> {
        let duration = |field: &str, value: &str| {
            humantime::parse_duration(value)
                .map_err(|e| EdgeError::ConfigInvalid(format!("{field} '{value}': {e}")))
        };
        Ok(Self {
            capacity: config.queue_capacity.max(1),
            max_batch_size: config.max_batch_size.max(1),
            flush_interval: duration("telemetry.flush_interval", &config.flush_interval)?,
            export_timeout: duration("telemetry.exporter.timeout", &config.exporter.timeout)?,
        })
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            capacity: 2048,
            max_batch_size: 256,
            flush_interval: Duration::from_secs(2),
            export_timeout: Duration::from_secs(5),
        }
    }
}

/// Producer side of the export queue.
#[derive(Debug)]
pub struct ExportQueue {
    tx: mpsc::Sender<FinishedSpan>,
    dropped: AtomicU64,
}

impl ExportQueue {
    /// Spans dropped so far because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drop_span(&self, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::increment_spans_dropped();
        tracing::debug!(reason, "dropping span");
    }
}

impl SpanSink for ExportQueue {
    fn submit(&self, span: FinishedSpan) {
        match self.tx.try_send(span) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.drop_span("export queue full"),
            Err(TrySendError::Closed(_)) => self.drop_span("export queue closed"),
        }
    }
}

/// Background task draining the queue into the exporter.
pub struct ExportWorker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ExportWorker {
    /// Stop accepting work, flush what is queued and wait up to `timeout` for it.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => tracing::info!("span export worker stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "span export worker failed"),
            Err(_) => tracing::warn!(?timeout, "span export worker did not finish flushing in time"),
        }
    }
}

/// Create the queue and spawn its worker on the current runtime.
pub fn spawn_export_queue(
    exporter: Arc<dyn SpanExporter>,
    settings: ExportSettings,
) -> (Arc<ExportQueue>, ExportWorker) {
    let (tx, rx) = mpsc::channel(settings.capacity);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_worker(exporter, settings, rx, cancel.clone()));

    (
        Arc::new(ExportQueue {
            tx,
            dropped: AtomicU64::new(0),
        }),
        ExportWorker { handle, cancel },
    )
}

async fn run_worker(
    exporter: Arc<dyn SpanExporter>,
    settings: ExportSettings,
    mut rx: mpsc::Receiver<FinishedSpan>,
    cancel: CancellationToken,
) {
    let mut batch = Vec::with_capacity(settings.max_batch_size);
    let mut ticker = tokio::time::interval(settings.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(span) => {
                    batch.push(span);
                    if batch.len() >= settings.max_batch_size {
                        flush(exporter.as_ref(), &mut batch, settings.export_timeout).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(exporter.as_ref(), &mut batch, settings.export_timeout).await;
                }
            }
        }
    }

    rx.close();
    while let Ok(span) = rx.try_recv() {
        batch.push(span);
        if batch.len() >= settings.max_batch_size {
            flush(exporter.as_ref(), &mut batch, settings.export_timeout).await;
        }
    }
    if !batch.is_empty() {
        flush(exporter.as_ref(), &mut batch, settings.export_timeout).await;
    }
}

async fn flush(exporter: &dyn SpanExporter, batch: &mut Vec<FinishedSpan>, timeout: Duration) {
    let spans = std::mem::take(batch);
    let count = spans.len();

    match tokio::time::timeout(timeout, exporter.export(spans)).await {
        Ok(Ok(())) => {
            metrics::add_spans_exported(count);
            tracing::trace!(count, exporter = exporter.name(), "exported spans");
        }
        Ok(Err(e)) => {
            metrics::increment_span_export_failure();
            tracing::warn!(error = %e, count, exporter = exporter.name(), "span export failed");
        }
        Err(_) => {
            metrics::increment_span_export_failure();
            tracing::warn!(?timeout, count, exporter = exporter.name(), "span export timed out");
        }
    }
}
