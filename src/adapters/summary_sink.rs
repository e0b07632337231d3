use std::sync::Mutex;

use crate::{
    core::summary::SummaryRecord, ports::summary_sink::SummarySink,
    tracing_setup::ACCESS_LOG_TARGET,
};

/// Writes summaries as structured `tracing` events on the access log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSummarySink;

impl SummarySink for TracingSummarySink {
    fn record(&self, record: SummaryRecord) {
        let trace_id = record.trace_id.as_deref().unwrap_or("");
        let client = record.client.as_deref().unwrap_or("");
        if record.status >= 500 {
            tracing::warn!(
                target: ACCESS_LOG_TARGET,
                method = %record.method,
                route = %record.route,
                status = record.status,
                elapsed_ms = record.elapsed_ms,
                outcome = %record.outcome,
                trace_id,
                request_id = %record.request_id,
                client,
                "request finished"
            );
        } else {
            tracing::info!(
                target: ACCESS_LOG_TARGET,
                method = %record.method,
                route = %record.route,
                status = record.status,
                elapsed_ms = record.elapsed_ms,
                outcome = %record.outcome,
                trace_id,
                request_id = %record.request_id,
                client,
                "request finished"
            );
        }
    }
}

/// Keeps records in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingSummarySink {
    records: Mutex<Vec<SummaryRecord>>,
}

impl CollectingSummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SummaryRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SummarySink for CollectingSummarySink {
    fn record(&self, record: SummaryRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
