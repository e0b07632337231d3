use crate::core::summary::SummaryRecord;

/// Destination of per-request summary records.
pub trait SummarySink: Send + Sync + 'static {
    /// Called exactly once per request. Must not block.
    fn record(&self, record: SummaryRecord);
}
