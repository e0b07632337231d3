//! Metrics helpers for the edge pipeline.
//!
//! Thin wrappers over the `metrics` facade macros. No exporter is installed here;
//! the embedding application may install any compatible recorder. Without one the
//! calls are no-ops.
//!
//! Provided metrics:
//! * `edgeway_requests_total` (counter; route, method, status, outcome)
//! * `edgeway_request_duration_seconds` (histogram; route, method)
//! * `edgeway_active_requests` (gauge)
//! * `edgeway_admission_rejections_total` (counter; policy)
//! * `edgeway_limiter_store_failures_total` (counter; policy, decision)
//! * `edgeway_upstream_requests_total` (counter; cluster, result)
//! * `edgeway_upstream_retries_total` (counter; route)
//! * `edgeway_upstream_request_duration_seconds` (histogram; cluster)
//! * `edgeway_spans_exported_total`, `edgeway_spans_dropped_total`,
//!   `edgeway_span_export_failures_total` (counters)
use std::time::{Duration, Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const EDGEWAY_REQUESTS_TOTAL: &str = "edgeway_requests_total";
pub const EDGEWAY_REQUEST_DURATION_SECONDS: &str = "edgeway_request_duration_seconds";
pub const EDGEWAY_ACTIVE_REQUESTS: &str = "edgeway_active_requests";
pub const EDGEWAY_ADMISSION_REJECTIONS_TOTAL: &str = "edgeway_admission_rejections_total";
pub const EDGEWAY_LIMITER_STORE_FAILURES_TOTAL: &str = "edgeway_limiter_store_failures_total";
pub const EDGEWAY_UPSTREAM_REQUESTS_TOTAL: &str = "edgeway_upstream_requests_total";
pub const EDGEWAY_UPSTREAM_RETRIES_TOTAL: &str = "edgeway_upstream_retries_total";
pub const EDGEWAY_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "edgeway_upstream_request_duration_seconds";
pub const EDGEWAY_SPANS_EXPORTED_TOTAL: &str = "edgeway_spans_exported_total";
pub const EDGEWAY_SPANS_DROPPED_TOTAL: &str = "edgeway_spans_dropped_total";
pub const EDGEWAY_SPAN_EXPORT_FAILURES_TOTAL: &str = "edgeway_span_export_failures_total";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        EDGEWAY_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests that passed through the edge pipeline."
    );
    describe_histogram!(
        EDGEWAY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from pipeline entry until the response head was produced."
    );
    describe_gauge!(
        EDGEWAY_ACTIVE_REQUESTS,
        "Number of requests currently inside the pipeline."
    );
    describe_counter!(
        EDGEWAY_ADMISSION_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests rejected by admission control."
    );
    describe_counter!(
        EDGEWAY_LIMITER_STORE_FAILURES_TOTAL,
        Unit::Count,
        "Rate limit decisions made by the store failure policy (decision=allow|deny)."
    );
    describe_counter!(
        EDGEWAY_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Upstream attempts by cluster and result (ok, timeout, unreachable)."
    );
    describe_counter!(
        EDGEWAY_UPSTREAM_RETRIES_TOTAL,
        Unit::Count,
        "Upstream attempts beyond the first."
    );
    describe_histogram!(
        EDGEWAY_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time until an upstream attempt produced a response head or failed."
    );
    describe_counter!(
        EDGEWAY_SPANS_EXPORTED_TOTAL,
        Unit::Count,
        "Spans handed successfully to the exporter."
    );
    describe_counter!(
        EDGEWAY_SPANS_DROPPED_TOTAL,
        Unit::Count,
        "Spans dropped because the export queue was full or closed."
    );
    describe_counter!(
        EDGEWAY_SPAN_EXPORT_FAILURES_TOTAL,
        Unit::Count,
        "Span batches the exporter failed to ship."
    );
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIPTIONS);
    tracing::debug!("edgeway metric descriptions registered");
}

pub fn increment_request_total(route: &str, method: &str, status: u16, outcome: &str) {
    counter!(
        EDGEWAY_REQUESTS_TOTAL,
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(route: &str, method: &str, duration: Duration) {
    histogram!(
        EDGEWAY_REQUEST_DURATION_SECONDS,
        "route" => route.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_admission_rejection(policy: &str) {
    counter!(EDGEWAY_ADMISSION_REJECTIONS_TOTAL, "policy" => policy.to_string()).increment(1);
}

pub fn increment_limiter_store_failure(policy: &str, allowed: bool) {
    let decision = if allowed { "allow" } else { "deny" };
    counter!(
        EDGEWAY_LIMITER_STORE_FAILURES_TOTAL,
        "policy" => policy.to_string(),
        "decision" => decision
    )
    .increment(1);
}

pub fn increment_upstream_request(cluster: &str, result: &'static str) {
    counter!(
        EDGEWAY_UPSTREAM_REQUESTS_TOTAL,
        "cluster" => cluster.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn increment_upstream_retry(route: &str) {
    counter!(EDGEWAY_UPSTREAM_RETRIES_TOTAL, "route" => route.to_string()).increment(1);
}

pub fn add_spans_exported(count: usize) {
    counter!(EDGEWAY_SPANS_EXPORTED_TOTAL).increment(count as u64);
}

pub fn increment_spans_dropped() {
    counter!(EDGEWAY_SPANS_DROPPED_TOTAL).increment(1);
}

pub fn increment_span_export_failure() {
    counter!(EDGEWAY_SPAN_EXPORT_FAILURES_TOTAL).increment(1);
}

/// RAII guard tracking one in-flight request in the active-requests gauge.
pub struct ActiveRequestGuard(());

impl ActiveRequestGuard {
    pub fn new() -> Self {
        gauge!(EDGEWAY_ACTIVE_REQUESTS).increment(1.0);
        Self(())
    }
}

impl Default for ActiveRequestGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        gauge!(EDGEWAY_ACTIVE_REQUESTS).decrement(1.0);
    }
}

/// RAII helper measuring one upstream attempt.
pub struct UpstreamTimer {
    start: Instant,
    cluster: String,
}

impl UpstreamTimer {
    pub fn new(cluster: &str) -> Self {
        Self {
            start: Instant::now(),
            cluster: cluster.to_string(),
        }
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        histogram!(
            EDGEWAY_UPSTREAM_REQUEST_DURATION_SECONDS,
            "cluster" => self.cluster.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
