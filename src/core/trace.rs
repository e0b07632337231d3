//! W3C trace context handling and request spans.
//!
//! Inbound `traceparent`/`tracestate` headers are parsed with the SDK's
//! [`TraceContextPropagator`]. A valid header continues the caller's trace; anything
//! else starts a new one. Every hop gets its own span id and remembers its parent,
//! so the server span of a request and the client spans of its upstream attempts
//! form one tree under a single trace id.
//!
//! Spans are plain values owned by the request. When a span ends it is handed to a
//! [`SpanSink`] which must not block; shipping to a backend happens elsewhere.
use std::{
    borrow::Cow,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use opentelemetry::{
    Context,
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{IdGenerator, RandomIdGenerator},
};
use opentelemetry_semantic_conventions::attribute::{ERROR_TYPE, HTTP_RESPONSE_STATUS_CODE};

use crate::{core::context::Outcome, ports::span_exporter::SpanSink};

/// Tag carrying the edge outcome when it is anything but `completed`.
pub const OUTCOME_TAG: &str = "edge.outcome";

/// Default cap on tags per span.
pub const DEFAULT_MAX_TAGS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Server,
    Client,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Server => "server",
            SpanKind::Client => "client",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    I64(i64),
    Bool(bool),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Str(v) => f.write_str(v),
            TagValue::I64(v) => write!(f, "{v}"),
            TagValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::I64(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::I64(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<TagValue> for opentelemetry::Value {
    fn from(value: TagValue) -> Self {
        match value {
            TagValue::Str(v) => v.into(),
            TagValue::I64(v) => v.into(),
            TagValue::Bool(v) => v.into(),
        }
    }
}

pub type Tag = (Cow<'static, str>, TagValue);

/// An ended, immutable span ready for export.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub trace_flags: TraceFlags,
    pub trace_state: TraceState,
    pub name: Cow<'static, str>,
    pub kind: SpanKind,
    pub tags: Vec<Tag>,
    pub dropped_tags: u32,
    pub start: SystemTime,
    pub end: SystemTime,
    pub error: bool,
    pub outcome: Outcome,
}

impl FinishedSpan {
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// An open span owned by one request.
///
/// Dropping it without calling [`ActiveSpan::end`] closes it as cancelled, so a
/// request abandoned mid-flight never leaves an orphaned span behind.
pub struct ActiveSpan {
    context: SpanContext,
    parent_span_id: Option<SpanId>,
    name: Cow<'static, str>,
    kind: SpanKind,
    tags: Vec<Tag>,
    dropped_tags: u32,
    max_tags: usize,
    start: SystemTime,
    finished: bool,
    sink: Arc<dyn SpanSink>,
}

impl ActiveSpan {
    pub fn trace_id(&self) -> TraceId {
        self.context.trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.context.span_id()
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.context
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the span once more is known about the request (e.g. its route).
    pub fn update_name(&mut self, name: impl Into<Cow<'static, str>>) {
        self.name = name.into();
    }

    /// Set a tag, replacing an existing value for the same key. New keys beyond the
    /// cap are counted as dropped.
    pub fn set_tag(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<TagValue>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.tags.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else if self.tags.len() < self.max_tags {
            self.tags.push((key, value));
        } else {
            self.dropped_tags += 1;
        }
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Close the span. It is errored for 5xx statuses and failure outcomes.
    pub fn end(mut self, status: Option<StatusCode>, outcome: Outcome) {
        self.finish(status, outcome);
    }

    fn finish(&mut self, status: Option<StatusCode>, outcome: Outcome) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Some(status) = status {
            self.set_tag(HTTP_RESPONSE_STATUS_CODE, i64::from(status.as_u16()));
        }
        if outcome != Outcome::Completed {
            self.set_tag(OUTCOME_TAG, outcome.as_str());
        }
        let error = status.is_some_and(|s| s.is_server_error()) || outcome.is_failure();
        if error && self.tag(ERROR_TYPE).is_none() {
            let error_type = match status {
                Some(status) if status.is_server_error() => status.as_u16().to_string(),
                _ => outcome.as_str().to_string(),
            };
            self.set_tag(ERROR_TYPE, error_type);
        }

        self.sink.submit(FinishedSpan {
            trace_id: self.context.trace_id(),
            span_id: self.context.span_id(),
            parent_span_id: self.parent_span_id,
            trace_flags: self.context.trace_flags(),
            trace_state: self.context.trace_state().clone(),
            name: std::mem::take(&mut self.name),
            kind: self.kind,
            tags: std::mem::take(&mut self.tags),
            dropped_tags: self.dropped_tags,
            start: self.start,
            end: SystemTime::now(),
            error,
            outcome,
        });
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(None, Outcome::Cancelled);
        }
    }
}

impl fmt::Debug for ActiveSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSpan")
            .field("trace_id", &self.context.trace_id())
            .field("span_id", &self.context.span_id())
            .field("parent_span_id", &self.parent_span_id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

/// Creates, propagates and closes request spans.
pub struct TraceContextManager {
    propagator: TraceContextPropagator,
    ids: RandomIdGenerator,
    sink: Arc<dyn SpanSink>,
    max_tags: usize,
}

impl TraceContextManager {
    pub fn new(sink: Arc<dyn SpanSink>) -> Self {
        Self {
            propagator: TraceContextPropagator::new(),
            ids: RandomIdGenerator::default(),
            sink,
            max_tags: DEFAULT_MAX_TAGS,
        }
    }

    pub fn with_max_tags(mut self, max_tags: usize) -> Self {
        self.max_tags = max_tags;
        self
    }

    /// Open the server span for an inbound request, continuing the caller's trace
    /// when the headers carry a valid `traceparent`.
    pub fn begin(&self, name: impl Into<Cow<'static, str>>, headers: &HeaderMap) -> ActiveSpan {
        let cx = self.propagator.extract(&HeaderExtractor(headers));
        let span = cx.span();
        let remote = span.span_context();

        let (trace_id, parent, flags, state) = if remote.is_valid() {
            (
                remote.trace_id(),
                Some(remote.span_id()),
                remote.trace_flags(),
                remote.trace_state().clone(),
            )
        } else {
            (
                self.ids.new_trace_id(),
                None,
                TraceFlags::SAMPLED,
                TraceState::default(),
            )
        };

        let context = SpanContext::new(trace_id, self.ids.new_span_id(), flags, false, state);
        self.open(context, parent, name.into(), SpanKind::Server)
    }

    /// Open a client span for one upstream attempt, as a child of `parent`.
    pub fn start_client(
        &self,
        parent: &ActiveSpan,
        name: impl Into<Cow<'static, str>>,
    ) -> ActiveSpan {
        let parent_cx = parent.span_context();
        let context = SpanContext::new(
            parent_cx.trace_id(),
            self.ids.new_span_id(),
            parent_cx.trace_flags(),
            false,
            parent_cx.trace_state().clone(),
        );
        self.open(context, Some(parent_cx.span_id()), name.into(), SpanKind::Client)
    }

    /// Write `traceparent` (and `tracestate` when present) naming `span` as parent.
    pub fn inject(&self, span: &ActiveSpan, headers: &mut HeaderMap) {
        let cx = Context::new().with_remote_span_context(span.span_context().clone());
        self.propagator
            .inject_context(&cx, &mut HeaderInjector(headers));
    }

    pub fn enrich(&self, span: &mut ActiveSpan, key: impl Into<Cow<'static, str>>, value: impl Into<TagValue>) {
        span.set_tag(key, value);
    }

    pub fn end(&self, span: ActiveSpan, status: Option<StatusCode>, outcome: Outcome) {
        span.end(status, outcome);
    }

    fn open(
        &self,
        context: SpanContext,
        parent_span_id: Option<SpanId>,
        name: Cow<'static, str>,
        kind: SpanKind,
    ) -> ActiveSpan {
        ActiveSpan {
            context,
            parent_span_id,
            name,
            kind,
            tags: Vec::with_capacity(16),
            dropped_tags: 0,
            max_tags: self.max_tags,
            start: SystemTime::now(),
            finished: false,
            sink: self.sink.clone(),
        }
    }
}

impl fmt::Debug for TraceContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContextManager")
            .field("max_tags", &self.max_tags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<FinishedSpan>>);

    impl SpanSink for Collect {
        fn submit(&self, span: FinishedSpan) {
            self.0.lock().unwrap().push(span);
        }
    }

    fn manager() -> (TraceContextManager, Arc<Collect>) {
        let sink = Arc::new(Collect::default());
        (TraceContextManager::new(sink.clone()), sink)
    }

    const PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_begin_continues_inbound_trace() {
        let (manager, _) = manager();
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", HeaderValue::from_static(PARENT));
        headers.insert("tracestate", HeaderValue::from_static("vendor=abc"));

        let span = manager.begin("GET /catalog", &headers);
        assert_eq!(
            span.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert_eq!(
            span.parent_span_id(),
            Some(SpanId::from_hex("00f067aa0ba902b7").unwrap())
        );
        assert_ne!(span.span_id(), SpanId::from_hex("00f067aa0ba902b7").unwrap());
        assert_eq!(span.span_context().trace_state().get("vendor"), Some("abc"));
    }

    #[test]
    fn test_begin_mints_trace_for_invalid_header() {
        let (manager, _) = manager();
        let mut headers = HeaderMap::new();
        headers.insert("traceparent", HeaderValue::from_static("00-garbage-01"));

        let span = manager.begin("GET /", &headers);
        assert_ne!(span.trace_id(), TraceId::INVALID);
        assert_eq!(span.parent_span_id(), None);

        let other = manager.begin("GET /", &HeaderMap::new());
        assert_ne!(span.trace_id(), other.trace_id());
    }

    #[test]
    fn test_client_span_and_injection() {
        let (manager, _) = manager();
        let server = manager.begin("GET /", &HeaderMap::new());
        let client = manager.start_client(&server, "GET upstream");

        assert_eq!(client.trace_id(), server.trace_id());
        assert_eq!(client.parent_span_id(), Some(server.span_id()));
        assert_ne!(client.span_id(), server.span_id());

        let mut outbound = HeaderMap::new();
        manager.inject(&client, &mut outbound);
        let traceparent = outbound["traceparent"].to_str().unwrap();
        assert_eq!(
            traceparent,
            format!("00-{}-{}-01", client.trace_id(), client.span_id())
        );
    }

    #[test]
    fn test_tags_are_bounded_and_replaceable() {
        let (manager, sink) = manager();
        let mut span = manager.begin("GET /", &HeaderMap::new());
        let manager = manager.with_max_tags(2);
        let mut bounded = manager.begin("GET /", &HeaderMap::new());

        bounded.set_tag("a", "1");
        bounded.set_tag("b", "2");
        bounded.set_tag("c", "3");
        bounded.set_tag("a", "4");
        assert_eq!(bounded.tag("a"), Some(&TagValue::from("4")));
        assert_eq!(bounded.tag("c"), None);

        manager.enrich(&mut span, "user_agent.original", "curl/8");
        bounded.end(Some(StatusCode::OK), Outcome::Completed);
        span.end(Some(StatusCode::OK), Outcome::Completed);

        let spans = sink.0.lock().unwrap();
        // The status tag is also beyond the cap of the bounded span.
        assert_eq!(spans[0].dropped_tags, 2);
        assert!(!spans[0].error);
        assert_eq!(spans[1].tag("user_agent.original"), Some(&TagValue::from("curl/8")));
    }

    #[test]
    fn test_end_marks_errors() {
        let (manager, sink) = manager();
        manager
            .begin("GET /", &HeaderMap::new())
            .end(Some(StatusCode::BAD_GATEWAY), Outcome::ForwardFailed);
        manager
            .begin("GET /nowhere", &HeaderMap::new())
            .end(Some(StatusCode::NOT_FOUND), Outcome::NotFound);

        let spans = sink.0.lock().unwrap();
        assert!(spans[0].error);
        assert_eq!(spans[0].tag(ERROR_TYPE), Some(&TagValue::from("502")));
        assert!(!spans[1].error);
        assert_eq!(spans[1].tag(OUTCOME_TAG), Some(&TagValue::from("not_found")));
        assert_eq!(spans[1].tag(HTTP_RESPONSE_STATUS_CODE), Some(&TagValue::I64(404)));
    }

    #[test]
    fn test_dropped_span_closes_as_cancelled() {
        let (manager, sink) = manager();
        let span = manager.begin("GET /slow", &HeaderMap::new());
        let span_id = span.span_id();
        drop(span);

        let spans = sink.0.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_id, span_id);
        assert_eq!(spans[0].outcome, Outcome::Cancelled);
        assert!(spans[0].error);
    }
}
