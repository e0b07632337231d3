//! One summary record per request.
//!
//! [`SummaryRecorder::wrap`] decorates a [`RequestHandler`] without changing its
//! behaviour. The request context is moved into a scope guard for the duration of
//! the call. Whatever happens next (a normal response, the caller disconnecting and
//! the future being dropped, or a panic in a stage) the guard emits exactly one
//! record. On the abnormal paths it first closes a still-open server span with the
//! same outcome.
//!
//! Elapsed time is measured until the response head is produced; streaming the body
//! afterwards is not included.
use std::{panic::AssertUnwindSafe, sync::Arc};

use axum::body::Body;
use futures_util::FutureExt;
use http::{Request, Response, StatusCode, header};
use serde::Serialize;

use crate::{
    core::{
        context::{Outcome, RequestContext},
        pipeline::RequestHandler,
    },
    metrics::{self, ActiveRequestGuard},
    ports::summary_sink::SummarySink,
};

/// Status recorded when the client went away before a response existed.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRecord {
    pub method: String,
    /// Route id when resolved, the raw path otherwise
    pub route: String,
    pub status: u16,
    pub elapsed_ms: u64,
    #[serde(serialize_with = "serialize_outcome")]
    pub outcome: Outcome,
    pub trace_id: Option<String>,
    pub request_id: String,
    pub client: Option<String>,
}

fn serialize_outcome<S: serde::Serializer>(outcome: &Outcome, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(outcome.as_str())
}

impl SummaryRecord {
    fn from_context(ctx: &RequestContext, status: u16) -> Self {
        Self {
            method: ctx.method.to_string(),
            route: ctx.route_label().to_string(),
            status,
            elapsed_ms: u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX),
            outcome: ctx.outcome,
            trace_id: ctx.trace_id.map(|id| id.to_string()),
            request_id: ctx.request_id.to_string(),
            client: ctx.client_ip().map(|ip| ip.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct SummaryRecorder {
    sink: Arc<dyn SummarySink>,
}

impl SummaryRecorder {
    pub fn new(sink: Arc<dyn SummarySink>) -> Self {
        Self { sink }
    }

    pub fn wrap<H: RequestHandler>(&self, handler: H) -> Recorded<H> {
        Recorded {
            inner: handler,
            sink: self.sink.clone(),
        }
    }
}

/// A handler whose every invocation produces exactly one summary record.
pub struct Recorded<H> {
    inner: H,
    sink: Arc<dyn SummarySink>,
}

impl<H: RequestHandler> Recorded<H> {
    pub fn inner(&self) -> &H {
        &self.inner
    }

    pub async fn handle(&self, ctx: RequestContext, req: Request<Body>) -> Response<Body> {
        let mut scope = SummaryScope::new(ctx, self.sink.clone());

        let result = AssertUnwindSafe(self.inner.handle(&mut scope.ctx, req))
            .catch_unwind()
            .await;

        match result {
            Ok(response) => {
                scope.finish(&response);
                response
            }
            Err(panic) => {
                scope.abandon(StatusCode::INTERNAL_SERVER_ERROR, Outcome::Fault);
                drop(scope);
                std::panic::resume_unwind(panic)
            }
        }
    }
}

struct SummaryScope {
    ctx: RequestContext,
    sink: Arc<dyn SummarySink>,
    emitted: bool,
    _active: ActiveRequestGuard,
}

impl SummaryScope {
    fn new(ctx: RequestContext, sink: Arc<dyn SummarySink>) -> Self {
        Self {
            ctx,
            sink,
            emitted: false,
            _active: ActiveRequestGuard::new(),
        }
    }

    fn finish(&mut self, response: &Response<Body>) {
        let status = response.status();
        self.ctx.status = Some(status);
        if self.ctx.response_size.is_none() {
            self.ctx.response_size = response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
        }
        if let Some(span) = self.ctx.span.take() {
            span.end(Some(status), self.ctx.outcome);
        }
        self.emit(status.as_u16());
    }

    /// Close out a request that never produced a response.
    fn abandon(&mut self, status: StatusCode, outcome: Outcome) {
        self.ctx.outcome = outcome;
        self.ctx.status = Some(status);
        if let Some(span) = self.ctx.span.take() {
            span.end(Some(status), outcome);
        }
        self.emit(status.as_u16());
    }

    fn emit(&mut self, status: u16) {
        if self.emitted {
            return;
        }
        self.emitted = true;

        let record = SummaryRecord::from_context(&self.ctx, status);
        metrics::increment_request_total(&record.route, &record.method, status, record.outcome.as_str());
        metrics::record_request_duration(&record.route, &record.method, self.ctx.elapsed());
        self.sink.record(record);
    }
}

impl Drop for SummaryScope {
    fn drop(&mut self) {
        if self.emitted {
            return;
        }
        if std::thread::panicking() {
            self.abandon(StatusCode::INTERNAL_SERVER_ERROR, Outcome::Fault);
        } else {
            let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::REQUEST_TIMEOUT);
            self.abandon(status, Outcome::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use http::HeaderMap;

    use super::*;
    use crate::{
        adapters::{exporters::InMemorySpanExporter, summary_sink::CollectingSummarySink},
        core::trace::TraceContextManager,
    };

    struct Fixed(StatusCode);

    #[async_trait]
    impl RequestHandler for Fixed {
        async fn handle(&self, ctx: &mut RequestContext, _req: Request<Body>) -> Response<Body> {
            ctx.route_id = Some("catalog-route".to_string());
            let mut response = Response::new(Body::from("ok"));
            *response.status_mut() = self.0;
            response
        }
    }

    struct Hang(Arc<TraceContextManager>);

    #[async_trait]
    impl RequestHandler for Hang {
        async fn handle(&self, ctx: &mut RequestContext, _req: Request<Body>) -> Response<Body> {
            let span = self.0.begin("GET /slow", &HeaderMap::new());
            ctx.trace_id = Some(span.trace_id());
            ctx.span = Some(span);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Response::new(Body::empty())
        }
    }

    struct Explode;

    #[async_trait]
    impl RequestHandler for Explode {
        async fn handle(&self, _ctx: &mut RequestContext, _req: Request<Body>) -> Response<Body> {
            panic!("stage failure");
        }
    }

    fn request() -> (RequestContext, Request<Body>) {
        let req = Request::builder()
            .uri("/catalog-service/items")
            .body(Body::empty())
            .unwrap();
        let ctx = RequestContext::from_request(&req, Some("192.0.2.1:4000".parse().unwrap()));
        (ctx, req)
    }

    #[tokio::test]
    async fn test_records_once_without_altering_response() {
        let sink = Arc::new(CollectingSummarySink::new());
        let recorded = SummaryRecorder::new(sink.clone()).wrap(Fixed(StatusCode::CREATED));

        let (ctx, req) = request();
        let response = recorded.handle(ctx, req).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 201);
        assert_eq!(records[0].route, "catalog-route");
        assert_eq!(records[0].client.as_deref(), Some("192.0.2.1"));
        assert_eq!(records[0].outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_request_closes_span_and_records_499() {
        let spans = Arc::new(InMemorySpanExporter::new());
        let manager = Arc::new(TraceContextManager::new(spans.clone()));
        let sink = Arc::new(CollectingSummarySink::new());
        let recorded = SummaryRecorder::new(sink.clone()).wrap(Hang(manager));

        let (ctx, req) = request();
        let result =
            tokio::time::timeout(Duration::from_millis(20), recorded.handle(ctx, req)).await;
        assert!(result.is_err());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CLIENT_CLOSED_REQUEST);
        assert_eq!(records[0].outcome, Outcome::Cancelled);

        let finished = spans.spans();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].outcome, Outcome::Cancelled);
        assert_eq!(
            records[0].trace_id.as_deref(),
            Some(finished[0].trace_id.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_panic_records_fault_and_propagates() {
        let sink = Arc::new(CollectingSummarySink::new());
        let recorded = Arc::new(SummaryRecorder::new(sink.clone()).wrap(Explode));

        let (ctx, req) = request();
        let task = tokio::spawn({
            let recorded = recorded.clone();
            async move { recorded.handle(ctx, req).await }
        });
        assert!(task.await.unwrap_err().is_panic());

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 500);
        assert_eq!(records[0].outcome, Outcome::Fault);
    }
}
