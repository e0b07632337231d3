//! The edge pipeline: an ordered chain of request-scoped stages.
//!
//! Stages follow the shape of axum middleware: each receives the request plus a
//! [`Next`] handle and decides whether to call further down the chain or answer on
//! its own. The chain is fixed at startup by [`EdgePipelineBuilder`] in the order
//! admission, tracing, routing, and wrapped by the summary recorder.
use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{body::Body, response::IntoResponse};
use http::{Request, Response, header};
use opentelemetry_semantic_conventions::attribute::{
    CLIENT_ADDRESS, ERROR_TYPE, HTTP_REQUEST_METHOD, HTTP_ROUTE, URL_PATH, USER_AGENT_ORIGINAL,
};

use crate::{
    adapters::{forwarder::Forwarder, window_store::InMemoryWindowStore},
    config::{AdmissionConfig, MissingKeyPolicy, PartitionBy, ServerConfig},
    core::{
        clock::SystemTimeSource,
        context::{Outcome, RequestContext},
        error::EdgeError,
        rate_limiter::{Admission, RateLimiter},
        route_table::RouteTable,
        summary::{Recorded, SummaryRecorder},
        trace::TraceContextManager,
    },
    metrics,
    ports::{http_client::HttpClient, span_exporter::SpanSink, summary_sink::SummarySink},
};

const ENDUSER_ID: &str = "enduser.id";
const REQUEST_BODY_SIZE: &str = "http.request.body.size";
const RESPONSE_BODY_SIZE: &str = "http.response.body.size";

/// Something that turns a request into a response.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut RequestContext, req: Request<Body>) -> Response<Body>;
}

/// Position of a stage in the chain. The builder sorts stages by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StagePosition {
    Admission,
    Tracing,
    Routing,
}

#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn position(&self) -> StagePosition;

    async fn call(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Response<Body>;
}

/// The remainder of the chain after the current stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut RequestContext, req: Request<Body>) -> Response<Body> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.call(ctx, req, Next { stages: rest }).await,
            None => {
                // Nothing answered: behave like an empty route table.
                ctx.outcome = Outcome::NotFound;
                EdgeError::RouteNotFound {
                    method: ctx.method.to_string(),
                    path: ctx.path.clone(),
                }
                .into_response()
            }
        }
    }
}

/// Stages in execution order.
pub struct StageChain {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageChain {
    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl RequestHandler for StageChain {
    async fn handle(&self, ctx: &mut RequestContext, req: Request<Body>) -> Response<Body> {
        Next {
            stages: &self.stages,
        }
        .run(ctx, req)
        .await
    }
}

/// Rate limits requests by partition key before anything else runs.
///
/// Rejected requests never reach the tracing stage and therefore carry no span.
pub struct AdmissionStage {
    limiter: Arc<RateLimiter>,
    config: AdmissionConfig,
}

impl AdmissionStage {
    pub fn new(limiter: Arc<RateLimiter>, config: AdmissionConfig) -> Result<Self, EdgeError> {
        if !limiter.has_policy(&config.policy) {
            return Err(EdgeError::ConfigInvalid(format!(
                "admission references unknown rate limit policy '{}'",
                config.policy
            )));
        }
        if config.by == PartitionBy::Header && config.header_name.is_none() {
            return Err(EdgeError::ConfigInvalid(
                "admission.header_name is required when partitioning by header".to_string(),
            ));
        }
        Ok(Self { limiter, config })
    }

    /// Derive the partition key, `None` when the request does not carry one.
    pub fn partition_key(&self, ctx: &RequestContext) -> Option<String> {
        match self.config.by {
            PartitionBy::Ip => {
                let forwarded = if self.config.trust_forwarded_for {
                    ctx.forwarded_for()
                } else {
                    None
                };
                forwarded.or_else(|| ctx.client_ip()).map(|ip| ip.to_string())
            }
            PartitionBy::Header => self
                .config
                .header_name
                .as_deref()
                .and_then(|name| ctx.headers.get(name))
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            PartitionBy::Global => Some("global".to_string()),
        }
    }
}

#[async_trait]
impl Stage for AdmissionStage {
    fn name(&self) -> &'static str {
        "admission"
    }

    fn position(&self) -> StagePosition {
        StagePosition::Admission
    }

    async fn call(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Response<Body> {
        let Some(key) = self.partition_key(ctx) else {
            return match self.config.on_missing_key {
                MissingKeyPolicy::Allow => {
                    tracing::debug!(by = ?self.config.by, "no partition key, skipping admission");
                    next.run(ctx, req).await
                }
                MissingKeyPolicy::Deny => {
                    ctx.outcome = Outcome::BadRequest;
                    EdgeError::BadRequest("request carries no partition key".to_string())
                        .into_response()
                }
            };
        };

        let admission = self.limiter.admit(&self.config.policy, &key).await;
        ctx.partition_key = Some(key);

        match admission {
            Admission::Allowed { .. } => next.run(ctx, req).await,
            Admission::Rejected {
                retry_after,
                status,
                message,
            } => {
                metrics::increment_admission_rejection(&self.config.policy);
                tracing::debug!(
                    policy = %self.config.policy,
                    partition_key = ctx.partition_key.as_deref().unwrap_or_default(),
                    ?retry_after,
                    "request rejected by rate limiter"
                );
                ctx.outcome = Outcome::Rejected;
                EdgeError::AdmissionRejected {
                    status,
                    message,
                    retry_after,
                }
                .into_response()
            }
        }
    }
}

/// Opens the server span, hands it down the chain and closes it with the response.
pub struct TracingStage {
    tracer: Arc<TraceContextManager>,
}

impl TracingStage {
    pub fn new(tracer: Arc<TraceContextManager>) -> Self {
        Self { tracer }
    }
}

#[async_trait]
impl Stage for TracingStage {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn position(&self) -> StagePosition {
        StagePosition::Tracing
    }

    async fn call(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Response<Body> {
        let mut span = self.tracer.begin(ctx.method.to_string(), &ctx.headers);
        span.set_tag(HTTP_REQUEST_METHOD, ctx.method.as_str());
        span.set_tag(URL_PATH, ctx.path.clone());
        span.set_tag(ENDUSER_ID, "anonymous");
        if let Some(ip) = ctx.client_ip() {
            span.set_tag(CLIENT_ADDRESS, ip.to_string());
        }
        if let Some(agent) = ctx.user_agent() {
            span.set_tag(USER_AGENT_ORIGINAL, agent.to_string());
        }
        if let Some(size) = ctx.request_size() {
            span.set_tag(REQUEST_BODY_SIZE, size);
        }
        ctx.trace_id = Some(span.trace_id());
        ctx.span = Some(span);

        let response = next.run(ctx, req).await;

        if let Some(mut span) = ctx.span.take() {
            if let Some(route) = &ctx.route_id {
                span.set_tag(HTTP_ROUTE, route.clone());
                span.update_name(format!("{} {}", ctx.method, route));
            }
            let size = ctx.response_size.or_else(|| {
                response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
            });
            if let Some(size) = size {
                self.tracer.enrich(&mut span, RESPONSE_BODY_SIZE, size);
            }
            self.tracer.end(span, Some(response.status()), ctx.outcome);
        }
        response
    }
}

/// Resolves the route and forwards to its cluster. Always terminal.
pub struct RoutingStage {
    table: Arc<RouteTable>,
    forwarder: Arc<Forwarder>,
}

impl RoutingStage {
    pub fn new(table: Arc<RouteTable>, forwarder: Arc<Forwarder>) -> Self {
        Self { table, forwarder }
    }
}

#[async_trait]
impl Stage for RoutingStage {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn position(&self) -> StagePosition {
        StagePosition::Routing
    }

    async fn call(
        &self,
        ctx: &mut RequestContext,
        req: Request<Body>,
        _next: Next<'_>,
    ) -> Response<Body> {
        let Some(route) = self.table.resolve(&ctx.method, &ctx.path, ctx.host.as_deref()) else {
            tracing::debug!(method = %ctx.method, path = %ctx.path, "no route matched");
            ctx.outcome = Outcome::NotFound;
            return EdgeError::RouteNotFound {
                method: ctx.method.to_string(),
                path: ctx.path.clone(),
            }
            .into_response();
        };
        ctx.route_id = Some(route.id.clone());

        match self.forwarder.forward(&route, ctx, req).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    route = %route.id,
                    request_id = %ctx.request_id,
                    error = %error,
                    "forwarding failed"
                );
                ctx.outcome = error.outcome();
                if let Some(span) = ctx.span.as_mut() {
                    span.set_tag(ERROR_TYPE, error.kind());
                }
                error.into_response()
            }
        }
    }
}

/// Assembles stages into a [`StageChain`] in their fixed order.
#[derive(Default)]
pub struct EdgePipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    summary_sink: Option<Arc<dyn SummarySink>>,
}

impl EdgePipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: impl Stage) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn summary_sink(mut self, sink: Arc<dyn SummarySink>) -> Self {
        self.summary_sink = Some(sink);
        self
    }

    pub fn build(mut self) -> Result<EdgePipeline, EdgeError> {
        self.stages.sort_by_key(|s| s.position());
        if let Some(pair) = self
            .stages
            .windows(2)
            .find(|pair| pair[0].position() == pair[1].position())
        {
            return Err(EdgeError::ConfigInvalid(format!(
                "stage '{}' registered more than once",
                pair[1].name()
            )));
        }
        let sink = self.summary_sink.ok_or_else(|| {
            EdgeError::ConfigInvalid("pipeline needs a summary sink".to_string())
        })?;

        let chain = StageChain {
            stages: self.stages,
        };
        tracing::debug!(stages = ?chain.names(), "edge pipeline assembled");
        Ok(EdgePipeline {
            recorded: SummaryRecorder::new(sink).wrap(chain),
        })
    }
}

/// Collaborators the pipeline needs from outside the configuration.
pub struct PipelineDeps {
    pub client: Arc<dyn HttpClient>,
    pub spans: Arc<dyn SpanSink>,
    pub summaries: Arc<dyn SummarySink>,
}

pub struct EdgePipeline {
    recorded: Recorded<StageChain>,
}

impl EdgePipeline {
    pub fn builder() -> EdgePipelineBuilder {
        EdgePipelineBuilder::new()
    }

    /// Build the full pipeline described by `config`.
    ///
    /// Fails with [`EdgeError::ConfigInvalid`] on any route table or limiter problem,
    /// so an invalid configuration never serves traffic.
    pub fn from_config(config: &ServerConfig, deps: PipelineDeps) -> Result<Self, EdgeError> {
        let table = RouteTable::from_config(&config.routes, &config.clusters).map_err(|errors| {
            EdgeError::ConfigInvalid(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        tracing::info!(routes = table.len(), clusters = table.cluster_ids().len(), "route table loaded");

        let tracer = Arc::new(TraceContextManager::new(deps.spans));
        let forwarder = Arc::new(Forwarder::new(deps.client, tracer.clone()));

        let mut builder = Self::builder()
            .summary_sink(deps.summaries)
            .stage(TracingStage::new(tracer))
            .stage(RoutingStage::new(Arc::new(table), forwarder));

        if let Some(admission) = &config.admission {
            let limiter = RateLimiter::from_config(
                &config.rate_limiter,
                Arc::new(InMemoryWindowStore::new(config.rate_limiter.max_tracked_keys)),
                Arc::new(SystemTimeSource),
            )?;
            builder = builder.stage(AdmissionStage::new(Arc::new(limiter), admission.clone())?);
        }

        builder.build()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.recorded.inner().names()
    }

    /// Run one request through the chain.
    pub async fn handle(&self, req: Request<Body>, peer_addr: Option<SocketAddr>) -> Response<Body> {
        let ctx = RequestContext::from_request(&req, peer_addr);
        self.recorded.handle(ctx, req).await
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, Method, StatusCode};

    use super::*;
    use crate::{
        adapters::{exporters::InMemorySpanExporter, summary_sink::CollectingSummarySink},
        config::{ClusterConfig, RateLimitPolicyConfig, RouteConfig, RouteMatchConfig},
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    struct Echo;

    #[async_trait]
    impl HttpClient for Echo {
        async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            let traceparent = req
                .headers()
                .get("traceparent")
                .cloned()
                .unwrap_or(HeaderValue::from_static(""));
            let mut response = Response::new(Body::from("ok"));
            response.headers_mut().insert("x-seen-traceparent", traceparent);
            Ok(response)
        }
    }

    struct Refuse;

    #[async_trait]
    impl HttpClient for Refuse {
        async fn send_request(&self, _req: Request<Body>) -> HttpClientResult<Response<Body>> {
            Err(HttpClientError::ConnectionError("refused".to_string()))
        }
    }

    fn config(admission: Option<AdmissionConfig>) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.routes.insert(
            "catalog-route".to_string(),
            RouteConfig::new(
                "catalog",
                RouteMatchConfig {
                    prefix: Some("/catalog-service".to_string()),
                    ..Default::default()
                },
            ),
        );
        config.clusters.insert(
            "catalog".to_string(),
            ClusterConfig {
                destinations: vec!["http://catalog:8080".to_string()],
                load_balancing: Default::default(),
            },
        );
        config.admission = admission;
        config
    }

    struct Harness {
        pipeline: EdgePipeline,
        spans: Arc<InMemorySpanExporter>,
        summaries: Arc<CollectingSummarySink>,
    }

    fn harness(config: &ServerConfig, client: Arc<dyn HttpClient>) -> Harness {
        let spans = Arc::new(InMemorySpanExporter::new());
        let summaries = Arc::new(CollectingSummarySink::new());
        let pipeline = EdgePipeline::from_config(
            config,
            PipelineDeps {
                client,
                spans: spans.clone(),
                summaries: summaries.clone(),
            },
        )
        .unwrap();
        Harness {
            pipeline,
            spans,
            summaries,
        }
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    fn peer() -> Option<SocketAddr> {
        Some("198.51.100.4:40000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_stage_order_is_fixed() {
        let h = harness(&config(Some(AdmissionConfig::default())), Arc::new(Echo));
        assert_eq!(h.pipeline.stage_names(), vec!["admission", "tracing", "routing"]);

        let h = harness(&config(None), Arc::new(Echo));
        assert_eq!(h.pipeline.stage_names(), vec!["tracing", "routing"]);
    }

    #[tokio::test]
    async fn test_forwarded_request_is_traced_and_recorded() {
        let h = harness(&config(None), Arc::new(Echo));
        let response = h.pipeline.handle(get("/catalog-service/items"), peer()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let records = h.summaries.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].route, "catalog-route");
        let trace_id = records[0].trace_id.clone().unwrap();
        let seen = response.headers()["x-seen-traceparent"].to_str().unwrap();
        assert_eq!(seen.split('-').nth(1), Some(trace_id.as_str()));

        let spans = h.spans.spans();
        assert_eq!(spans.len(), 2);
        let server = spans.iter().find(|s| s.parent_span_id.is_none()).unwrap();
        assert_eq!(server.name, "GET catalog-route");
        assert!(!server.error);
    }

    #[tokio::test]
    async fn test_host_constrained_route_matches_normalized_host() {
        let mut config = config(None);
        config.routes.insert(
            "admin-route".to_string(),
            RouteConfig::new(
                "catalog",
                RouteMatchConfig {
                    prefix: Some("/admin".to_string()),
                    hosts: vec!["admin.example.com".to_string()],
                    ..Default::default()
                },
            ),
        );
        let h = harness(&config, Arc::new(Echo));

        let req = Request::builder()
            .uri("/admin/users")
            .header(header::HOST, "Admin.Example.com:8443")
            .body(Body::empty())
            .unwrap();
        assert_eq!(h.pipeline.handle(req, peer()).await.status(), StatusCode::OK);

        let req = Request::builder()
            .uri("/admin/users")
            .header(header::HOST, "shop.example.com")
            .body(Body::empty())
            .unwrap();
        assert_eq!(h.pipeline.handle(req, peer()).await.status(), StatusCode::NOT_FOUND);

        let routes: Vec<_> = h.summaries.records().into_iter().map(|r| r.route).collect();
        assert_eq!(routes, vec!["admin-route", "/admin/users"]);
    }

    #[tokio::test]
    async fn test_not_found_closes_span_without_error() {
        let h = harness(&config(None), Arc::new(Echo));
        let response = h.pipeline.handle(get("/nowhere"), peer()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let spans = h.spans.spans();
        assert_eq!(spans.len(), 1);
        assert!(!spans[0].error);
        assert_eq!(spans[0].outcome, Outcome::NotFound);

        let records = h.summaries.records();
        assert_eq!(records[0].status, 404);
        assert_eq!(records[0].route, "/nowhere");
    }

    #[tokio::test]
    async fn test_rejection_is_recorded_but_not_traced() {
        let mut config = config(Some(AdmissionConfig::default()));
        config
            .rate_limiter
            .policies
            .insert("fixed".to_string(), RateLimitPolicyConfig::fixed(60, 1));
        let h = harness(&config, Arc::new(Echo));

        let first = h.pipeline.handle(get("/catalog-service/items"), peer()).await;
        let second = h.pipeline.handle(get("/catalog-service/items"), peer()).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));

        let records = h.summaries.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, 429);
        assert_eq!(records[1].outcome, Outcome::Rejected);
        assert!(records[1].trace_id.is_none());
        // Server and client span of the first request only.
        assert_eq!(h.spans.spans().len(), 2);
    }

    #[tokio::test]
    async fn test_forward_failure_marks_span_errored() {
        let h = harness(&config(None), Arc::new(Refuse));
        let response = h.pipeline.handle(get("/catalog-service/items"), peer()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let spans = h.spans.spans();
        let server = spans.iter().find(|s| s.parent_span_id.is_none()).unwrap();
        assert!(server.error);
        assert_eq!(server.outcome, Outcome::ForwardFailed);

        let records = h.summaries.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 502);
    }

    #[test]
    fn test_partition_keys() {
        let limiter = Arc::new(
            RateLimiter::from_config(
                &Default::default(),
                Arc::new(InMemoryWindowStore::new(16)),
                Arc::new(SystemTimeSource),
            )
            .unwrap(),
        );
        let req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
            .header("x-api-key", "k-1")
            .body(())
            .unwrap();
        let ctx = RequestContext::from_request(&req, peer());

        let by_ip = AdmissionStage::new(limiter.clone(), AdmissionConfig::default()).unwrap();
        assert_eq!(by_ip.partition_key(&ctx).as_deref(), Some("198.51.100.4"));

        let trusted = AdmissionConfig {
            trust_forwarded_for: true,
            ..Default::default()
        };
        let trusted = AdmissionStage::new(limiter.clone(), trusted).unwrap();
        assert_eq!(trusted.partition_key(&ctx).as_deref(), Some("203.0.113.5"));

        let header = AdmissionConfig {
            by: PartitionBy::Header,
            header_name: Some("x-api-key".to_string()),
            ..Default::default()
        };
        let header = AdmissionStage::new(limiter.clone(), header).unwrap();
        assert_eq!(header.partition_key(&ctx).as_deref(), Some("k-1"));

        let unknown = AdmissionConfig {
            policy: "missing".to_string(),
            ..Default::default()
        };
        assert!(AdmissionStage::new(limiter, unknown).is_err());
    }

    #[test]
    fn test_builder_rejects_duplicate_stage() {
        let tracer = Arc::new(TraceContextManager::new(Arc::new(InMemorySpanExporter::new())));
        let result = EdgePipeline::builder()
            .summary_sink(Arc::new(CollectingSummarySink::new()))
            .stage(TracingStage::new(tracer.clone()))
            .stage(TracingStage::new(tracer))
            .build();
        assert!(matches!(result, Err(EdgeError::ConfigInvalid(_))));
    }

    #[test]
    fn test_dangling_cluster_is_config_invalid() {
        let mut config = config(None);
        config.clusters.clear();
        let result = EdgePipeline::from_config(
            &config,
            PipelineDeps {
                client: Arc::new(Echo),
                spans: Arc::new(InMemorySpanExporter::new()),
                summaries: Arc::new(CollectingSummarySink::new()),
            },
        );
        assert!(matches!(result, Err(EdgeError::ConfigInvalid(_))));
    }
}
