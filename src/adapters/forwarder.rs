//! Reverse-proxy forwarding of a request to its route's cluster.
use std::sync::Arc;

use axum::body::{Body, HttpBody as _};
use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, Request, Response, header, request::Parts,
};
use opentelemetry_semantic_conventions::attribute::{
    ERROR_TYPE, HTTP_REQUEST_METHOD, SERVER_ADDRESS, SERVER_PORT, URL_FULL,
};

use crate::{
    core::{
        context::{Outcome, RequestContext},
        destination::Destination,
        error::EdgeError,
        route_table::RouteEntry,
        trace::TraceContextManager,
    },
    metrics::{self, UpstreamTimer},
    ports::http_client::{HttpClient, HttpClientError},
};

/// Largest request body buffered so that it can be replayed on retry.
pub const MAX_REPLAYABLE_BODY: u64 = 64 * 1024;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}

enum Payload {
    Replayable(Bytes),
    Streaming(Option<Body>),
}

impl Payload {
    fn next(&mut self) -> Body {
        match self {
            Payload::Replayable(bytes) => Body::from(bytes.clone()),
            Payload::Streaming(body) => body.take().unwrap_or_else(Body::empty),
        }
    }
}

enum AttemptError {
    Timeout,
    Unreachable(String),
}

/// Sends requests to upstream destinations with per-attempt client spans.
pub struct Forwarder {
    client: Arc<dyn HttpClient>,
    tracer: Arc<TraceContextManager>,
}

impl Forwarder {
    pub fn new(client: Arc<dyn HttpClient>, tracer: Arc<TraceContextManager>) -> Self {
        Self { client, tracer }
    }

    /// Forward `req` along `route`.
    ///
    /// Timeouts and connection failures are retried up to the route's retry count,
    /// each attempt on the next destination, but only for idempotent methods (unless
    /// the route allows otherwise) and bodies small enough to replay.
    pub async fn forward(
        &self,
        route: &RouteEntry,
        ctx: &mut RequestContext,
        req: Request<Body>,
    ) -> Result<Response<Body>, EdgeError> {
        let (parts, body) = req.into_parts();

        let retry_allowed = route.policy.retries > 0
            && (is_idempotent(&parts.method) || route.policy.retry_non_idempotent);
        let replayable_size = body
            .size_hint()
            .exact()
            .filter(|size| *size <= MAX_REPLAYABLE_BODY);

        let (mut payload, max_attempts) = match (retry_allowed, replayable_size) {
            (true, Some(size)) => {
                let bytes = axum::body::to_bytes(body, size as usize)
                    .await
                    .map_err(|e| EdgeError::BadRequest(format!("unreadable request body: {e}")))?;
                (Payload::Replayable(bytes), route.policy.retries.saturating_add(1))
            }
            _ => (Payload::Streaming(Some(body)), 1),
        };

        let path = route.transforms.rewrite_path(&ctx.path);
        let mut last_error = AttemptError::Unreachable("no destination available".to_string());

        for attempt in 1..=max_attempts {
            let Some(destination) = route.cluster.pick() else {
                break;
            };
            if attempt > 1 {
                metrics::increment_upstream_retry(&route.id);
            }

            let mut outbound =
                self.build_request(route, ctx, &parts, destination, &path, payload.next())?;
            let mut span = ctx.span.as_ref().map(|parent| {
                self.tracer
                    .start_client(parent, format!("{} {}", parts.method, route.cluster.id()))
            });
            if let Some(span) = span.as_mut() {
                span.set_tag(HTTP_REQUEST_METHOD, parts.method.as_str());
                span.set_tag(SERVER_ADDRESS, destination.host());
                if let Some(port) = destination.authority().port_u16() {
                    span.set_tag(SERVER_PORT, i64::from(port));
                }
                span.set_tag(URL_FULL, outbound.uri().to_string());
                span.set_tag("edge.attempt", i64::from(attempt));
                self.tracer.inject(span, outbound.headers_mut());
            }

            let timer = UpstreamTimer::new(route.cluster.id());
            let result =
                tokio::time::timeout(route.policy.timeout, self.client.send_request(outbound)).await;
            drop(timer);

            match result {
                Ok(Ok(mut response)) => {
                    metrics::increment_upstream_request(route.cluster.id(), "ok");
                    if let Some(span) = span {
                        span.end(Some(response.status()), Outcome::Completed);
                    }
                    tracing::debug!(
                        route = %route.id,
                        destination = %destination,
                        attempt,
                        status = response.status().as_u16(),
                        "upstream responded"
                    );
                    strip_hop_by_hop(response.headers_mut());
                    route.transforms.response_headers.apply(response.headers_mut());
                    ctx.response_size = response.body().size_hint().exact();
                    return Ok(response);
                }
                Ok(Err(HttpClientError::InvalidRequest(reason))) => {
                    metrics::increment_upstream_request(route.cluster.id(), "invalid");
                    if let Some(mut span) = span {
                        span.set_tag(ERROR_TYPE, "invalid_request");
                        span.end(None, Outcome::ForwardFailed);
                    }
                    return Err(EdgeError::ForwardUnreachable {
                        route: route.id.clone(),
                        attempts: attempt,
                        reason,
                    });
                }
                Ok(Err(e)) => {
                    metrics::increment_upstream_request(route.cluster.id(), "unreachable");
                    if let Some(mut span) = span {
                        span.set_tag(ERROR_TYPE, "connection_error");
                        span.end(None, Outcome::ForwardFailed);
                    }
                    tracing::warn!(
                        route = %route.id,
                        destination = %destination,
                        attempt,
                        max_attempts,
                        error = %e,
                        "upstream unreachable"
                    );
                    last_error = AttemptError::Unreachable(e.to_string());
                }
                Err(_) => {
                    metrics::increment_upstream_request(route.cluster.id(), "timeout");
                    if let Some(mut span) = span {
                        span.set_tag(ERROR_TYPE, "timeout");
                        span.end(None, Outcome::ForwardFailed);
                    }
                    tracing::warn!(
                        route = %route.id,
                        destination = %destination,
                        attempt,
                        max_attempts,
                        timeout = ?route.policy.timeout,
                        "upstream timed out"
                    );
                    last_error = AttemptError::Timeout;
                }
            }
        }

        Err(match last_error {
            AttemptError::Timeout => EdgeError::ForwardTimeout {
                route: route.id.clone(),
                timeout: route.policy.timeout,
                attempts: max_attempts,
            },
            AttemptError::Unreachable(reason) => EdgeError::ForwardUnreachable {
                route: route.id.clone(),
                attempts: max_attempts,
                reason,
            },
        })
    }

    fn build_request(
        &self,
        route: &RouteEntry,
        ctx: &RequestContext,
        parts: &Parts,
        destination: &Destination,
        path: &str,
        body: Body,
    ) -> Result<Request<Body>, EdgeError> {
        let uri = destination
            .uri_for(path, ctx.query.as_deref())
            .map_err(|e| EdgeError::BadRequest(format!("cannot build upstream URI: {e}")))?;

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove("traceparent");
        headers.remove("tracestate");
        route.transforms.request_headers.apply(&mut headers);

        if route.transforms.forwarded_headers {
            if let Some(ip) = ctx.client_ip() {
                let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                    Some(existing) => format!("{existing}, {ip}"),
                    None => ip.to_string(),
                };
                if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                    headers.insert(X_FORWARDED_FOR, value);
                }
            }
            let proto = if ctx.secure { "https" } else { "http" };
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
            if let Some(host) = parts.headers.get(header::HOST) {
                headers.insert(X_FORWARDED_HOST, host.clone());
            }
        }

        let host = HeaderValue::from_str(destination.authority().as_str())
            .map_err(|e| EdgeError::BadRequest(format!("invalid upstream host: {e}")))?;
        headers.insert(header::HOST, host);

        let mut request = Request::new(body);
        *request.method_mut() = parts.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = headers;
        Ok(request)
    }
}
