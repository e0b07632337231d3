use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use http::{HeaderMap, Method, Request, StatusCode, header};
use opentelemetry::trace::TraceId;
use uuid::Uuid;

use crate::core::{route_table::request_host, trace::ActiveSpan};

/// How a request left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Completed,
    Rejected,
    NotFound,
    ForwardFailed,
    BadRequest,
    /// The caller went away before a response was produced
    Cancelled,
    /// A stage panicked
    Fault,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Rejected => "rejected",
            Outcome::NotFound => "not_found",
            Outcome::ForwardFailed => "forward_failed",
            Outcome::BadRequest => "bad_request",
            Outcome::Cancelled => "cancelled",
            Outcome::Fault => "fault",
        }
    }

    /// Outcomes that mark a span as errored regardless of status.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::ForwardFailed | Outcome::Cancelled | Outcome::Fault
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request extension marking a request that arrived over a TLS listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsConnection;

/// Per-request state threaded through the stages.
///
/// Created at pipeline entry and owned by exactly one invocation. Stages read the
/// request facts and fill in what they learn (partition key, span, route, status).
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// `Host` header, lowercase and without port; what host-constrained routes match on
    pub host: Option<String>,
    pub headers: HeaderMap,
    /// Socket peer address, when the server exposes it
    pub peer_addr: Option<SocketAddr>,
    /// Whether the request arrived over TLS
    pub secure: bool,
    pub started: Instant,
    pub partition_key: Option<String>,
    pub trace_id: Option<TraceId>,
    /// The open server span; taken by the stage that ends it
    pub span: Option<ActiveSpan>,
    pub route_id: Option<String>,
    pub status: Option<StatusCode>,
    pub response_size: Option<u64>,
    pub outcome: Outcome,
}

impl RequestContext {
    pub fn from_request<B>(req: &Request<B>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            host: request_host(req.headers()),
            headers: req.headers().clone(),
            peer_addr,
            secure: req.extensions().get::<TlsConnection>().is_some()
                || req.uri().scheme() == Some(&http::uri::Scheme::HTTPS),
            started: Instant::now(),
            partition_key: None,
            trace_id: None,
            span: None,
            route_id: None,
            status: None,
            response_size: None,
            outcome: Outcome::Completed,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Route id when resolved, the raw path otherwise.
    pub fn route_label(&self) -> &str {
        self.route_id.as_deref().unwrap_or(&self.path)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }

    /// First `X-Forwarded-For` hop, when it parses as an IP address.
    pub fn forwarded_for(&self) -> Option<IpAddr> {
        self.headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|hop| hop.trim().parse().ok())
    }

    /// Client address as reported in summaries and spans.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.peer_addr.map(|addr| addr.ip())
    }

    /// Request body size from `Content-Length`, when declared.
    pub fn request_size(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}
