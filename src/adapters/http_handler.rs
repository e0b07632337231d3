use std::{any::Any, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use tower_http::catch_panic::CatchPanicLayer;

use crate::core::{context::TlsConnection, pipeline::EdgePipeline};

/// Inbound HTTP adapter: every request, whatever its path, goes through the pipeline.
pub struct HttpHandler {
    pipeline: Arc<EdgePipeline>,
    tls: bool,
}

impl HttpHandler {
    pub fn new(pipeline: Arc<EdgePipeline>) -> Self {
        Self {
            pipeline,
            tls: false,
        }
    }

    /// Mark requests as received over TLS (`X-Forwarded-Proto: https`).
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub async fn handle_request(
        &self,
        mut req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        if self.tls {
            req.extensions_mut().insert(TlsConnection);
        }
        self.pipeline.handle(req, client_addr).await
    }

    /// Axum router with the pipeline as catch-all fallback.
    ///
    /// The client address is taken from `ConnectInfo` when the router is served with
    /// `into_make_service_with_connect_info`. A panic inside the pipeline becomes a 500.
    pub fn into_router(self) -> Router {
        let handler = Arc::new(self);
        Router::new()
            .fallback(move |req: Request| {
                let handler = handler.clone();
                async move {
                    let client_addr = req
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| *addr);
                    handler.handle_request(req, client_addr).await
                }
            })
            .layer(CatchPanicLayer::custom(panic_response))
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "request handling panicked");

    let mut response = Response::new(Body::from("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
