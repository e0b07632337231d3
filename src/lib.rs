//! Edgeway - a reusable request edge pipeline for HTTP services.
//!
//! Every inbound request passes through a fixed chain of request-scoped stages:
//! admission control (named fixed-window rate limit policies), W3C trace context
//! continuation with a server span, route resolution and reverse-proxy forwarding
//! with a client span per upstream attempt, and finally exactly one structured
//! summary record per request. The crate follows a **hexagonal architecture**:
//! stage logic lives in `core`, the seams it needs (window store, upstream client,
//! span exporter, summary sink) are traits in `ports`, and `adapters` implements them.
//!
//! # Features
//! - Prefix, exact and catch-all routes with host and method constraints; ambiguous
//!   tables are rejected at load time
//! - Per-cluster round-robin or random balancing, per-route timeouts and retries
//! - Lock-free fixed-window rate limiting, plus GCRA via `governor`
//! - `traceparent`/`tracestate` propagation and span export over OTLP/HTTP JSON
//! - Exactly-once summaries, also for cancelled requests and panics
//! - Layered configuration (file + `EDGEWAY__*` environment) and `metrics` counters
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use edgeway::{
//!     EdgePipeline, HttpHandler, PipelineDeps,
//!     adapters::{HyperHttpClient, InMemorySpanExporter, TracingSummarySink},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = edgeway::config::load_config("edgeway.toml").await?;
//! let pipeline = EdgePipeline::from_config(
//!     &config,
//!     PipelineDeps {
//!         client: Arc::new(HyperHttpClient::new()?),
//!         spans: Arc::new(InMemorySpanExporter::new()),
//!         summaries: Arc::new(TracingSummarySink),
//!     },
//! )?;
//! let app = HttpHandler::new(Arc::new(pipeline)).into_router();
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request-path failures are [`EdgeError`] values rendered through axum's
//! `IntoResponse`. Startup paths return `eyre::Result` with context attached.
//!
//! # Concurrency & Data Structures
//! Rate limit state is one `AtomicU64` per partition key inside an `scc::HashMap`;
//! the route table is immutable and shared through `Arc`; finished spans leave the
//! request path through a bounded channel and never block it.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::HttpHandler,
    core::{EdgeError, EdgePipeline, PipelineDeps},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
