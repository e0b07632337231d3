//! Traits at the edges of the pipeline, implemented in `adapters`.
pub mod http_client;
pub mod span_exporter;
pub mod summary_sink;
pub mod window_store;
