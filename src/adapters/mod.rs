pub mod export_queue;
pub mod exporters;
pub mod forwarder;
pub mod http_client;
pub mod http_handler;
pub mod summary_sink;
pub mod window_store;

/// Re-export commonly used types from adapters
pub use export_queue::{ExportQueue, ExportSettings, ExportWorker, spawn_export_queue};
pub use exporters::{
    InMemorySpanExporter, OtlpSpanExporter, build_exporter, build_log_provider, telemetry_resource,
};
pub use forwarder::Forwarder;
pub use http_client::HyperHttpClient;
pub use http_handler::HttpHandler;
pub use summary_sink::{CollectingSummarySink, TracingSummarySink};
pub use window_store::InMemoryWindowStore;
