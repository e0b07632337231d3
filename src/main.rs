use std::{fs::File, io::BufReader, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::{
    Router,
    serve::{Listener, ListenerExt},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use edgeway::{
    adapters::{
        ExportSettings, HttpHandler, HyperHttpClient, TracingSummarySink, build_exporter,
        build_log_provider, spawn_export_queue, telemetry_resource,
    },
    config::{ServerConfig, ServerConfigValidator, TlsConfig, loader::load_config},
    core::{EdgePipeline, PipelineDeps},
    metrics, tracing_setup,
    utils::GracefulShutdown,
};
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};

/// Time allowed for queued spans to be flushed after the server stopped.
const EXPORT_DRAIN_SLACK: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "edgeway.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate a configuration file
    Validate {
        #[clap(short, long, default_value = "edgeway.toml")]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        #[clap(short, long, default_value = "edgeway.toml")]
        config: String,
    },
    /// Run the edge (default)
    Serve {
        #[clap(short, long, default_value = "edgeway.toml")]
        config: String,
    },
}

struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!(error = %e, "TLS accept error"),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if rustls::crypto::CryptoProvider::install_default(provider).is_err() {
        return Err(eyre!("Failed to install the rustls crypto provider"));
    }

    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    let resource = telemetry_resource(&config.telemetry);
    let log_provider = build_log_provider(&config.telemetry, &resource)?;
    tracing_setup::init_tracing(&config.logging, log_provider.as_ref())?;
    metrics::init_metrics();

    ServerConfigValidator::validate(&config).wrap_err("Configuration is invalid")?;

    let exporter = build_exporter(&config.telemetry, &resource)?;
    let export_settings = ExportSettings::from_config(&config.telemetry)?;
    tracing::info!(
        exporter = exporter.name(),
        endpoint = %config.telemetry.exporter.endpoint,
        queue_capacity = export_settings.capacity,
        "span export configured"
    );
    let (span_queue, export_worker) = spawn_export_queue(exporter, export_settings);

    let client = HyperHttpClient::new().context("Failed to create upstream HTTP client")?;
    let pipeline = EdgePipeline::from_config(
        &config,
        PipelineDeps {
            client: Arc::new(client),
            spans: span_queue.clone(),
            summaries: Arc::new(TracingSummarySink),
        },
    )?;
    tracing::info!(stages = ?pipeline.stage_names(), "edge pipeline ready");

    let app = HttpHandler::new(Arc::new(pipeline))
        .with_tls(config.tls.is_some())
        .into_router();

    let shutdown = GracefulShutdown::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = shutdown.run_signal_handler().await {
                tracing::error!(error = %e, "signal handler failed");
            }
        }
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    match &config.tls {
        Some(tls) => serve_tls(listener, tls, app, &shutdown).await?,
        None => {
            tracing::info!(%addr, "edgeway listening (HTTP)");
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal(&shutdown))
            .await
            .context("Server error")?;
        }
    }

    tracing::info!(dropped_spans = span_queue.dropped(), "server stopped, flushing spans");
    export_worker
        .shutdown(export_settings.export_timeout + EXPORT_DRAIN_SLACK)
        .await;
    tracing::info!("graceful shutdown completed");

    if let Some(provider) = log_provider {
        // Flushing waits on the batch task, so keep it off the runtime workers.
        match tokio::task::spawn_blocking(move || provider.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("failed to flush OTLP logs: {e}"),
            Err(e) => eprintln!("OTLP log flush task failed: {e}"),
        }
    }
    Ok(())
}

async fn serve_tls(
    listener: TcpListener,
    tls: &TlsConfig,
    app: Router,
    shutdown: &GracefulShutdown,
) -> Result<()> {
    use rustls_pemfile::{certs, private_key};
    use tls_listener::TlsListener;

    let cert_file = &mut BufReader::new(
        File::open(&tls.cert_path)
            .with_context(|| format!("failed to open cert file {}", tls.cert_path))?,
    );
    let key_file = &mut BufReader::new(
        File::open(&tls.key_path)
            .with_context(|| format!("failed to open key file {}", tls.key_path))?,
    );

    let cert_chain = certs(cert_file)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to read certificate chain")?;
    let key = private_key(key_file)
        .context("failed to read private key")?
        .ok_or_else(|| eyre!("No private key found in {}", tls.key_path))?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("invalid certificate or key")?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let local_addr = listener.local_addr().context("Failed to get local addr")?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let tls_listener = AxumListener {
        stream: TlsListener::new(acceptor, listener),
        local_addr,
    };

    tracing::info!(addr = %local_addr, "edgeway listening (HTTPS)");
    axum::serve(
        tls_listener.tap_io(|_| {}),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
    .context("Server error")
}

fn shutdown_signal(shutdown: &GracefulShutdown) -> impl Future<Output = ()> + Send + 'static {
    let signalled = shutdown.signalled();
    async move {
        let reason = signalled.await;
        tracing::info!(?reason, "stopping listener, draining in-flight requests");
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ServerConfigValidator::validate(&config) {
        Ok(()) => {
            print_summary(&config);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Every route must name a cluster declared under [clusters]");
            println!("   • Destinations must start with http:// or https://");
            println!("   • Rate limit windows and permit limits must be greater than 0");
            println!("   • Durations use humantime units (500ms, 10s, 1m)");
            std::process::exit(1);
        }
    }
}

fn print_summary(config: &ServerConfig) {
    println!("✅ Configuration validation: OK");
    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    println!("   • TLS Enabled: {}", config.tls.is_some());
    println!("   • Routes: {}", config.routes.len());
    println!("   • Clusters: {}", config.clusters.len());
    match &config.admission {
        Some(admission) => println!(
            "   • Admission: policy '{}' by {:?}",
            admission.policy, admission.by
        ),
        None => println!("   • Admission: disabled"),
    }
    println!(
        "   • Span Exporter: {:?} ({})",
        config.telemetry.exporter.protocol, config.telemetry.exporter.endpoint
    );
}

const DEFAULT_CONFIG: &str = r#"# Edgeway edge pipeline configuration

listen_addr = "127.0.0.1:8080"

# Admission control, applied before anything else
[admission]
policy = "fixed"
by = "ip"
on_missing_key = "allow"

[rate_limiter]
on_store_error = "allow"
max_tracked_keys = 100000

[rate_limiter.policies.fixed]
window_secs = 10
permit_limit = 5

# Routes: what to match and which cluster receives it
[routes.catalog]
cluster = "catalog"
timeout = "10s"
retries = 2

[routes.catalog.match]
path = "/catalog-service/{**catch-all}"

[routes.catalog.transforms]
strip_prefix = "/catalog-service"

[routes.ordering]
cluster = "ordering"
timeout = "15s"

[routes.ordering.match]
prefix = "/ordering-service"

[routes.ordering.transforms]
strip_prefix = "/ordering-service"

[routes.discount]
cluster = "discount"

[routes.discount.match]
prefix = "/discount-service"
methods = ["GET"]

[routes.discount.transforms]
strip_prefix = "/discount-service"

# Clusters: where matched requests go
[clusters.catalog]
destinations = ["http://localhost:5101"]

[clusters.ordering]
destinations = ["http://localhost:5102"]

[clusters.discount]
destinations = ["http://localhost:5103", "http://localhost:5104"]
load_balancing = "round_robin"

[telemetry]
service_name = "edgeway"
environment = "development"

[telemetry.exporter]
# otlp_grpc | otlp_http | otlp_http_json | log | none
protocol = "log"
# collector base URL (4317 for gRPC, 4318 for HTTP)
endpoint = "http://otel-collector:4317"

[logging]
level = "info"
format = "pretty"
"#;

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, DEFAULT_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'edgeway serve --config {config_path}' to start the edge");
    Ok(())
}

#[cfg(test)]
mod tests {
    use config::FileFormat;
    use edgeway::config::loader::load_config_from_str;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = load_config_from_str(DEFAULT_CONFIG, FileFormat::Toml).unwrap();
        assert_eq!(config.routes.len(), 3);
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }
}
