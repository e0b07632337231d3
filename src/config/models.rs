//! Configuration data structures for edgeway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and carry defaults so that minimal configs remain concise. The route
//! and cluster sections follow a reverse-proxy layout: routes describe what to match,
//! clusters describe where matched requests go.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Admission control applied to every inbound request. `None` disables the stage.
    #[serde(default)]
    pub admission: Option<AdmissionConfig>,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            tls: None,
            admission: None,
            rate_limiter: RateLimiterConfig::default(),
            routes: HashMap::new(),
            clusters: HashMap::new(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// TLS configuration for the inbound listener (PEM encoded files).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// How the partition key for admission control is derived from a request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionBy {
    /// Client address (socket peer, or first `X-Forwarded-For` hop when trusted)
    Ip,
    /// Value of a named request header (e.g. an API key)
    Header,
    /// A single shared partition for all traffic
    Global,
}

/// Behaviour when a partition key could not be extracted (missing IP/header etc.).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    Allow,
    Deny,
}

fn default_on_missing_key() -> MissingKeyPolicy {
    MissingKeyPolicy::Allow
}

fn default_admission_policy() -> String {
    "fixed".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdmissionConfig {
    /// Name of a policy declared under `rate_limiter.policies`
    #[serde(default = "default_admission_policy")]
    pub policy: String,
    pub by: PartitionBy,
    /// Required when `by = "header"`
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default = "default_on_missing_key")]
    pub on_missing_key: MissingKeyPolicy,
    /// Use the first `X-Forwarded-For` hop as client address when `by = "ip"`
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policy: default_admission_policy(),
            by: PartitionBy::Ip,
            header_name: None,
            on_missing_key: default_on_missing_key(),
            trust_forwarded_for: false,
        }
    }
}

/// Algorithm used to enforce a rate limit policy.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Fixed-window counter. Allows up to 2x the limit across a window boundary.
    #[default]
    FixedWindow,
    /// Generic cell rate algorithm (smooth, no boundary burst).
    Gcra,
}

/// What the limiter does when its key store cannot make a decision.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Fail open: admit the request
    Allow,
    /// Fail closed: reject the request
    Deny,
}

fn default_status_code() -> u16 {
    429
}

fn default_message() -> String {
    "Too Many Requests".to_string()
}

/// Longest accepted rate limit window (366 days).
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// A named rate limit policy.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitPolicyConfig {
    pub window_secs: u64,
    pub permit_limit: u32,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default = "default_message")]
    pub message: String,
}

impl RateLimitPolicyConfig {
    pub fn fixed(window_secs: u64, permit_limit: u32) -> Self {
        Self {
            window_secs,
            permit_limit,
            algorithm: RateLimitAlgorithm::FixedWindow,
            status_code: default_status_code(),
            message: default_message(),
        }
    }
}

fn default_policies() -> HashMap<String, RateLimitPolicyConfig> {
    HashMap::from([("fixed".to_string(), RateLimitPolicyConfig::fixed(10, 5))])
}

fn default_on_store_error() -> StoreFailurePolicy {
    StoreFailurePolicy::Allow
}

fn default_max_tracked_keys() -> usize {
    100_000
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimiterConfig {
    #[serde(default = "default_policies")]
    pub policies: HashMap<String, RateLimitPolicyConfig>,
    #[serde(default = "default_on_store_error")]
    pub on_store_error: StoreFailurePolicy,
    /// Upper bound on partition keys tracked at once
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            on_store_error: default_on_store_error(),
            max_tracked_keys: default_max_tracked_keys(),
        }
    }
}

/// Request matching rules of a route. Exactly one of `path` or `prefix` is set.
///
/// `path` is an exact path unless it ends in `/{**name}` or `*`, in which case it is a
/// wildcard over everything after the literal part.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RouteMatchConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HeaderActions {
    #[serde(default)]
    pub add: HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransformConfig {
    /// Remove this prefix from the path before forwarding
    #[serde(default)]
    pub strip_prefix: Option<String>,
    /// Prepend this prefix to the (possibly stripped) path
    #[serde(default)]
    pub add_prefix: Option<String>,
    #[serde(default)]
    pub request_headers: HeaderActions,
    #[serde(default)]
    pub response_headers: HeaderActions,
    /// Add `X-Forwarded-For`, `X-Forwarded-Proto` and `X-Forwarded-Host`
    #[serde(default = "default_true")]
    pub forwarded_headers: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            strip_prefix: None,
            add_prefix: None,
            request_headers: HeaderActions::default(),
            response_headers: HeaderActions::default(),
            forwarded_headers: true,
        }
    }
}

fn default_route_timeout() -> String {
    "30s".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub cluster: String,
    #[serde(rename = "match")]
    pub matcher: RouteMatchConfig,
    #[serde(default)]
    pub transforms: TransformConfig,
    /// Time allowed for the upstream response head, parsed by humantime ("500ms", "30s")
    #[serde(default = "default_route_timeout")]
    pub timeout: String,
    /// Additional attempts after a timeout or connection failure
    #[serde(default)]
    pub retries: u32,
    /// Also retry methods that are not idempotent (POST, PATCH)
    #[serde(default)]
    pub retry_non_idempotent: bool,
}

impl RouteConfig {
    pub fn new(cluster: impl Into<String>, matcher: RouteMatchConfig) -> Self {
        Self {
            cluster: cluster.into(),
            matcher,
            transforms: TransformConfig::default(),
            timeout: default_route_timeout(),
            retries: 0,
            retry_non_idempotent: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    pub destinations: Vec<String>,
    #[serde(default)]
    pub load_balancing: LoadBalanceStrategy,
}

/// Transport used to ship finished spans (and, for OTLP, summary logs).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportProtocol {
    /// OTLP over gRPC (collector port 4317)
    OtlpGrpc,
    /// OTLP over HTTP with the protobuf encoding (collector port 4318)
    OtlpHttp,
    /// OTLP over HTTP with the JSON encoding
    OtlpHttpJson,
    /// Write spans as structured log events
    Log,
    None,
}

impl ExportProtocol {
    pub fn is_otlp(&self) -> bool {
        matches!(
            self,
            ExportProtocol::OtlpGrpc | ExportProtocol::OtlpHttp | ExportProtocol::OtlpHttpJson
        )
    }
}

fn default_export_protocol() -> ExportProtocol {
    ExportProtocol::Log
}

fn default_export_endpoint() -> String {
    "http://otel-collector:4317".to_string()
}

fn default_export_timeout() -> String {
    "5s".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExporterConfig {
    #[serde(default = "default_export_protocol")]
    pub protocol: ExportProtocol,
    /// Collector base URL. HTTP transports append `/v1/traces` and `/v1/logs`.
    #[serde(default = "default_export_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_export_timeout")]
    pub timeout: String,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            protocol: default_export_protocol(),
            endpoint: default_export_endpoint(),
            timeout: default_export_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub exporter: ExporterConfig,
    /// Also ship summary records as OTLP logs when an OTLP protocol is selected
    pub export_logs: bool,
    /// Capacity of the span export queue; spans beyond it are dropped
    pub queue_capacity: usize,
    pub max_batch_size: usize,
    pub flush_interval: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "edgeway".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            exporter: ExporterConfig::default(),
            export_logs: true,
            queue_capacity: 2048,
            max_batch_size: 256,
            flush_interval: "2s".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Per-target levels, typically to quiet chatty dependencies
    pub filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let filters = ["hyper", "h2", "rustls", "reqwest", "tonic", "opentelemetry"]
            .into_iter()
            .map(|target| (target.to_string(), "warn".to_string()))
            .collect();
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            filters,
        }
    }
}
