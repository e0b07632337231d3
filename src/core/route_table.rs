//! Static route table: request matching and destination clusters.
//!
//! The table is built once from configuration and never mutated afterwards, so it is
//! shared between requests behind an `Arc` without any locking. Routes are kept sorted
//! by specificity; resolution returns the first route that matches, which is the
//! unique best match because equally specific overlapping routes are rejected when
//! the table is built.
use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use thiserror::Error;

use crate::{
    config::{ClusterConfig, HeaderActions, RouteConfig, RouteMatchConfig, TransformConfig},
    core::{
        destination::{Destination, DestinationError},
        load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
    },
};

/// Problems found while building a route table. Any of them is fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteTableError {
    #[error("route '{route}' references unknown cluster '{cluster}'")]
    UnknownCluster { route: String, cluster: String },

    #[error("cluster '{cluster}' has no destinations")]
    EmptyCluster { cluster: String },

    #[error("cluster '{cluster}': {source}")]
    InvalidDestination {
        cluster: String,
        #[source]
        source: DestinationError,
    },

    #[error("route '{route}' has an invalid match: {message}")]
    InvalidMatch { route: String, message: String },

    #[error("route '{route}' has an invalid transform: {message}")]
    InvalidTransform { route: String, message: String },

    #[error("route '{route}' has an invalid timeout '{timeout}': {message}")]
    InvalidTimeout {
        route: String,
        timeout: String,
        message: String,
    },

    #[error("routes '{first}' and '{second}' are ambiguous: both match {pattern} with equal specificity")]
    Ambiguous {
        first: String,
        second: String,
        pattern: String,
    },
}

/// How a route matches the request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathPattern {
    /// The path must equal the literal
    Exact(String),
    /// The path equals the literal or continues it with a `/` segment
    Prefix(String),
    /// The path starts with the literal (anything may follow)
    Wildcard(String),
}

impl PathPattern {
    /// Parse the `path` form: exact, unless it ends with `{**name}` or `*`.
    pub fn parse_path(path: &str) -> Result<Self, String> {
        if !path.starts_with('/') {
            return Err(format!("path '{path}' must start with '/'"));
        }
        if let Some(open) = path.rfind("{**") {
            if !path.ends_with('}') {
                return Err(format!("catch-all in '{path}' must be the last segment"));
            }
            return Ok(PathPattern::Wildcard(path[..open].to_string()));
        }
        if let Some(literal) = path.strip_suffix('*') {
            return Ok(PathPattern::Wildcard(literal.to_string()));
        }
        if path.contains('*') || path.contains('{') {
            return Err(format!("unsupported template in '{path}'"));
        }
        Ok(PathPattern::Exact(path.to_string()))
    }

    pub fn parse_prefix(prefix: &str) -> Result<Self, String> {
        if !prefix.starts_with('/') {
            return Err(format!("prefix '{prefix}' must start with '/'"));
        }
        if prefix.contains('*') || prefix.contains('{') {
            return Err(format!("prefix '{prefix}' cannot contain wildcards"));
        }
        Ok(PathPattern::Prefix(prefix.to_string()))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(literal) => path == literal,
            PathPattern::Prefix(literal) => {
                path.strip_prefix(literal.as_str()).is_some_and(|rest| {
                    rest.is_empty() || rest.starts_with('/') || literal.ends_with('/')
                })
            }
            PathPattern::Wildcard(literal) => path.starts_with(literal.as_str()),
        }
    }

    pub fn literal(&self) -> &str {
        match self {
            PathPattern::Exact(l) | PathPattern::Prefix(l) | PathPattern::Wildcard(l) => l,
        }
    }

    /// Exact over prefix over wildcard.
    fn kind_rank(&self) -> u8 {
        match self {
            PathPattern::Exact(_) => 2,
            PathPattern::Prefix(_) => 1,
            PathPattern::Wildcard(_) => 0,
        }
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathPattern::Exact(l) => write!(f, "exact '{l}'"),
            PathPattern::Prefix(l) => write!(f, "prefix '{l}'"),
            PathPattern::Wildcard(l) => write!(f, "wildcard '{l}*'"),
        }
    }
}

/// Header add/remove rules with names and values already validated.
#[derive(Debug, Clone, Default)]
pub struct HeaderRules {
    add: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderRules {
    fn compile(actions: &HeaderActions) -> Result<Self, String> {
        let mut add = Vec::with_capacity(actions.add.len());
        for (name, value) in &actions.add {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("header name '{name}': {e}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| format!("header value for '{name}': {e}"))?;
            add.push((name, value));
        }
        let remove = actions
            .remove
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| format!("header name '{name}': {e}"))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { add, remove })
    }

    /// Removals first, then additions (which replace existing values).
    pub fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.add {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// Request/response rewrites applied by the forwarder.
#[derive(Debug, Clone)]
pub struct Transforms {
    pub strip_prefix: Option<String>,
    pub add_prefix: Option<String>,
    pub request_headers: HeaderRules,
    pub response_headers: HeaderRules,
    pub forwarded_headers: bool,
}

impl Transforms {
    fn compile(config: &TransformConfig) -> Result<Self, String> {
        for (field, value) in [
            ("strip_prefix", &config.strip_prefix),
            ("add_prefix", &config.add_prefix),
        ] {
            if let Some(value) = value {
                if !value.starts_with('/') {
                    return Err(format!("{field} '{value}' must start with '/'"));
                }
            }
        }
        Ok(Self {
            strip_prefix: config.strip_prefix.clone(),
            add_prefix: config.add_prefix.clone(),
            request_headers: HeaderRules::compile(&config.request_headers)?,
            response_headers: HeaderRules::compile(&config.response_headers)?,
            forwarded_headers: config.forwarded_headers,
        })
    }

    /// Rewrite the inbound path into the path sent upstream.
    pub fn rewrite_path(&self, path: &str) -> String {
        let stripped = match &self.strip_prefix {
            Some(prefix) => match path.strip_prefix(prefix.trim_end_matches('/')) {
                Some("") => "/",
                Some(rest) if rest.starts_with('/') => rest,
                _ => path,
            },
            None => path,
        };
        match &self.add_prefix {
            Some(prefix) => {
                let prefix = prefix.trim_end_matches('/');
                if stripped == "/" && !prefix.is_empty() {
                    prefix.to_string()
                } else {
                    format!("{prefix}{stripped}")
                }
            }
            None => stripped.to_string(),
        }
    }
}

/// Timeout and retry behaviour of one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_non_idempotent: bool,
}

/// A named set of destinations with its own balancer state.
pub struct Cluster {
    id: String,
    destinations: Vec<Destination>,
    balancer: Box<dyn LoadBalancingStrategy>,
}

impl Cluster {
    pub fn new(
        id: impl Into<String>,
        destinations: Vec<Destination>,
        balancer: Box<dyn LoadBalancingStrategy>,
    ) -> Self {
        Self {
            id: id.into(),
            destinations,
            balancer,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Next destination according to the cluster's balancing strategy.
    pub fn pick(&self) -> Option<&Destination> {
        self.balancer
            .select(self.destinations.len())
            .and_then(|index| self.destinations.get(index))
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("destinations", &self.destinations)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct RouteEntry {
    pub id: String,
    pub pattern: PathPattern,
    /// Lowercase host names without port; `None` matches any host
    pub hosts: Option<Vec<String>>,
    /// `None` matches any method
    pub methods: Option<Vec<Method>>,
    pub cluster: Arc<Cluster>,
    pub transforms: Transforms,
    pub policy: RoutePolicy,
}

impl RouteEntry {
    fn matches(&self, method: &Method, path: &str, host: Option<&str>) -> bool {
        if !self.pattern.matches(path) {
            return false;
        }
        if let Some(methods) = &self.methods {
            if !methods.contains(method) {
                return false;
            }
        }
        match (&self.hosts, host) {
            (None, _) => true,
            (Some(hosts), Some(host)) => hosts.iter().any(|h| h == host),
            (Some(_), None) => false,
        }
    }

    /// Larger is more specific: literal length, then pattern kind, then host and
    /// method constraints.
    fn specificity(&self) -> (usize, u8, bool, bool) {
        (
            self.pattern.literal().len(),
            self.pattern.kind_rank(),
            self.hosts.is_some(),
            self.methods.is_some(),
        )
    }

    /// Whether some request could match both routes with equal specificity.
    fn ambiguous_with(&self, other: &RouteEntry) -> bool {
        fn overlap<T: PartialEq>(a: &Option<Vec<T>>, b: &Option<Vec<T>>) -> bool {
            match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => a.iter().any(|item| b.contains(item)),
                _ => false,
            }
        }
        self.pattern == other.pattern
            && self.specificity() == other.specificity()
            && overlap(&self.hosts, &other.hosts)
            && overlap(&self.methods, &other.methods)
    }
}

/// Immutable, specificity-ordered set of routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<RouteEntry>>,
}

impl RouteTable {
    /// Build the table, collecting every problem instead of stopping at the first.
    pub fn from_config(
        routes: &HashMap<String, RouteConfig>,
        clusters: &HashMap<String, ClusterConfig>,
    ) -> Result<Self, Vec<RouteTableError>> {
        let mut errors = Vec::new();

        let mut built_clusters = HashMap::with_capacity(clusters.len());
        for (id, cluster) in clusters {
            match Self::build_cluster(id, cluster) {
                Ok(built) => {
                    built_clusters.insert(id.as_str(), Arc::new(built));
                }
                Err(mut cluster_errors) => errors.append(&mut cluster_errors),
            }
        }

        let mut entries = Vec::with_capacity(routes.len());
        for (id, route) in routes {
            let Some(cluster) = built_clusters.get(route.cluster.as_str()) else {
                if !clusters.contains_key(&route.cluster) {
                    errors.push(RouteTableError::UnknownCluster {
                        route: id.clone(),
                        cluster: route.cluster.clone(),
                    });
                }
                continue;
            };
            match Self::build_entry(id, route, cluster.clone()) {
                Ok(entry) => entries.push(entry),
                Err(e) => errors.push(e),
            }
        }

        entries.sort_by(|a, b| {
            Reverse(a.specificity())
                .cmp(&Reverse(b.specificity()))
                .then_with(|| a.id.cmp(&b.id))
        });

        for (i, first) in entries.iter().enumerate() {
            for second in entries.iter().skip(i + 1) {
                if first.specificity() != second.specificity() {
                    break;
                }
                if first.ambiguous_with(second) {
                    errors.push(RouteTableError::Ambiguous {
                        first: first.id.clone(),
                        second: second.id.clone(),
                        pattern: first.pattern.to_string(),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(Self {
                routes: entries.into_iter().map(Arc::new).collect(),
            })
        } else {
            Err(errors)
        }
    }

    fn build_cluster(id: &str, config: &ClusterConfig) -> Result<Cluster, Vec<RouteTableError>> {
        if config.destinations.is_empty() {
            return Err(vec![RouteTableError::EmptyCluster {
                cluster: id.to_string(),
            }]);
        }
        let mut errors = Vec::new();
        let mut destinations = Vec::with_capacity(config.destinations.len());
        for address in &config.destinations {
            match Destination::new(address) {
                Ok(destination) => destinations.push(destination),
                Err(source) => errors.push(RouteTableError::InvalidDestination {
                    cluster: id.to_string(),
                    source,
                }),
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Cluster::new(
            id,
            destinations,
            LoadBalancerFactory::create_strategy(config.load_balancing),
        ))
    }

    fn build_entry(
        id: &str,
        config: &RouteConfig,
        cluster: Arc<Cluster>,
    ) -> Result<RouteEntry, RouteTableError> {
        let invalid_match = |message: String| RouteTableError::InvalidMatch {
            route: id.to_string(),
            message,
        };

        let pattern = Self::parse_pattern(&config.matcher).map_err(invalid_match)?;

        let hosts = if config.matcher.hosts.is_empty() {
            None
        } else {
            let mut hosts = Vec::with_capacity(config.matcher.hosts.len());
            for host in &config.matcher.hosts {
                let host = host.trim().to_ascii_lowercase();
                if host.is_empty() || host.contains("://") || host.contains('/') {
                    return Err(invalid_match(format!("invalid host '{host}'")));
                }
                hosts.push(strip_port(&host).to_string());
            }
            Some(hosts)
        };

        let methods = if config.matcher.methods.is_empty() {
            None
        } else {
            let methods = config
                .matcher
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
                        .map_err(|_| invalid_match(format!("invalid method '{m}'")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(methods)
        };

        let transforms =
            Transforms::compile(&config.transforms).map_err(|message| {
                RouteTableError::InvalidTransform {
                    route: id.to_string(),
                    message,
                }
            })?;

        let invalid_timeout = |message: String| RouteTableError::InvalidTimeout {
            route: id.to_string(),
            timeout: config.timeout.clone(),
            message,
        };
        let timeout = humantime::parse_duration(&config.timeout)
            .map_err(|e| invalid_timeout(e.to_string()))?;
        if timeout.is_zero() {
            return Err(invalid_timeout("must be greater than zero".to_string()));
        }

        Ok(RouteEntry {
            id: id.to_string(),
            pattern,
            hosts,
            methods,
            cluster,
            transforms,
            policy: RoutePolicy {
                timeout,
                retries: config.retries,
                retry_non_idempotent: config.retry_non_idempotent,
            },
        })
    }

    fn parse_pattern(matcher: &RouteMatchConfig) -> Result<PathPattern, String> {
        match (&matcher.path, &matcher.prefix) {
            (Some(path), None) => PathPattern::parse_path(path),
            (None, Some(prefix)) => PathPattern::parse_prefix(prefix),
            (Some(_), Some(_)) => Err("set either 'path' or 'prefix', not both".to_string()),
            (None, None) => Err("one of 'path' or 'prefix' is required".to_string()),
        }
    }

    /// Best route for a request, or `None` (not found).
    ///
    /// `host` is the normalized request host, as returned by [`request_host`].
    pub fn resolve(&self, method: &Method, path: &str, host: Option<&str>) -> Option<Arc<RouteEntry>> {
        self.routes
            .iter()
            .find(|route| route.matches(method, path, host))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes in resolution order.
    pub fn routes(&self) -> impl Iterator<Item = &Arc<RouteEntry>> {
        self.routes.iter()
    }

    /// Distinct clusters referenced by the table.
    pub fn cluster_ids(&self) -> HashSet<&str> {
        self.routes.iter().map(|r| r.cluster.id()).collect()
    }
}

/// Host the request was addressed to, lowercase and without port.
pub fn request_host(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| strip_port(host.trim()).to_ascii_lowercase())
        .filter(|host| !host.is_empty())
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons.
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadBalanceStrategy;

    fn cluster(destinations: &[&str]) -> ClusterConfig {
        ClusterConfig {
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            load_balancing: LoadBalanceStrategy::RoundRobin,
        }
    }

    fn path_route(cluster: &str, path: &str) -> RouteConfig {
        RouteConfig::new(
            cluster,
            RouteMatchConfig {
                path: Some(path.to_string()),
                ..Default::default()
            },
        )
    }

    fn prefix_route(cluster: &str, prefix: &str) -> RouteConfig {
        RouteConfig::new(
            cluster,
            RouteMatchConfig {
                prefix: Some(prefix.to_string()),
                ..Default::default()
            },
        )
    }

    fn table(routes: Vec<(&str, RouteConfig)>) -> Result<RouteTable, Vec<RouteTableError>> {
        let clusters = HashMap::from([
            ("c1".to_string(), cluster(&["http://c1:8080"])),
            ("c2".to_string(), cluster(&["http://c2:8080"])),
            ("c3".to_string(), cluster(&["http://c3:8080"])),
        ]);
        let routes = routes
            .into_iter()
            .map(|(id, route)| (id.to_string(), route))
            .collect();
        RouteTable::from_config(&routes, &clusters)
    }

    fn resolve_cluster(table: &RouteTable, method: Method, path: &str, host: Option<&str>) -> Option<String> {
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert(header::HOST, HeaderValue::from_str(host).unwrap());
        }
        table
            .resolve(&method, path, request_host(&headers).as_deref())
            .map(|route| route.cluster.id().to_string())
    }

    #[test]
    fn test_parse_patterns() {
        assert_eq!(
            PathPattern::parse_path("/catalog-service/{**catch-all}").unwrap(),
            PathPattern::Wildcard("/catalog-service/".to_string())
        );
        assert_eq!(
            PathPattern::parse_path("/img*").unwrap(),
            PathPattern::Wildcard("/img".to_string())
        );
        assert_eq!(
            PathPattern::parse_path("/catalog/health").unwrap(),
            PathPattern::Exact("/catalog/health".to_string())
        );
        assert!(PathPattern::parse_path("catalog").is_err());
        assert!(PathPattern::parse_path("/a/{**rest}/b").is_err());
        assert!(PathPattern::parse_prefix("/a/*").is_err());
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        let prefix = PathPattern::Prefix("/catalog".to_string());
        assert!(prefix.matches("/catalog"));
        assert!(prefix.matches("/catalog/products"));
        assert!(!prefix.matches("/catalogue"));

        let wildcard = PathPattern::Wildcard("/catalog".to_string());
        assert!(wildcard.matches("/catalogue"));
    }

    #[test]
    fn test_exact_beats_prefix() {
        let table = table(vec![
            ("catalog", prefix_route("c1", "/catalog")),
            ("catalog-health", path_route("c2", "/catalog/health")),
        ])
        .unwrap();

        assert_eq!(resolve_cluster(&table, Method::GET, "/catalog/health", None).as_deref(), Some("c2"));
        assert_eq!(resolve_cluster(&table, Method::GET, "/catalog/products", None).as_deref(), Some("c1"));
        assert_eq!(resolve_cluster(&table, Method::GET, "/basket", None), None);
    }

    #[test]
    fn test_equal_length_prefers_exact_then_prefix_then_wildcard() {
        let table = table(vec![
            ("wild", path_route("c3", "/orders*")),
            ("prefix", prefix_route("c2", "/orders")),
            ("exact", path_route("c1", "/orders")),
        ])
        .unwrap();

        assert_eq!(resolve_cluster(&table, Method::GET, "/orders", None).as_deref(), Some("c1"));
        assert_eq!(resolve_cluster(&table, Method::GET, "/orders/1", None).as_deref(), Some("c2"));
        assert_eq!(resolve_cluster(&table, Method::GET, "/ordersx", None).as_deref(), Some("c3"));
    }

    #[test]
    fn test_host_bound_route_wins_and_port_is_ignored() {
        let mut shop = prefix_route("c2", "/");
        shop.matcher.hosts = vec!["Shop.Example.com".to_string()];
        let table = table(vec![("any", prefix_route("c1", "/")), ("shop", shop)]).unwrap();

        assert_eq!(
            resolve_cluster(&table, Method::GET, "/cart", Some("shop.example.com:8443")).as_deref(),
            Some("c2")
        );
        assert_eq!(
            resolve_cluster(&table, Method::GET, "/cart", Some("other.example.com")).as_deref(),
            Some("c1")
        );
        assert_eq!(resolve_cluster(&table, Method::GET, "/cart", None).as_deref(), Some("c1"));
    }

    #[test]
    fn test_method_filter() {
        let mut writes = prefix_route("c2", "/orders");
        writes.matcher.methods = vec!["post".to_string(), "PUT".to_string()];
        let table = table(vec![("reads", prefix_route("c1", "/orders")), ("writes", writes)]).unwrap();

        assert_eq!(resolve_cluster(&table, Method::POST, "/orders", None).as_deref(), Some("c2"));
        assert_eq!(resolve_cluster(&table, Method::GET, "/orders", None).as_deref(), Some("c1"));
    }

    #[test]
    fn test_ambiguous_routes_rejected() {
        let errors = table(vec![
            ("a", prefix_route("c1", "/catalog")),
            ("b", prefix_route("c2", "/catalog")),
        ])
        .unwrap_err();
        assert!(matches!(errors[0], RouteTableError::Ambiguous { .. }));

        let mut a = path_route("c1", "/x");
        a.matcher.hosts = vec!["a.example.com".to_string(), "b.example.com".to_string()];
        let mut b = path_route("c2", "/x");
        b.matcher.hosts = vec!["b.example.com".to_string()];
        assert!(table(vec![("a", a), ("b", b)]).is_err());
    }

    #[test]
    fn test_disjoint_hosts_are_not_ambiguous() {
        let mut a = path_route("c1", "/x");
        a.matcher.hosts = vec!["a.example.com".to_string()];
        let mut b = path_route("c2", "/x");
        b.matcher.hosts = vec!["b.example.com".to_string()];
        assert!(table(vec![("a", a), ("b", b)]).is_ok());
    }

    #[test]
    fn test_dangling_and_empty_clusters_rejected() {
        let errors = table(vec![("orphan", prefix_route("missing", "/x"))]).unwrap_err();
        assert_eq!(
            errors,
            vec![RouteTableError::UnknownCluster {
                route: "orphan".to_string(),
                cluster: "missing".to_string()
            }]
        );

        let clusters = HashMap::from([("empty".to_string(), cluster(&[]))]);
        let routes = HashMap::from([("r".to_string(), prefix_route("empty", "/"))]);
        let errors = RouteTable::from_config(&routes, &clusters).unwrap_err();
        assert!(matches!(errors[0], RouteTableError::EmptyCluster { .. }));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let mut route = prefix_route("c1", "/x");
        route.timeout = "soon".to_string();
        assert!(matches!(
            table(vec![("r", route)]).unwrap_err()[0],
            RouteTableError::InvalidTimeout { .. }
        ));
    }

    #[test]
    fn test_rewrite_path() {
        let transforms = Transforms {
            strip_prefix: Some("/catalog-service".to_string()),
            add_prefix: None,
            request_headers: HeaderRules::default(),
            response_headers: HeaderRules::default(),
            forwarded_headers: true,
        };
        assert_eq!(transforms.rewrite_path("/catalog-service/products"), "/products");
        assert_eq!(transforms.rewrite_path("/catalog-service"), "/");
        assert_eq!(transforms.rewrite_path("/catalog-servicex"), "/catalog-servicex");

        let prefixed = Transforms {
            add_prefix: Some("/api/v1".to_string()),
            ..transforms
        };
        assert_eq!(prefixed.rewrite_path("/catalog-service/products"), "/api/v1/products");
        assert_eq!(prefixed.rewrite_path("/catalog-service"), "/api/v1");
    }

    #[test]
    fn test_round_robin_within_cluster() {
        let clusters = HashMap::from([(
            "pool".to_string(),
            cluster(&["http://a:1", "http://b:1"]),
        )]);
        let routes = HashMap::from([("r".to_string(), prefix_route("pool", "/"))]);
        let table = RouteTable::from_config(&routes, &clusters).unwrap();
        let route = table.resolve(&Method::GET, "/", None).unwrap();

        let hosts: Vec<_> = (0..3)
            .map(|_| route.cluster.pick().unwrap().host().to_string())
            .collect();
        assert_eq!(hosts, vec!["a", "b", "a"]);
    }
}
