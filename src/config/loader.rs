use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Prefix of environment variables overriding file settings, e.g.
/// `EDGEWAY__LISTEN_ADDR` or `EDGEWAY__TELEMETRY__EXPORTER__PROTOCOL`.
pub const ENV_PREFIX: &str = "EDGEWAY";

/// Standard OpenTelemetry variable naming the collector endpoint.
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    let path_str = config_path
        .to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?;

    let settings = Config::builder()
        .add_source(File::new(path_str, format_for(config_path)))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .set_override_option(
            "telemetry.exporter.endpoint",
            std::env::var(OTLP_ENDPOINT_ENV).ok(),
        )
        .wrap_err("Invalid configuration override")?
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}

/// Parse configuration from an in-memory document (no environment overlay).
pub fn load_config_from_str(content: &str, format: FileFormat) -> Result<ServerConfig> {
    Config::builder()
        .add_source(File::from_str(content, format))
        .build()
        .wrap_err("Failed to build config from string")?
        .try_deserialize()
        .wrap_err("Failed to deserialize config from string")
}

/// Determine file format based on extension, defaulting to TOML.
fn format_for(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::{ExportProtocol, PartitionBy};

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
admission:
  policy: fixed
  by: ip
clusters:
  catalog-cluster:
    destinations: ["http://catalog.api:8080"]
routes:
  catalog-route:
    cluster: catalog-cluster
    match:
      path: "/catalog-service/{**catch-all}"
    transforms:
      strip_prefix: "/catalog-service"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.admission.unwrap().by, PartitionBy::Ip);
        // The default "fixed" policy is always available.
        let fixed = &config.rate_limiter.policies["fixed"];
        assert_eq!((fixed.window_secs, fixed.permit_limit), (10, 5));
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "telemetry": { "exporter": { "protocol": "none" } },
  "clusters": { "ordering": { "destinations": ["http://ordering.api:8080"] } },
  "routes": {
    "ordering-route": {
      "cluster": "ordering",
      "match": { "prefix": "/ordering-service" },
      "retries": 2
    }
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.routes["ordering-route"].retries, 2);
        assert_eq!(config.routes["ordering-route"].timeout, "30s");
        assert_eq!(config.telemetry.exporter.protocol, ExportProtocol::None);
    }

    #[test]
    fn test_load_from_str_toml() {
        let toml = r#"
listen_addr = "0.0.0.0:8080"

[rate_limiter.policies.burst]
window_secs = 1
permit_limit = 100
algorithm = "gcra"
"#;
        let config = load_config_from_str(toml, FileFormat::Toml).unwrap();
        assert_eq!(config.rate_limiter.policies["burst"].permit_limit, 100);
        assert!(config.admission.is_none());
    }
}
