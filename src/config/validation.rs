#![allow(clippy::collapsible_if)]

use std::net::SocketAddr;

use http::{StatusCode, Uri};
use tracing_subscriber::EnvFilter;

use crate::{
    config::models::{
        AdmissionConfig, LoggingConfig, MAX_WINDOW_SECS, PartitionBy, RateLimitPolicyConfig,
        RateLimiterConfig, ServerConfig, TelemetryConfig, TlsConfig,
    },
    core::route_table::RouteTable,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Invalid route table: {message}")]
    RouteTable { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem at once.
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Some(tls_config) = &config.tls {
            if let Err(e) = Self::validate_tls_config(tls_config) {
                errors.push(e);
            }
        }

        errors.extend(Self::validate_rate_limiter(&config.rate_limiter));

        if let Some(admission) = &config.admission {
            errors.extend(Self::validate_admission(admission, &config.rate_limiter));
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        } else if let Err(route_errors) = RouteTable::from_config(&config.routes, &config.clusters)
        {
            errors.extend(route_errors.into_iter().map(|e| ValidationError::RouteTable {
                message: e.to_string(),
            }));
        }

        errors.extend(Self::validate_telemetry(&config.telemetry));

        if let Err(e) = Self::validate_logging(&config.logging) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_tls_config(config: &TlsConfig) -> ValidationResult<()> {
        if !std::path::Path::new(&config.cert_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Certificate file does not exist: {}", config.cert_path),
            });
        }

        if !std::path::Path::new(&config.key_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Private key file does not exist: {}", config.key_path),
            });
        }

        Ok(())
    }

    fn validate_rate_limiter(config: &RateLimiterConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.max_tracked_keys == 0 {
            errors.push(ValidationError::InvalidField {
                field: "rate_limiter.max_tracked_keys".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (name, policy) in &config.policies {
            errors.extend(Self::validate_policy(name, policy));
        }

        errors
    }

    fn validate_policy(name: &str, policy: &RateLimitPolicyConfig) -> Vec<ValidationError> {
        let field = |suffix: &str| format!("rate_limiter.policies.{name}.{suffix}");
        let mut errors = Vec::new();

        if policy.window_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("window_secs"),
                message: "Window length must be a positive number of seconds".to_string(),
            });
        } else if policy.window_secs > MAX_WINDOW_SECS {
            errors.push(ValidationError::InvalidField {
                field: field("window_secs"),
                message: format!(
                    "Window length must be at most {MAX_WINDOW_SECS} seconds, got {}",
                    policy.window_secs
                ),
            });
        }

        if policy.permit_limit == 0 {
            errors.push(ValidationError::InvalidField {
                field: field("permit_limit"),
                message: "Permit limit must be greater than 0".to_string(),
            });
        }

        match StatusCode::from_u16(policy.status_code) {
            Ok(status) if status.is_client_error() || status.is_server_error() => {}
            _ => errors.push(ValidationError::InvalidField {
                field: field("status_code"),
                message: format!(
                    "Status code must be a 4xx or 5xx code, got {}",
                    policy.status_code
                ),
            }),
        }

        errors
    }

    fn validate_admission(
        admission: &AdmissionConfig,
        limiter: &RateLimiterConfig,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !limiter.policies.contains_key(&admission.policy) {
            errors.push(ValidationError::InvalidField {
                field: "admission.policy".to_string(),
                message: format!(
                    "Policy '{}' is not declared under rate_limiter.policies",
                    admission.policy
                ),
            });
        }

        if admission.by == PartitionBy::Header {
            match admission.header_name.as_deref().map(str::trim) {
                None | Some("") => errors.push(ValidationError::MissingField {
                    field: "admission.header_name".to_string(),
                }),
                Some(name) => {
                    if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                        errors.push(ValidationError::InvalidField {
                            field: "admission.header_name".to_string(),
                            message: format!("'{name}' is not a valid header name"),
                        });
                    }
                }
            }
        }

        errors
    }

    fn validate_telemetry(config: &TelemetryConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.service_name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "telemetry.service_name".to_string(),
            });
        }

        for (field, value) in [
            ("telemetry.flush_interval", &config.flush_interval),
            ("telemetry.exporter.timeout", &config.exporter.timeout),
        ] {
            match humantime::parse_duration(value) {
                Ok(duration) if !duration.is_zero() => {}
                Ok(_) => errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                }),
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("Invalid duration '{value}': {e}"),
                }),
            }
        }

        for (field, value) in [
            ("telemetry.queue_capacity", config.queue_capacity),
            ("telemetry.max_batch_size", config.max_batch_size),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if config.exporter.protocol.is_otlp() {
            match config.exporter.endpoint.parse::<Uri>() {
                Ok(uri) if uri.scheme().is_some() && uri.host().is_some() => {}
                _ => errors.push(ValidationError::InvalidField {
                    field: "telemetry.exporter.endpoint".to_string(),
                    message: format!(
                        "'{}' is not an absolute http(s) URL",
                        config.exporter.endpoint
                    ),
                }),
            }
        }

        errors
    }

    fn validate_logging(config: &LoggingConfig) -> ValidationResult<()> {
        let directive = crate::tracing_setup::filter_directive(config);
        EnvFilter::try_new(&directive)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidField {
                field: "logging".to_string(),
                message: format!("Invalid log filter '{directive}': {e}"),
            })
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
