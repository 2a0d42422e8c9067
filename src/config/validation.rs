use std::{
    collections::HashSet,
    net::SocketAddr,
    path::Path,
};

use tracing_subscriber::EnvFilter;

use crate::{
    config::models::GatewayConfig,
    core::{model::Rule, rate_limiter::FlowLimit},
    ports::discovery::DiscoverySnapshot,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field: field.to_string(),
        message: message.into(),
    }
}

fn invalid_rule(rule: &Rule, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidRule {
        rule: rule.id.clone(),
        message: message.into(),
    }
}

/// Gateway configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem at once
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        Self::into_result(Self::collect(config))
    }

    /// Every problem found in `config`
    pub fn collect(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }
        if config.max_content_length == 0 {
            errors.push(invalid("max_content_length", "must be greater than 0"));
        }

        let buffer_size = config.dispatch.buffer_size;
        if !buffer_size.is_power_of_two() {
            errors.push(invalid(
                "dispatch.buffer_size",
                format!("{buffer_size} is not a power of two"),
            ));
        }

        if config.http_client.connect_timeout_ms == 0 {
            errors.push(invalid("http_client.connect_timeout_ms", "must be greater than 0"));
        }
        if config.http_client.request_timeout_ms == 0 {
            errors.push(invalid("http_client.request_timeout_ms", "must be greater than 0"));
        }
        if config.filter_chain.cache_ttl_secs == 0 {
            errors.push(invalid("filter_chain.cache_ttl_secs", "must be greater than 0"));
        }
        if config.rate_limit.lock_attempts == 0 {
            errors.push(invalid("rate_limit.lock_attempts", "must be at least 1"));
        }

        if config.auth.cookie_name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.cookie_name".to_string(),
            });
        }
        if config.auth.user_id_claim.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.user_id_claim".to_string(),
            });
        }

        if let Some(path) = &config.discovery.path {
            if !Path::new(path).exists() {
                errors.push(invalid(
                    "discovery.path",
                    format!("file '{path}' does not exist"),
                ));
            }
        }

        if let Err(e) = EnvFilter::try_new(&config.log.level) {
            errors.push(invalid("log.level", e.to_string()));
        }

        errors
    }

    /// Validate a discovery snapshot before it is applied
    pub fn validate_snapshot(snapshot: &DiscoverySnapshot) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let mut ids = HashSet::new();

        for rule in &snapshot.rules {
            if rule.id.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "rule.id".to_string(),
                });
                continue;
            }
            if !ids.insert(rule.id.as_str()) {
                errors.push(invalid_rule(rule, "duplicate rule id"));
            }
            errors.extend(Self::validate_rule(rule));
        }

        let mut services = HashSet::new();
        for entry in &snapshot.services {
            let unique_id = &entry.definition.unique_id;
            if unique_id.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "service.definition.unique_id".to_string(),
                });
            } else if !services.insert(unique_id.as_str()) {
                errors.push(invalid(
                    "services",
                    format!("service '{unique_id}' is listed twice"),
                ));
            }
        }

        Self::into_result(errors)
    }

    fn validate_rule(rule: &Rule) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if rule.service_id.trim().is_empty() {
            errors.push(invalid_rule(rule, "service_id is empty"));
        }
        if !rule.prefix.is_empty() && !rule.prefix.starts_with('/') {
            errors.push(invalid_rule(rule, format!("prefix '{}' must start with '/'", rule.prefix)));
        }
        for path in &rule.paths {
            if !path.starts_with('/') {
                errors.push(invalid_rule(rule, format!("path '{path}' must start with '/'")));
            }
        }
        for flow in &rule.flow_control_configs {
            if let Err(e) = FlowLimit::parse(&flow.config) {
                errors.push(invalid_rule(
                    rule,
                    format!("flow control config for '{}': {e}", flow.value),
                ));
            }
        }
        for hystrix in &rule.hystrix_configs {
            if hystrix.timeout_ms == 0 {
                errors.push(invalid_rule(
                    rule,
                    format!("hystrix timeout for '{}' must be greater than 0", hystrix.path),
                ));
            }
        }
        errors
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8888' or '0.0.0.0:8888')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn into_result(errors: Vec<ValidationError>) -> ValidationResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            })
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: &[ValidationError]) -> String {
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
