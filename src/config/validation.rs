//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (queues reference existing buckets, routes reference queues)
//! - Validate value ranges (timeouts > 0, capacities > 0, backoff ordering)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: BridgeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::BridgeConfig;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field (e.g. `queues[1].bucket`).
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &BridgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_broker(config, &mut errors);
    validate_timeouts(config, &mut errors);
    let buckets = validate_buckets(config, &mut errors);
    let queues = validate_queues(config, &buckets, &mut errors);
    validate_gateway(config, &queues, &mut errors);
    validate_ambient(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_broker(config: &BridgeConfig, errors: &mut Vec<ValidationError>) {
    let broker = &config.broker;
    match Url::parse(&broker.url) {
        Ok(url) if matches!(url.scheme(), "amqp" | "amqps") => {}
        Ok(url) => errors.push(ValidationError::new(
            "broker.url",
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new("broker.url", e.to_string())),
    }
    if broker.prefetch == 0 {
        errors.push(ValidationError::new("broker.prefetch", "must be at least 1"));
    }
    if broker.initial_backoff_ms == 0 {
        errors.push(ValidationError::new(
            "broker.initial_backoff_ms",
            "must be greater than 0",
        ));
    }
    if broker.initial_backoff_ms > broker.max_backoff_ms {
        errors.push(ValidationError::new(
            "broker.initial_backoff_ms",
            "must not exceed broker.max_backoff_ms",
        ));
    }
    if !(0.0..=1.0).contains(&broker.jitter_ratio) {
        errors.push(ValidationError::new(
            "broker.jitter_ratio",
            "must be between 0.0 and 1.0",
        ));
    }
}

fn validate_timeouts(config: &BridgeConfig, errors: &mut Vec<ValidationError>) {
    if config.rpc.timeout_ms == 0 {
        errors.push(ValidationError::new("rpc.timeout_ms", "must be greater than 0"));
    }
    if config.backend.timeout_ms == 0 {
        errors.push(ValidationError::new(
            "backend.timeout_ms",
            "must be greater than 0",
        ));
    }
    if let Err(e) = Url::parse(&config.backend.base_url) {
        errors.push(ValidationError::new("backend.base_url", e.to_string()));
    }
}

fn validate_buckets<'a>(
    config: &'a BridgeConfig,
    errors: &mut Vec<ValidationError>,
) -> HashSet<&'a str> {
    let mut names = HashSet::new();
    for (i, bucket) in config.buckets.iter().enumerate() {
        let field = |name: &str| format!("buckets[{i}].{name}");
        if bucket.name.trim().is_empty() {
            errors.push(ValidationError::new(field("name"), "must not be empty"));
        } else if !names.insert(bucket.name.as_str()) {
            errors.push(ValidationError::new(
                field("name"),
                format!("duplicate bucket '{}'", bucket.name),
            ));
        }
        if !(bucket.capacity > 0.0) {
            errors.push(ValidationError::new(field("capacity"), "must be greater than 0"));
        }
        if !(bucket.refill_rate >= 0.0) {
            errors.push(ValidationError::new(field("refill_rate"), "must not be negative"));
        }
    }
    names
}

fn validate_queues<'a>(
    config: &'a BridgeConfig,
    buckets: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) -> HashSet<&'a str> {
    let mut names = HashSet::new();
    if config.queues.is_empty() {
        errors.push(ValidationError::new("queues", "at least one queue is required"));
    }
    for (i, queue) in config.queues.iter().enumerate() {
        let field = |name: &str| format!("queues[{i}].{name}");
        if queue.name.trim().is_empty() {
            errors.push(ValidationError::new(field("name"), "must not be empty"));
        } else if !names.insert(queue.name.as_str()) {
            errors.push(ValidationError::new(
                field("name"),
                format!("duplicate queue '{}'", queue.name),
            ));
        }
        if let Some(bucket) = &queue.bucket {
            if !buckets.contains(bucket.as_str()) {
                errors.push(ValidationError::new(
                    field("bucket"),
                    format!("unknown bucket '{bucket}'"),
                ));
            }
        }
        if let Err(e) = queue.resolve_endpoint(&config.backend.base_url) {
            errors.push(ValidationError::new(field("endpoint"), e.to_string()));
        }
    }
    names
}

fn validate_gateway(
    config: &BridgeConfig,
    queues: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let gateway = &config.gateway;
    if gateway.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "gateway.bind_address",
            format!("invalid socket address '{}'", gateway.bind_address),
        ));
    }
    if gateway.request_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "gateway.request_timeout_secs",
            "must be greater than 0",
        ));
    }
    for (path, queue) in &gateway.routes {
        if !path.starts_with('/') {
            errors.push(ValidationError::new(
                format!("gateway.routes.{path}"),
                "path must start with '/'",
            ));
        }
        if !queues.contains(queue.as_str()) {
            errors.push(ValidationError::new(
                format!("gateway.routes.{path}"),
                format!("unknown queue '{queue}'"),
            ));
        }
    }
}

fn validate_ambient(config: &BridgeConfig, errors: &mut Vec<ValidationError>) {
    if config.audit.enabled
        && config
            .audit
            .path
            .as_deref()
            .map_or(true, |p| p.trim().is_empty())
    {
        errors.push(ValidationError::new(
            "audit.path",
            "required when audit is enabled",
        ));
    }
    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "invalid socket address",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BucketConfig, QueueConfig};

    fn fields(errors: &[ValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&BridgeConfig::default()), Ok(()));
    }

    #[test]
    fn test_reports_every_problem() {
        let mut config = BridgeConfig::default();
        config.broker.prefetch = 0;
        config.broker.initial_backoff_ms = 60_000;
        config.rpc.timeout_ms = 0;
        config.buckets.push(BucketConfig::new("orders", 0.0, -1.0));
        config
            .queues
            .push(QueueConfig::new("create-order", "/again", Some("missing")));

        let errors = validate_config(&config).unwrap_err();
        let fields = fields(&errors);
        assert!(fields.contains(&"broker.prefetch"));
        assert!(fields.contains(&"broker.initial_backoff_ms"));
        assert!(fields.contains(&"rpc.timeout_ms"));
        assert!(fields.contains(&"buckets[2].name"));
        assert!(fields.contains(&"buckets[2].capacity"));
        assert!(fields.contains(&"buckets[2].refill_rate"));
        assert!(fields.contains(&"queues[3].name"));
        assert!(fields.contains(&"queues[3].bucket"));
    }

    #[test]
    fn test_gateway_route_must_name_known_queue() {
        let mut config = BridgeConfig::default();
        config
            .gateway
            .routes
            .insert("/cancelOrder".to_string(), "cancel-order".to_string());
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cancel-order"));
    }

    #[test]
    fn test_rejects_non_amqp_url() {
        let mut config = BridgeConfig::default();
        config.broker.url = "http://localhost:5672".to_string();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["broker.url"]);
    }

    #[test]
    fn test_audit_requires_path() {
        let mut config = BridgeConfig::default();
        config.audit.enabled = true;
        config.audit.path = None;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(fields(&errors), vec!["audit.path"]);
    }

    #[test]
    fn test_zero_refill_rate_is_allowed() {
        let mut config = BridgeConfig::default();
        config.buckets = vec![BucketConfig::new("orders", 1.0, 0.0), BucketConfig::new("lookups", 1.0, 0.0)];
        assert!(validate_config(&config).is_ok());
    }
}
