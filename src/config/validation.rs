//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check names and addresses parse
//! - Validate value ranges (timeouts > 0, backoff ordering, probabilities)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MessengerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::MessengerConfig;
use crate::msg::{EntityName, EntityType};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
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

pub fn validate_config(config: &MessengerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.identity.name.parse::<EntityName>().is_err() {
        errors.push(ValidationError::new(
            "identity.name",
            format!("'{}' is not of the form type.ordinal", config.identity.name),
        ));
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    let t = &config.timeouts;
    for (field, value) in [
        ("timeouts.connect_ms", t.connect_ms),
        ("timeouts.handshake_ms", t.handshake_ms),
        ("timeouts.read_secs", t.read_secs),
        ("timeouts.wait_ms", t.wait_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be > 0"));
        }
    }

    if config.backoff.initial_ms == 0 {
        errors.push(ValidationError::new("backoff.initial_ms", "must be > 0"));
    }
    if config.backoff.initial_ms > config.backoff.max_ms {
        errors.push(ValidationError::new(
            "backoff.max_ms",
            "must be >= backoff.initial_ms",
        ));
    }

    if config.dispatch.max_tokens_per_priority == 0 {
        errors.push(ValidationError::new(
            "dispatch.max_tokens_per_priority",
            "must be > 0",
        ));
    }
    if config.dispatch.min_cost > config.dispatch.max_tokens_per_priority {
        errors.push(ValidationError::new(
            "dispatch.min_cost",
            "must be <= dispatch.max_tokens_per_priority",
        ));
    }

    if config.wire.max_message_bytes == 0 {
        errors.push(ValidationError::new("wire.max_message_bytes", "must be > 0"));
    }

    for name in config.policies.keys() {
        if name.parse::<EntityType>().is_err() {
            errors.push(ValidationError::new(
                format!("policies.{name}"),
                "unknown entity type",
            ));
        }
    }

    for name in &config.inject.delay_types {
        if name.parse::<EntityType>().is_err() {
            errors.push(ValidationError::new(
                "inject.delay_types",
                format!("unknown entity type '{name}'"),
            ));
        }
    }
    if !(0.0..=1.0).contains(&config.inject.delay_probability) {
        errors.push(ValidationError::new(
            "inject.delay_probability",
            "must be within [0, 1]",
        ));
    }

    if config.observability.log_level.trim().is_empty() {
        errors.push(ValidationError::new("observability.log_level", "must not be empty"));
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
            "not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PolicyConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&MessengerConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = MessengerConfig::default();
        config.identity.name = "nobody".into();
        config.backoff.initial_ms = 500;
        config.backoff.max_ms = 100;
        config.inject.delay_probability = 1.5;
        config
            .policies
            .insert("osdd".into(), PolicyConfig::default());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "identity.name",
                "backoff.max_ms",
                "policies.osdd",
                "inject.delay_probability"
            ]
        );
    }
}
