//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Route limit keys must name a `host:port` destination
//! - Timeouts must be non-zero
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ClientConfig → Result<(), Vec<ValidationError>>

use std::fmt;
use tracing::Level;

use crate::config::schema::ClientConfig;
use crate::pool::RouteKey;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
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

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for key in config.pool.max_per_route.keys() {
        if let Err(e) = key.parse::<RouteKey>() {
            errors.push(ValidationError::new(
                format!("pool.max_per_route.{key}"),
                e.to_string(),
            ));
        }
    }

    if config.pool.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("pool.connect_timeout_ms", "must be greater than 0"));
    }

    if config.pool.idle_timeout_ms == 0 {
        errors.push(ValidationError::new("pool.idle_timeout_ms", "must be greater than 0"));
    }

    if config.observability.log_level.parse::<Level>().is_err() {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", config.observability.log_level),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
