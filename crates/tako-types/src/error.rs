//! Cross-cutting error kinds shared by several engine components.
//!
//! Component-local failures (locking, templating, quotas, state I/O) keep
//! their own enums next to the code that raises them; the kinds here are
//! raised from more than one place.

use thiserror::Error;

/// Invalid or missing caller-supplied data: workflow inputs, builtin
/// parameters, empty orchestration arguments.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("missing required input '{0}'")]
    MissingRequired(String),

    #[error("input '{name}' must be one of {allowed:?}, got '{value}'")]
    EnumMismatch {
        name: String,
        allowed: Vec<String>,
        value: String,
    },

    #[error("parameter '{0}' must not be empty")]
    Empty(String),

    #[error("invalid parameter '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

/// Unparsable versions and unsupported range syntax.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("unsupported version range syntax '{0}'")]
    UnsupportedRange(String),
}

/// Filter expression compile or evaluation failure.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter '{expression}' failed to evaluate: {reason}")]
    Eval { expression: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_error_display() {
        let err = InputError::MissingRequired("environment".to_string());
        assert_eq!(err.to_string(), "missing required input 'environment'");

        let err = InputError::EnumMismatch {
            name: "environment".to_string(),
            allowed: vec!["dev".to_string(), "prod".to_string()],
            value: "Dev".to_string(),
        };
        assert!(err.to_string().contains("environment"));
        assert!(err.to_string().contains("Dev"));
    }

    #[test]
    fn schema_error_display() {
        let err = SchemaError::UnsupportedRange("=>1.0.0".to_string());
        assert!(err.to_string().contains("=>1.0.0"));
    }

    #[test]
    fn filter_error_display() {
        let err = FilterError::Eval {
            expression: "payload.status ==".to_string(),
            reason: "unexpected end of input".to_string(),
        };
        assert!(err.to_string().contains("payload.status"));
    }
}
