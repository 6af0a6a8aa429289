//! Resource specifications: CPU and byte-quantity parsing plus the limit
//! and sample records used by the resource manager.
//!
//! CPU specs are either fractional cores (`"1.5"`) or millicores
//! (`"500m"`). Byte quantities accept `B`, `KB`, `MB`, `GB`, `Ki`, `Mi`,
//! `Gi` suffixes and normalise to megabytes; decimal suffixes are treated
//! as their 1024-based equivalents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MB: f64 = 1024.0 * 1024.0;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from resource-spec parsing.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("invalid cpu spec '{0}'")]
    InvalidCpu(String),

    #[error("invalid memory spec '{0}'")]
    InvalidMemory(String),

    #[error("resource spec '{0}' must be positive")]
    NonPositive(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a CPU spec into cores. `"1.5"` -> 1.5, `"500m"` -> 0.5.
pub fn parse_cpu(spec: &str) -> Result<f64, ResourceError> {
    let spec = spec.trim();
    let cores = if let Some(millis) = spec.strip_suffix('m') {
        millis
            .parse::<f64>()
            .map_err(|_| ResourceError::InvalidCpu(spec.to_string()))?
            / 1000.0
    } else {
        spec.parse::<f64>()
            .map_err(|_| ResourceError::InvalidCpu(spec.to_string()))?
    };
    if !cores.is_finite() || cores <= 0.0 {
        return Err(ResourceError::NonPositive(spec.to_string()));
    }
    Ok(cores)
}

/// Parse a byte-quantity spec into megabytes.
pub fn parse_memory_mb(spec: &str) -> Result<f64, ResourceError> {
    let spec = spec.trim();
    let (number, multiplier) = if let Some(v) = spec.strip_suffix("Ki") {
        (v, 1024.0)
    } else if let Some(v) = spec.strip_suffix("Mi") {
        (v, MB)
    } else if let Some(v) = spec.strip_suffix("Gi") {
        (v, 1024.0 * MB)
    } else if let Some(v) = spec.strip_suffix("KB") {
        (v, 1024.0)
    } else if let Some(v) = spec.strip_suffix("MB") {
        (v, MB)
    } else if let Some(v) = spec.strip_suffix("GB") {
        (v, 1024.0 * MB)
    } else if let Some(v) = spec.strip_suffix('B') {
        (v, 1.0)
    } else {
        return Err(ResourceError::InvalidMemory(spec.to_string()));
    };

    let bytes = number
        .trim()
        .parse::<f64>()
        .map_err(|_| ResourceError::InvalidMemory(spec.to_string()))?
        * multiplier;
    if !bytes.is_finite() || bytes <= 0.0 {
        return Err(ResourceError::NonPositive(spec.to_string()));
    }
    Ok(bytes / MB)
}

// ---------------------------------------------------------------------------
// Limits and samples
// ---------------------------------------------------------------------------

/// Effective resource limits at one hierarchy level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit in cores.
    pub cpu_cores: f64,
    /// Memory limit in megabytes.
    pub memory_mb: f64,
    /// Optional disk limit in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_mb: Option<f64>,
}

/// One host usage observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub timestamp: DateTime<Utc>,
    /// Host-wide CPU utilisation, 0..=100 per core aggregate.
    pub cpu_percent: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
