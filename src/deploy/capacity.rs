//! Capacity admission (spec.md §4.F): a fail-open precheck against the
//! namespace's `ResourceQuota`s before deploying a new server.

use crate::config::ResourceSpec;
use crate::error::{ControlPlaneError, Result};

/// A single quota's `hard`/`used` pair for one resource dimension, already
/// parsed out of the live `ResourceQuota` object by the caller.
pub struct QuotaDimension {
    pub resource: String,
    pub hard: i64,
    pub used: i64,
}

/// `true` if reserving `request` would still fit under every quota
/// dimension that mentions `requests.cpu` / `requests.memory`. No quotas
/// (or quotas that don't cover these dimensions) ⇒ allow (spec.md §4.F:
/// "the orchestrator makes the final decision").
pub fn admit(quotas: &[QuotaDimension], request: &ResourceSpec) -> Result<()> {
    for dim in quotas {
        let requested = match dim.resource.as_str() {
            "requests.cpu" => request.cpu.as_deref().map(parse_cpu_millis),
            "requests.memory" => request.memory.as_deref().map(parse_memory_bytes),
            _ => None,
        };
        let Some(Some(requested)) = requested.map(Some) else { continue };
        if dim.used + requested > dim.hard {
            return Err(ControlPlaneError::InsufficientCapacity);
        }
    }
    Ok(())
}

/// Parse a Kubernetes CPU quantity (`"10m"`, `"1"`, `"2.5"`) into millicores.
fn parse_cpu_millis(value: &str) -> i64 {
    if let Some(m) = value.strip_suffix('m') {
        m.parse().unwrap_or(0)
    } else {
        (value.parse::<f64>().unwrap_or(0.0) * 1000.0) as i64
    }
}

/// Parse a Kubernetes memory quantity (`"400Mi"`, `"1Gi"`, raw bytes) into
/// bytes.
fn parse_memory_bytes(value: &str) -> i64 {
    const UNITS: &[(&str, i64)] = &[
        ("Ki", 1024),
        ("Mi", 1024 * 1024),
        ("Gi", 1024 * 1024 * 1024),
        ("Ti", 1024_i64.pow(4)),
        ("K", 1000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
    ];
    for (suffix, multiplier) in UNITS {
        if let Some(n) = value.strip_suffix(suffix) {
            return (n.parse::<f64>().unwrap_or(0.0) * *multiplier as f64) as i64;
        }
    }
    value.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ResourceSpec {
        ResourceSpec { cpu: Some("10m".to_string()), memory: Some("400Mi".to_string()) }
    }

    #[test]
    fn admits_when_quota_has_headroom() {
        let quotas = vec![QuotaDimension { resource: "requests.cpu".into(), hard: 1000, used: 100 }];
        assert!(admit(&quotas, &request()).is_ok());
    }

    #[test]
    fn denies_when_memory_quota_would_be_exceeded() {
        let quotas = vec![QuotaDimension {
            resource: "requests.memory".into(),
            hard: 500 * 1024 * 1024,
            used: 400 * 1024 * 1024,
        }];
        let err = admit(&quotas, &request()).unwrap_err();
        assert!(matches!(err, ControlPlaneError::InsufficientCapacity));
    }

    #[test]
    fn no_quotas_allows() {
        assert!(admit(&[], &request()).is_ok());
    }

    #[test]
    fn unrelated_dimension_is_ignored() {
        let quotas = vec![QuotaDimension { resource: "requests.storage".into(), hard: 0, used: 0 }];
        assert!(admit(&quotas, &request()).is_ok());
    }
}
