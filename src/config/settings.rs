//! Config and Helm-supplied K8s scheduling settings.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlPlaneError, Result};

/// CPU/memory pair used for both the capacity-precheck reservation default
/// and the deployment backend's resource requests/limits (spec.md §4.F).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Pod Security Admission enforcement level (spec.md §4.F PSA matrix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsaLevel {
    Privileged,
    Baseline,
    Restricted,
}

impl Default for PsaLevel {
    fn default() -> Self {
        PsaLevel::Baseline
    }
}

/// Daily per-user token-usage budget (spec.md §4.J "rolling-window (24h)
/// token-usage budget"); either half may be unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_per_day: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_per_day: Option<u64>,
}

/// Helm-supplied pod-scheduling settings, propagated into every rendered
/// deployment (spec.md §4.F / §6). Round-trips through YAML: parsing then
/// re-serializing preserves every field, including the distinction between
/// "absent" and "explicitly null", which matters for the `{$patch:delete}`
/// strategic-merge behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct K8sSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "runtimeClassName")]
    pub runtime_class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "storageClassName")]
    pub storage_class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    #[serde(rename = "podSecurityLevel")]
    pub psa_level: PsaLevel,
}

impl K8sSettings {
    /// Parse Helm-rendered YAML into `K8sSettings`.
    pub fn parse(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Convert back to semantically-equivalent YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Stable hash of these settings, used for `status.k8sSettingsHash`
    /// drift detection (spec.md invariant 8).
    pub fn hash(&self) -> String {
        crate::utils::hash_value(self)
    }
}

/// Process-wide configuration, resolved from environment variables (with
/// `.env` support via `dotenvy`), matching spec.md §6's "Config surface".
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub mcp_cluster_domain: String,
    pub internal_service_fqdn: String,
    pub default_capacity_request: ResourceSpec,
    pub token_limits: TokenLimits,
    pub audit_log_batch_size: usize,
    pub audit_log_flush_interval: Duration,
    pub oauth_client_id_prefix: String,
    pub reconciler_workers: usize,
    pub leader_election_lease_name: String,
    pub session_idle_eviction: Duration,
    pub retry_backoff_start: Duration,
    pub retry_max_attempts: u32,
    pub object_store_namespace: String,
    pub k8s_settings: K8sSettings,
}

impl Config {
    /// Load configuration from the environment, applying the same defaults
    /// documented in spec.md §6 / §9 ("Backoff parameters are small: default
    /// backoff ≈100ms start, ≈5 attempts").
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let k8s_settings = match env::var("K8S_SETTINGS_YAML") {
            Ok(yaml) => K8sSettings::parse(&yaml)?,
            Err(_) => K8sSettings::default(),
        };

        Ok(Self {
            openai_base_url: env::var("OPENAI_BASE_URL").ok(),
            anthropic_base_url: env::var("ANTHROPIC_BASE_URL").ok(),
            mcp_cluster_domain: env::var("MCP_CLUSTER_DOMAIN")
                .unwrap_or_else(|_| "mcp.cluster.local".to_string()),
            internal_service_fqdn: env::var("INTERNAL_SERVICE_FQDN")
                .unwrap_or_else(|_| "obot.svc.cluster.local".to_string()),
            default_capacity_request: ResourceSpec {
                cpu: Some(env::var("DEFAULT_CAPACITY_CPU").unwrap_or_else(|_| "10m".to_string())),
                memory: Some(
                    env::var("DEFAULT_CAPACITY_MEMORY").unwrap_or_else(|_| "400Mi".to_string()),
                ),
            },
            token_limits: TokenLimits {
                prompt_per_day: env_u64("DAILY_PROMPT_TOKEN_LIMIT"),
                completion_per_day: env_u64("DAILY_COMPLETION_TOKEN_LIMIT"),
            },
            audit_log_batch_size: env_u64("AUDIT_LOG_BATCH_SIZE").unwrap_or(50) as usize,
            audit_log_flush_interval: Duration::from_secs(
                env_u64("AUDIT_LOG_FLUSH_INTERVAL_SECS").unwrap_or(10),
            ),
            oauth_client_id_prefix: env::var("OAUTH_CLIENT_ID_PREFIX")
                .unwrap_or_else(|_| "mcp-".to_string()),
            reconciler_workers: env_u64("RECONCILER_WORKERS").unwrap_or(8) as usize,
            leader_election_lease_name: env::var("LEADER_ELECTION_LEASE")
                .unwrap_or_else(|_| "mcp-control-plane-leader".to_string()),
            session_idle_eviction: Duration::from_secs(
                env_u64("SESSION_IDLE_EVICTION_SECS").unwrap_or(1800),
            ),
            retry_backoff_start: Duration::from_millis(
                env_u64("RETRY_BACKOFF_START_MS").unwrap_or(100),
            ),
            retry_max_attempts: env_u64("RETRY_MAX_ATTEMPTS").unwrap_or(5) as u32,
            object_store_namespace: env::var("OBJECT_STORE_NAMESPACE")
                .unwrap_or_else(|_| "obot".to_string()),
            k8s_settings,
        })
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl TryFrom<&str> for K8sSettings {
    type Error = ControlPlaneError;

    fn try_from(yaml: &str) -> Result<Self> {
        K8sSettings::parse(yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k8s_settings_round_trip_is_semantically_equal() {
        let yaml = r#"
runtimeClassName: gvisor
podSecurityLevel: restricted
resources:
  cpu: "500m"
  memory: "512Mi"
"#;
        let parsed = K8sSettings::parse(yaml).unwrap();
        let re_serialized = parsed.to_yaml().unwrap();
        let reparsed = K8sSettings::parse(&re_serialized).unwrap();
        assert_eq!(parsed, reparsed);
        assert_eq!(parsed.psa_level, PsaLevel::Restricted);
        assert_eq!(parsed.runtime_class_name.as_deref(), Some("gvisor"));
        assert!(parsed.affinity.is_none());
    }

    #[test]
    fn default_psa_level_is_baseline() {
        let settings = K8sSettings::default();
        assert_eq!(settings.psa_level, PsaLevel::Baseline);
    }
}
