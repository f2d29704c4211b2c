//! Server record (`E_srv`), server instance (`E_inst`), and OAuth client
//! record (`E_oc`) — spec.md §3.

use serde::{Deserialize, Serialize};

use super::{Manifest, ObjectMeta};

/// Observed deployment state (spec.md §3 `status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Available,
    Progressing,
    Unavailable,
    NeedsAttention,
    Unknown,
}

impl Default for DeploymentState {
    fn default() -> Self {
        DeploymentState::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCondition {
    pub condition_type: String,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub user_id: String,
    pub catalog_entry_id: Option<String>,
    pub catalog_id: Option<String>,
    pub workspace_id: Option<String>,
    pub composite_name: Option<String>,
    /// Deprecated field migrated once into `catalog_id` (invariant 4).
    pub shared_within_mcp_catalog_name: Option<String>,
    pub manifest: Manifest,
    pub needs_url: bool,
    pub previous_url: Option<String>,
}

impl ServerSpec {
    /// A server is "multi-user" (spec.md invariant 3) iff scoped to a
    /// catalog or workspace rather than purely owned by one user.
    pub fn is_multi_user(&self) -> bool {
        self.catalog_id.is_some() || self.workspace_id.is_some()
    }

    pub fn is_composite(&self) -> bool {
        self.manifest.runtime.is_composite()
    }

    pub fn is_composite_component(&self) -> bool {
        self.composite_name.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerStatus {
    pub deployment_state: DeploymentState,
    pub available_replicas: u32,
    pub ready_replicas: u32,
    pub conditions: Vec<ServerCondition>,
    pub needs_update: bool,
    pub needs_k8s_update: bool,
    pub k8s_settings_hash: Option<String>,
    pub observed_composite_manifest_hash: Option<String>,
    pub mcp_server_instance_user_count: Option<u64>,
    pub oauth_credential_configured: bool,
    pub audit_log_token_hash: Option<String>,
    /// Frozen once populated (invariant 5).
    pub mcp_catalog_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub meta: ObjectMeta,
    pub spec: ServerSpec,
    pub status: ServerStatus,
}

impl ServerRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ServerSpec) -> Self {
        Self { meta: ObjectMeta::new(namespace, name), spec, status: ServerStatus::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInstanceSpec {
    pub user_id: String,
    pub mcp_server_name: String,
    pub composite_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInstance {
    pub meta: ObjectMeta,
    pub spec: ServerInstanceSpec,
}

impl ServerInstance {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ServerInstanceSpec) -> Self {
        Self { meta: ObjectMeta::new(namespace, name), spec }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClientSpec {
    pub server_name: String,
    pub client_id: String,
    pub client_secret_hash: String,
    pub grant_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClient {
    pub meta: ObjectMeta,
    pub spec: OAuthClientSpec,
}

impl OAuthClient {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: OAuthClientSpec) -> Self {
        Self { meta: ObjectMeta::new(namespace, name), spec }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuntimeConfig;

    fn manifest() -> Manifest {
        Manifest {
            runtime: RuntimeConfig::Uvx { package: "p@1.0".into(), command: None, args: vec![] },
            env: vec![],
        }
    }

    #[test]
    fn multi_user_requires_catalog_or_workspace_scope() {
        let spec = ServerSpec {
            user_id: "u1".into(),
            catalog_entry_id: None,
            catalog_id: Some("cat1".into()),
            workspace_id: None,
            composite_name: None,
            shared_within_mcp_catalog_name: None,
            manifest: manifest(),
            needs_url: false,
            previous_url: None,
        };
        assert!(spec.is_multi_user());

        let mut solo = spec.clone();
        solo.catalog_id = None;
        assert!(!solo.is_multi_user());
    }
}
