//! Server registry (spec.md §4.E): the nine-handler reconcile chain that
//! keeps `E_srv` in agreement with its catalog entry, the cluster's K8s
//! settings, its `E_inst` fan-out, and its `E_oc`/secret-store credentials.

mod credentials;
mod drift;

pub use drift::manifest_drifted;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{CatalogEntry, OAuthClient, ServerInstance, ServerRecord};
use crate::secrets::{SecretContext, SecretStore};
use crate::store::{with_retry, ObjectStore};
use crate::utils::hash_secret;

/// Outcome of one reconcile pass (spec.md §4.E handler chain).
pub enum ReconcileOutcome {
    Updated(ServerRecord),
    Deleted,
    NoOp,
}

pub struct ServerRegistry {
    servers: Arc<dyn ObjectStore<ServerRecord>>,
    instances: Arc<dyn ObjectStore<ServerInstance>>,
    oauth_clients: Arc<dyn ObjectStore<OAuthClient>>,
    catalog: Arc<dyn ObjectStore<CatalogEntry>>,
    secrets: Arc<dyn SecretStore>,
    retry_start: std::time::Duration,
    retry_attempts: u32,
}

impl ServerRegistry {
    pub fn new(
        servers: Arc<dyn ObjectStore<ServerRecord>>,
        instances: Arc<dyn ObjectStore<ServerInstance>>,
        oauth_clients: Arc<dyn ObjectStore<OAuthClient>>,
        catalog: Arc<dyn ObjectStore<CatalogEntry>>,
        secrets: Arc<dyn SecretStore>,
        retry_start: std::time::Duration,
        retry_attempts: u32,
    ) -> Self {
        Self { servers, instances, oauth_clients, catalog, secrets, retry_start, retry_attempts }
    }

    /// Run the full nine-handler chain once for `namespace/name`. `k8s_settings_hash`
    /// is the hash of the *current* global K8s settings, read fresh by the
    /// caller on every reconcile (spec.md §5 "Global K8s settings are read
    /// per reconcile, not cached").
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        k8s_settings_hash: &str,
    ) -> Result<ReconcileOutcome> {
        with_retry(self.retry_start, self.retry_attempts, || async {
            let mut server = self.servers.get(namespace, name).await?;
            let mut changed = false;

            // 9. Removal of malformed records runs first so the remaining
            // handlers never operate on a record about to be deleted.
            if server.spec.manifest.runtime.validate().is_err() || server.spec.user_id == "anonymous" {
                self.servers.delete(namespace, name).await?;
                return Ok(ReconcileOutcome::Deleted);
            }

            // 1. Migration.
            if let Some(shared) = server.spec.shared_within_mcp_catalog_name.take() {
                if server.spec.catalog_id.is_none() {
                    server.spec.catalog_id = Some(shared);
                    changed = true;
                } else {
                    server.spec.shared_within_mcp_catalog_name = None;
                    changed = true;
                }
            }

            // 8. Composite cleanup. A component server whose own runtime
            // became composite is removed outright; a composite server has
            // its nested-composite components pruned from the spec (before
            // drift detection, so the pruned spec is what gets compared
            // against the catalog entry).
            if server.spec.is_composite_component() && server.spec.is_composite() {
                self.servers.delete(namespace, name).await?;
                return Ok(ReconcileOutcome::Deleted);
            }
            if let crate::model::RuntimeConfig::Composite { components } = &mut server.spec.manifest.runtime {
                let before = components.len();
                components.retain(|c| !c.is_nested_composite());
                changed |= before != components.len();
            }

            let mut catalog_entry: Option<CatalogEntry> = None;
            if let Some(entry_id) = server.spec.catalog_entry_id.clone() {
                catalog_entry = self.catalog.get(namespace, &entry_id).await.ok();
            }

            // 2. Catalog-ID propagation (invariant 5: frozen once populated).
            if server.spec.catalog_entry_id.is_some() && server.status.mcp_catalog_id.is_none() {
                if let Some(catalog_id) = server.spec.catalog_id.clone() {
                    server.status.mcp_catalog_id = Some(catalog_id);
                    changed = true;
                }
            }

            // 3. Drift detection.
            if let Some(entry) = &catalog_entry {
                let drifted = manifest_drifted(&server.spec.manifest, &entry.spec.manifest);
                if server.status.needs_update != drifted {
                    server.status.needs_update = drifted;
                    changed = true;
                }
            }

            // 4. K8s-settings drift: only *sets*, the deployment backend clears it.
            let current_hash = server.status.k8s_settings_hash.as_deref();
            if current_hash != Some(k8s_settings_hash) && !server.status.needs_k8s_update {
                server.status.needs_k8s_update = true;
                changed = true;
            }

            // 5. Multi-user user count.
            if server.spec.is_multi_user() {
                let instances = self.instances.list(Default::default()).await?;
                let count = crate::store::index_by(&instances, |inst: &ServerInstance| {
                    (!inst.meta.is_deleting() && inst.spec.mcp_server_name == server.meta.name)
                        .then(|| inst.spec.user_id.clone())
                })
                .len() as u64;
                if server.status.mcp_server_instance_user_count != Some(count) {
                    server.status.mcp_server_instance_user_count = Some(count);
                    changed = true;
                }
            } else if server.status.mcp_server_instance_user_count.is_some() {
                server.status.mcp_server_instance_user_count = None;
                changed = true;
            }

            // 6. Secrets provisioning.
            let secret_ctx = SecretContext::new(server.meta.name.clone(), server.meta.name.clone());
            let existing_client = self.oauth_clients.get(namespace, &server.meta.name).await.ok();
            let needs_provisioning = match (&existing_client, &server.status.audit_log_token_hash) {
                (None, _) => true,
                (Some(_), Some(recorded_hash)) => {
                    match self.secrets.get(&secret_ctx).await {
                        Ok(bundle) => match bundle.get("AUDIT_LOG_TOKEN") {
                            Some(token) => &hash_secret(token) != recorded_hash,
                            None => true,
                        },
                        Err(_) => true,
                    }
                }
                (Some(_), None) => true,
            };
            if needs_provisioning {
                let provisioned = credentials::provision(namespace, &server.meta.name)?;
                if let Some(existing) = existing_client {
                    self.oauth_clients.delete(namespace, &existing.meta.name).await.ok();
                }
                self.oauth_clients.create(provisioned.oauth_client).await?;
                self.secrets.put(&secret_ctx, provisioned.bundle).await?;
                server.status.audit_log_token_hash = Some(provisioned.audit_log_token_hash);
                changed = true;
            }

            // 7. OAuth-credential-status sync.
            let requires_static_oauth = catalog_entry.as_ref().map(|e| e.requires_static_oauth()).unwrap_or(false);
            let desired = if requires_static_oauth {
                catalog_entry.as_ref().map(|e| e.status.oauth_credential_configured).unwrap_or(false)
            } else {
                false
            };
            if server.status.oauth_credential_configured != desired {
                server.status.oauth_credential_configured = desired;
                changed = true;
            }

            if !changed {
                debug!(server = %name, "server reconcile: no-op");
                return Ok(ReconcileOutcome::NoOp);
            }

            info!(server = %name, "server reconcile: writing updated status");
            let updated = self.servers.update(server).await?;
            Ok(ReconcileOutcome::Updated(updated))
        })
        .await
    }

    /// Best-effort cascade-delete of a server's OAuth client and secret
    /// bundle, used by the finalizer path once the deployment backend has
    /// torn down the orchestrator objects.
    pub async fn release_credentials(&self, namespace: &str, name: &str) -> Result<()> {
        let ctx = SecretContext::new(name.to_string(), name.to_string());
        self.secrets.delete(&ctx).await?;
        match self.oauth_clients.delete(namespace, name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!(server = %name, error = %e, "failed to release oauth client");
                Err(e)
            }
        }
    }
}
