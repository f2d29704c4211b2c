use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{CatalogEntry, Manifest, RuntimeConfig, ServerRecord};
use crate::secrets::{CredentialBundle, SecretContext, SecretStore};
use crate::store::{with_retry, ObjectStore};
use crate::utils::hash_value;

use super::drift::component_source_drifted;

/// The live source a composite catalog entry's component snapshot is
/// compared against — either another catalog entry, or a multi-user server
/// record (spec.md §4.D: "fetches its current source (either an `E_cat` or a
/// multi-user `E_srv`)").
pub enum ComponentSource {
    CatalogEntry(CatalogEntry),
    MultiUserServer(ServerRecord),
}

impl ComponentSource {
    fn manifest(&self) -> &Manifest {
        match self {
            ComponentSource::CatalogEntry(e) => &e.spec.manifest,
            ComponentSource::MultiUserServer(s) => &s.spec.manifest,
        }
    }
}

pub struct CatalogRegistry {
    store: Arc<dyn ObjectStore<CatalogEntry>>,
    secrets: Arc<dyn SecretStore>,
    retry_start: std::time::Duration,
    retry_attempts: u32,
}

impl CatalogRegistry {
    pub fn new(
        store: Arc<dyn ObjectStore<CatalogEntry>>,
        secrets: Arc<dyn SecretStore>,
        retry_start: std::time::Duration,
        retry_attempts: u32,
    ) -> Self {
        Self { store, secrets, retry_start, retry_attempts }
    }

    /// Recompute `status.manifestHash` / `status.lastUpdated` on every
    /// `spec.manifest` change. Returns whether anything changed.
    fn sync_manifest_hash(&self, entry: &mut CatalogEntry) -> bool {
        let new_hash = hash_value(&entry.spec.manifest);
        if entry.status.manifest_hash.as_deref() == Some(new_hash.as_str()) {
            return false;
        }
        entry.status.manifest_hash = Some(new_hash);
        entry.status.last_updated = Some(Utc::now());
        true
    }

    /// Nested-composite cleanup: a composite entry removes any component
    /// whose own runtime is composite (one-level protection, spec.md §4.D).
    fn prune_nested_composites(&self, entry: &mut CatalogEntry) -> bool {
        if let RuntimeConfig::Composite { components } = &mut entry.spec.manifest.runtime {
            let before = components.len();
            components.retain(|c| !c.is_nested_composite());
            before != components.len()
        } else {
            false
        }
    }

    /// Composite drift: `status.needsUpdate = ∃ comp. hash(comp.snapshot) ≠
    /// hash(comp.source)` (spec.md §4.D).
    fn sync_composite_drift<F>(&self, entry: &mut CatalogEntry, resolve_source: F) -> bool
    where
        F: Fn(&str, &str) -> Option<ComponentSource>,
    {
        let RuntimeConfig::Composite { components } = &entry.spec.manifest.runtime else {
            let changed = entry.status.needs_update;
            entry.status.needs_update = false;
            return changed;
        };

        let needs_update = components.iter().any(|c| {
            let source = match (&c.catalog_entry_id, &c.mcp_server_id) {
                (Some(id), _) => resolve_source(id, "catalog_entry"),
                (_, Some(id)) => resolve_source(id, "mcp_server"),
                _ => None,
            };
            match source {
                Some(src) => component_source_drifted(&c.manifest, src.manifest()),
                None => false,
            }
        });

        let changed = entry.status.needs_update != needs_update;
        entry.status.needs_update = needs_update;
        changed
    }

    /// OAuth credential lifecycle for static-OAuth remote entries (spec.md
    /// §4.D).
    async fn sync_oauth_credential(&self, entry: &mut CatalogEntry) -> Result<bool> {
        let key = SecretContext::new(entry.oauth_credential_name(), entry.meta.name.clone());
        if entry.requires_static_oauth() && !entry.meta.is_deleting() {
            let configured = self.secrets.get(&key).await.is_ok();
            if entry.status.oauth_credential_configured != configured {
                entry.status.oauth_credential_configured = configured;
                return Ok(true);
            }
            Ok(false)
        } else {
            // Flag cleared or entry deleted: remove the credential.
            // NotFound on delete is always non-fatal (spec.md §4.D, §7).
            self.secrets.delete(&key).await?;
            let changed = entry.status.oauth_credential_configured;
            entry.status.oauth_credential_configured = false;
            Ok(changed)
        }
    }

    /// `status.userCount` over non-deleting, non-composite-component servers
    /// whose `spec.catalogEntryID == entry.name` (spec.md §4.D).
    pub fn compute_user_count(entry_name: &str, servers: &[ServerRecord]) -> u64 {
        use std::collections::HashSet;
        servers
            .iter()
            .filter(|s| {
                s.spec.catalog_entry_id.as_deref() == Some(entry_name)
                    && !s.meta.is_deleting()
                    && !s.spec.is_composite_component()
            })
            .map(|s| s.spec.user_id.clone())
            .collect::<HashSet<_>>()
            .len() as u64
    }

    /// Provision the credential under `mcp-oauth:<entry-name>` (used by
    /// operators configuring static OAuth out of band; exposed here so the
    /// `configure`/`deconfigure` HTTP verbs in spec.md §6 have somewhere to
    /// call into).
    pub async fn configure_oauth_credential(
        &self,
        entry: &CatalogEntry,
        client_id: String,
        client_secret: String,
    ) -> Result<()> {
        let key = SecretContext::new(entry.oauth_credential_name(), entry.meta.name.clone());
        let mut bundle = CredentialBundle::new();
        bundle.insert("CLIENT_ID".to_string(), client_id);
        bundle.insert("CLIENT_SECRET".to_string(), client_secret);
        self.secrets.put(&key, bundle).await
    }

    /// Run one reconcile pass over `entry`, given a way to resolve composite
    /// component sources and the current set of server records (for user
    /// count). Returns the updated entry if anything changed, `None` if the
    /// pass was a no-op (idempotence, spec.md §8).
    pub async fn reconcile<F>(
        &self,
        namespace: &str,
        name: &str,
        servers: &[ServerRecord],
        resolve_source: F,
    ) -> Result<Option<CatalogEntry>>
    where
        F: Fn(&str, &str) -> Option<ComponentSource>,
    {
        with_retry(self.retry_start, self.retry_attempts, || {
            let resolve_source = &resolve_source;
            async move {
                let mut entry = self.store.get(namespace, name).await?;

                let mut changed = self.sync_manifest_hash(&mut entry);
                changed |= self.prune_nested_composites(&mut entry);
                changed |= self.sync_composite_drift(&mut entry, resolve_source);
                changed |= self.sync_oauth_credential(&mut entry).await?;

                let user_count = Self::compute_user_count(&entry.meta.name, servers);
                if entry.status.user_count != user_count {
                    entry.status.user_count = user_count;
                    changed = true;
                }

                if !changed {
                    debug!(entry = %name, "catalog reconcile: no-op");
                    return Ok(None);
                }

                info!(entry = %name, "catalog reconcile: writing updated status");
                Ok(Some(self.store.update(entry).await?))
            }
        })
        .await
    }
}
