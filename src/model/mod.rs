//! Declarative data model (spec.md §3). Every record carries a `meta` (the
//! object-store's namespaced identity + optimistic-concurrency bookkeeping),
//! a user-writable `spec`, and a reconciler-writable `status` — spec and
//! status updates are logically independent (spec.md §3 preamble).

mod catalog;
mod llm;
mod manifest;
mod policy;
mod server;

pub use catalog::{CatalogEntry, CatalogEntrySpec, CatalogEntryStatus};
pub use llm::{Model, ModelSpec};
pub use manifest::{
    CompositeComponent, EnvVar, Manifest, RemoteConfig, RemoteUrl, RuntimeConfig, ToolPreview,
};
pub use policy::{
    AccessControlRule, AcrSpec, DefaultModelAlias, DmaSpec, ModelAccessPolicy, ModelRef,
    ResourceKind, ResourceRef, Subject,
};
pub use server::{
    DeploymentState, OAuthClient, OAuthClientSpec, ServerCondition, ServerInstance,
    ServerInstanceSpec, ServerRecord, ServerSpec, ServerStatus,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object-store bookkeeping shared by every record kind (spec.md §4.A).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Monotonically increasing; optimistic-concurrency writes that present
    /// a stale version fail with `ControlPlaneError::Conflict`.
    pub resource_version: u64,
    pub generation: u64,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            resource_version: 0,
            generation: 0,
            deletion_timestamp: None,
            finalizers: Vec::new(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }

    pub fn mark_for_deletion(&mut self) {
        if self.deletion_timestamp.is_none() {
            self.deletion_timestamp = Some(Utc::now());
        }
    }

    pub fn release_finalizer(&mut self, name: &str) {
        self.finalizers.retain(|f| f != name);
    }
}

/// A `(namespace, name)` key, used as the reconciler's dedup/enqueue key
/// (spec.md §4.K).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl From<&ObjectMeta> for ObjectKey {
    fn from(meta: &ObjectMeta) -> Self {
        ObjectKey::new(meta.namespace.clone(), meta.name.clone())
    }
}
