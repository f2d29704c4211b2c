//! Catalog entry (`E_cat`, spec.md §3/§4.D): a reusable MCP-server template.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Manifest, ObjectMeta, ToolPreview};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntrySpec {
    pub manifest: Manifest,
    pub tool_preview: Vec<ToolPreview>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CatalogEntryStatus {
    pub manifest_hash: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub user_count: u64,
    /// Set when a composite entry's component snapshots drift from their
    /// live sources (spec.md §4.D).
    pub needs_update: bool,
    /// Surfaced only for `remote` entries with `staticOAuthRequired`
    /// (spec.md §4.D "OAuth credential lifecycle").
    pub oauth_credential_configured: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub meta: ObjectMeta,
    pub spec: CatalogEntrySpec,
    pub status: CatalogEntryStatus,
}

impl CatalogEntry {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: CatalogEntrySpec) -> Self {
        Self { meta: ObjectMeta::new(namespace, name), spec, status: CatalogEntryStatus::default() }
    }

    /// Deterministic secret-store name for a static-OAuth-required remote
    /// entry's credential (spec.md §4.D: `mcp-oauth:<entry-name>`).
    pub fn oauth_credential_name(&self) -> String {
        format!("mcp-oauth:{}", self.meta.name)
    }

    pub fn requires_static_oauth(&self) -> bool {
        matches!(
            &self.spec.manifest.runtime,
            crate::model::RuntimeConfig::Remote(r) if r.static_oauth_required
        )
    }
}
