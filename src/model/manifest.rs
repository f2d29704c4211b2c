//! The runtime-tagged manifest shell shared by catalog entries and server
//! records (spec.md §3, Design Notes §9 "dynamic dispatch over runtimes").
//!
//! Modeled as a tagged variant rather than one struct with five sets of
//! all-optional fields: each runtime owns only the payload it needs, and
//! drift/render/validation dispatch on the tag (see `registry::drift` and
//! `deploy::render`).

use serde::{Deserialize, Serialize};

/// A declared environment variable (spec.md §3 `env[]`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub required: bool,
    pub sensitive: bool,
    pub value: Option<String>,
}

/// Precomputed tool list for catalog-entry display (spec.md §3 `toolPreview[]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPreview {
    pub name: String,
    pub description: String,
}

/// A `remote` runtime's URL: either fixed, or constrained to a hostname with
/// an optional templated path (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteUrl {
    Fixed { url: String },
    HostnameConstrained { hostname: String, url_template: Option<String> },
}

impl RemoteUrl {
    /// Whether `candidate` satisfies this constraint — used to decide
    /// `needsURL` (spec.md §3 `E_srv.needsURL`, §4.G composite component
    /// materialization).
    pub fn is_satisfied_by(&self, candidate: &str) -> bool {
        match self {
            RemoteUrl::Fixed { url } => url == candidate,
            RemoteUrl::HostnameConstrained { hostname, .. } => {
                url::Url::parse(candidate)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h == hostname))
                    .unwrap_or(false)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: RemoteUrl,
    pub headers: Vec<(String, String)>,
    pub static_oauth_required: bool,
}

/// A single component reference inside a `composite` runtime (spec.md §3,
/// §4.G). Exactly one of `catalog_entry_id` / `mcp_server_id` is set,
/// mirroring the catalog-entry-vs-multi-user-server distinction in §4.G.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeComponent {
    pub component_id: String,
    pub catalog_entry_id: Option<String>,
    pub mcp_server_id: Option<String>,
    pub tool_overrides: Vec<String>,
    /// The component's own manifest snapshot — for a catalog-entry
    /// component this is the entry's manifest at the time the composite was
    /// last reconciled; drift is detected by comparing this snapshot's hash
    /// against the live source (spec.md §4.D).
    pub manifest: Box<Manifest>,
}

impl CompositeComponent {
    pub fn is_multi_user_reference(&self) -> bool {
        self.mcp_server_id.is_some()
    }

    pub fn is_catalog_reference(&self) -> bool {
        self.catalog_entry_id.is_some()
    }

    /// Invariant 2 / nested-composite pruning: a component can never itself
    /// be a composite.
    pub fn is_nested_composite(&self) -> bool {
        matches!(self.manifest.runtime, RuntimeConfig::Composite { .. })
    }
}

/// The five supported MCP-server runtimes (spec.md §3 `runtime ∈ {...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "runtime", rename_all = "snake_case")]
pub enum RuntimeConfig {
    Uvx { package: String, command: Option<String>, args: Vec<String> },
    Npx { package: String, args: Vec<String> },
    Containerized {
        image: String,
        command: Option<String>,
        args: Vec<String>,
        port: u16,
        path: Option<String>,
    },
    Remote(RemoteConfig),
    Composite { components: Vec<CompositeComponent> },
}

impl RuntimeConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeConfig::Uvx { .. } => "uvx",
            RuntimeConfig::Npx { .. } => "npx",
            RuntimeConfig::Containerized { .. } => "containerized",
            RuntimeConfig::Remote(_) => "remote",
            RuntimeConfig::Composite { .. } => "composite",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, RuntimeConfig::Composite { .. })
    }

    /// Runtime-specific validation (Design Notes §9: "image required for
    /// containerized; URL required for remote unless a fixed URL is
    /// provided by the catalog; etc.").
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RuntimeConfig::Uvx { package, .. } if package.is_empty() => {
                Err("uvx runtime requires a package".to_string())
            }
            RuntimeConfig::Npx { package, .. } if package.is_empty() => {
                Err("npx runtime requires a package".to_string())
            }
            RuntimeConfig::Containerized { image, port, .. } => {
                if image.is_empty() {
                    Err("containerized runtime requires an image".to_string())
                } else if *port == 0 {
                    Err("containerized runtime requires a nonzero port".to_string())
                } else {
                    Ok(())
                }
            }
            RuntimeConfig::Composite { components } => {
                if components.iter().any(CompositeComponent::is_nested_composite) {
                    Err("composite runtime cannot nest a composite component".to_string())
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// The manifest shell shared by `E_cat.spec` and `E_srv.spec` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub runtime: RuntimeConfig,
    pub env: Vec<EnvVar>,
}
