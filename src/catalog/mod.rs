//! Catalog registry (spec.md §4.D): stores and validates `E_cat` templates,
//! detects composite-component drift, prunes nested composites, and manages
//! the OAuth credential lifecycle for static-OAuth remote entries.

mod drift;
mod registry;

pub use drift::component_source_drifted;
pub use registry::{CatalogRegistry, ComponentSource};
