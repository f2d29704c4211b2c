//! Provider model catalog entry (`Model`) consulted by the LLM proxy's
//! model-resolution step — spec.md §4.J.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ObjectMeta;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub target_model: String,
    pub provider: String,
    pub active: bool,
    /// Tiebreak key for §4.J's "oldest-first" resolution when more than one
    /// `Model` shares a `targetModel`/`provider` pair.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub meta: ObjectMeta,
    pub spec: ModelSpec,
}

impl Model {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ModelSpec) -> Self {
        Self { meta: ObjectMeta::new(namespace, name), spec }
    }
}
