//! Access-control rules (`E_acr`), model-access policies (`E_map`), and
//! default-model aliases (`E_dma`) — spec.md §3, §4.B, §4.C.

use serde::{Deserialize, Serialize};

use super::ObjectMeta;

/// A policy/rule subject. `Selector` is the wildcard `"*"` subject that
/// matches every user (spec.md §4.B).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    User { id: String },
    Group { id: String },
    Selector,
}

impl Subject {
    /// Selector semantics shared by §4.B and §4.C: does this subject match
    /// `user_id` given their `groups`?
    pub fn matches(&self, user_id: &str, groups: &[String]) -> bool {
        match self {
            Subject::Selector => true,
            Subject::User { id } => id == user_id,
            Subject::Group { id } => groups.iter().any(|g| g == id),
        }
    }
}

/// The kind of resource an ACR resource reference points at (spec.md §3
/// `E_acr.resources[]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    CatalogEntry,
    McpServer,
    Selector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcrSpec {
    pub subjects: Vec<Subject>,
    pub resources: Vec<ResourceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessControlRule {
    pub meta: ObjectMeta,
    pub spec: AcrSpec,
}

/// A model reference: a concrete provider model id, the wildcard `*`, or an
/// alias reference `obot://<alias>` (spec.md §4.B).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelRef {
    Concrete { id: String },
    Wildcard,
    Alias { name: String },
}

impl ModelRef {
    /// Parse the wire forms `"*"`, `"obot://<alias>"`, and bare concrete ids.
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            ModelRef::Wildcard
        } else if let Some(alias) = raw.strip_prefix("obot://") {
            ModelRef::Alias { name: alias.to_string() }
        } else {
            ModelRef::Concrete { id: raw.to_string() }
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, ModelRef::Wildcard)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAccessPolicy {
    pub meta: ObjectMeta,
    pub subjects: Vec<Subject>,
    pub models: Vec<ModelRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmaSpec {
    pub alias: String,
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultModelAlias {
    pub meta: ObjectMeta,
    pub spec: DmaSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_parses_wire_forms() {
        assert_eq!(ModelRef::parse("*"), ModelRef::Wildcard);
        assert_eq!(ModelRef::parse("obot://llm"), ModelRef::Alias { name: "llm".into() });
        assert_eq!(ModelRef::parse("m1-foo"), ModelRef::Concrete { id: "m1-foo".into() });
    }

    #[test]
    fn subject_selector_matches_anyone() {
        assert!(Subject::Selector.matches("u1", &[]));
        assert!(Subject::Group { id: "g1".into() }.matches("u1", &["g1".to_string()]));
        assert!(!Subject::Group { id: "g1".into() }.matches("u1", &["g2".to_string()]));
    }
}
