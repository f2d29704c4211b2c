//! Access-control helper (spec.md §4.C): given a user and a scope, decide
//! whether they may read/invoke a named server or catalog entry.
//!
//! Rules evaluate in order — ownership, then a matching `E_acr`, then deny —
//! grounded on the teacher's `security::policy_engine` allow/deny-chain
//! shape.

use crate::model::{AccessControlRule, ResourceKind, ResourceRef};
use crate::policy::UserContext;

/// What is being checked: a catalog entry or an instantiated MCP server,
/// identified within a scope (spec.md §3 "Scope").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    CatalogEntry,
    McpServer,
}

impl From<TargetKind> for ResourceKind {
    fn from(kind: TargetKind) -> Self {
        match kind {
            TargetKind::CatalogEntry => ResourceKind::CatalogEntry,
            TargetKind::McpServer => ResourceKind::McpServer,
        }
    }
}

pub struct AccessControlHelper<'a> {
    rules: &'a [AccessControlRule],
}

impl<'a> AccessControlHelper<'a> {
    pub fn new(rules: &'a [AccessControlRule]) -> Self {
        Self { rules }
    }

    fn resource_matches(resource: &ResourceRef, kind: TargetKind, target_id: &str, scope: &str) -> bool {
        if resource.kind == ResourceKind::Selector {
            // A selector resource ("*" within a scope) matches anything in
            // that scope.
        } else if resource.kind != kind.into() || resource.id != target_id {
            return false;
        }
        resource.scope.as_deref().map(|s| s == scope).unwrap_or(true)
    }

    /// (1) ownership ⇒ allow; (2) a matching ACR ⇒ allow; (3) otherwise deny.
    pub fn can_access(
        &self,
        user: &UserContext,
        owner_user_id: Option<&str>,
        kind: TargetKind,
        target_id: &str,
        scope: &str,
    ) -> bool {
        if owner_user_id == Some(user.user_id.as_str()) {
            return true;
        }

        self.rules.iter().any(|rule| {
            rule.spec.subjects.iter().any(|s| s.matches(&user.user_id, &user.groups))
                && rule
                    .spec
                    .resources
                    .iter()
                    .any(|r| Self::resource_matches(r, kind, target_id, scope))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AcrSpec, ObjectMeta, Subject};

    fn rule(subjects: Vec<Subject>, resources: Vec<ResourceRef>) -> AccessControlRule {
        AccessControlRule { meta: ObjectMeta::new("ns", "r1"), spec: AcrSpec { subjects, resources } }
    }

    #[test]
    fn owner_always_allowed() {
        let helper = AccessControlHelper::new(&[]);
        let user = UserContext::new("u1", vec![]);
        assert!(helper.can_access(&user, Some("u1"), TargetKind::McpServer, "srv", "ws1"));
    }

    #[test]
    fn matching_acr_allows_non_owner() {
        let rules = vec![rule(
            vec![Subject::Group { id: "g1".into() }],
            vec![ResourceRef { kind: ResourceKind::McpServer, id: "srv".into(), scope: Some("ws1".into()) }],
        )];
        let helper = AccessControlHelper::new(&rules);
        let user = UserContext::new("u2", vec!["g1".to_string()]);
        assert!(helper.can_access(&user, Some("u1"), TargetKind::McpServer, "srv", "ws1"));
    }

    #[test]
    fn non_matching_scope_denies() {
        let rules = vec![rule(
            vec![Subject::Selector],
            vec![ResourceRef { kind: ResourceKind::McpServer, id: "srv".into(), scope: Some("ws1".into()) }],
        )];
        let helper = AccessControlHelper::new(&rules);
        let user = UserContext::new("u2", vec![]);
        assert!(!helper.can_access(&user, Some("u1"), TargetKind::McpServer, "srv", "ws2"));
    }

    #[test]
    fn default_denies() {
        let helper = AccessControlHelper::new(&[]);
        let user = UserContext::new("u2", vec![]);
        assert!(!helper.can_access(&user, Some("u1"), TargetKind::McpServer, "srv", "ws1"));
    }
}
