//! `hasAccess` / `allowedModels` (spec.md §4.B).
//!
//! Policies are indexed three ways by subject — user, group, and wildcard —
//! the same indexing shape the teacher's `security::rbac` module uses for
//! role lookups, retargeted at model-access subjects instead of roles.

use std::collections::HashSet;

use crate::model::{DefaultModelAlias, ModelAccessPolicy, ModelRef, Subject};

/// The calling user's identity, as handed to the evaluator by the LLM proxy
/// (spec.md §4.J: "the user's `UID`, declared groups, and extra
/// `auth_provider_groups`").
#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub groups: Vec<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, groups: Vec<String>) -> Self {
        Self { user_id: user_id.into(), groups }
    }

    /// Global admins bypass policy evaluation entirely (spec.md §4.B:
    /// "Answer is `user ∈ admin ∪ owner` → true").
    fn is_admin(&self) -> bool {
        self.groups.iter().any(|g| g == "admin")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllowedModels {
    Wildcard,
    Set(HashSet<String>),
}

impl AllowedModels {
    pub fn contains(&self, model_id: &str) -> bool {
        match self {
            AllowedModels::Wildcard => true,
            AllowedModels::Set(set) => set.contains(model_id),
        }
    }
}

pub struct PolicyEvaluator<'a> {
    policies: &'a [ModelAccessPolicy],
    aliases: &'a [DefaultModelAlias],
    /// Known concrete model ids, used to reject syntactically-valid-but-
    /// unknown model references during accumulation.
    known_models: &'a HashSet<String>,
}

impl<'a> PolicyEvaluator<'a> {
    pub fn new(
        policies: &'a [ModelAccessPolicy],
        aliases: &'a [DefaultModelAlias],
        known_models: &'a HashSet<String>,
    ) -> Self {
        Self { policies, aliases, known_models }
    }

    fn resolve_alias(&self, name: &str) -> Option<String> {
        self.aliases.iter().find(|a| a.spec.alias == name).map(|a| a.spec.model_id.clone())
    }

    fn matching_policies(&self, user: &UserContext) -> Vec<&ModelAccessPolicy> {
        self.policies
            .iter()
            .filter(|p| p.subjects.iter().any(|s| s.matches(&user.user_id, &user.groups)))
            .collect()
    }

    /// `allowedModels(user) → (set, isWildcard)`.
    pub fn allowed_models(&self, user: &UserContext) -> AllowedModels {
        if user.is_admin() {
            return AllowedModels::Wildcard;
        }

        let mut concrete = HashSet::new();
        for policy in self.matching_policies(user) {
            for model in &policy.models {
                match model {
                    ModelRef::Wildcard => return AllowedModels::Wildcard,
                    ModelRef::Concrete { id } => {
                        if self.known_models.contains(id) {
                            concrete.insert(id.clone());
                        }
                    }
                    ModelRef::Alias { name } => {
                        if let Some(resolved) = self.resolve_alias(name) {
                            if self.known_models.contains(&resolved) {
                                concrete.insert(resolved);
                            }
                        }
                    }
                }
            }
        }
        AllowedModels::Set(concrete)
    }

    /// `hasAccess(user, modelID) → bool`.
    pub fn has_access(&self, user: &UserContext, model_id: &str) -> bool {
        self.allowed_models(user).contains(model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectMeta;

    fn policy(name: &str, subjects: Vec<Subject>, models: Vec<ModelRef>) -> ModelAccessPolicy {
        ModelAccessPolicy { meta: ObjectMeta::new("ns", name), subjects, models }
    }

    #[test]
    fn scenario_policy_access_from_spec_section_8() {
        let known: HashSet<String> = ["m1-foo".to_string(), "m1-bar".to_string()].into();
        let policies = vec![policy(
            "p1",
            vec![Subject::Group { id: "g1".into() }],
            vec![ModelRef::Concrete { id: "m1-foo".into() }],
        )];
        let aliases = vec![];
        let eval = PolicyEvaluator::new(&policies, &aliases, &known);

        let u1 = UserContext::new("u1", vec!["g1".to_string()]);
        assert!(eval.has_access(&u1, "m1-foo"));
        assert!(!eval.has_access(&u1, "m1-bar"));
    }

    #[test]
    fn wildcard_policy_grants_every_model() {
        let known: HashSet<String> = ["m1-foo".to_string()].into();
        let policies = vec![
            policy("p1", vec![Subject::Group { id: "g1".into() }], vec![ModelRef::Concrete { id: "m1-foo".into() }]),
            policy("p2", vec![Subject::Selector], vec![ModelRef::Wildcard]),
        ];
        let aliases = vec![];
        let eval = PolicyEvaluator::new(&policies, &aliases, &known);
        let u1 = UserContext::new("u1", vec!["g1".to_string()]);
        assert_eq!(eval.allowed_models(&u1), AllowedModels::Wildcard);
        assert!(eval.has_access(&u1, "anything"));
    }

    #[test]
    fn admin_bypasses_policy_entirely() {
        let known: HashSet<String> = HashSet::new();
        let policies = vec![];
        let aliases = vec![];
        let eval = PolicyEvaluator::new(&policies, &aliases, &known);
        let admin = UserContext::new("root", vec!["admin".to_string()]);
        assert!(eval.has_access(&admin, "anything"));
    }

    #[test]
    fn unknown_alias_is_skipped_not_fatal() {
        let known: HashSet<String> = ["m1-foo".to_string()].into();
        let policies = vec![policy(
            "p1",
            vec![Subject::Selector],
            vec![ModelRef::Alias { name: "missing".into() }],
        )];
        let aliases = vec![];
        let eval = PolicyEvaluator::new(&policies, &aliases, &known);
        let u1 = UserContext::new("u1", vec![]);
        assert_eq!(eval.allowed_models(&u1), AllowedModels::Set(HashSet::new()));
    }
}
