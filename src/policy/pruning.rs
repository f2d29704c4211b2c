//! `E_map` pruning side-handler (spec.md §4.B): runs on every policy change
//! to keep `spec.manifest.models` canonical — duplicates removed, a wildcard
//! absorbs every concrete reference, and unresolvable references are
//! dropped. Returns `None` when the input was already canonical so the
//! caller can skip the write (spec.md §8 idempotence property).

use std::collections::HashSet;

use crate::model::{DefaultModelAlias, ModelRef};

pub fn prune_policy(
    models: &[ModelRef],
    aliases: &[DefaultModelAlias],
    known_models: &HashSet<String>,
) -> Option<Vec<ModelRef>> {
    if models.iter().any(ModelRef::is_wildcard) {
        let pruned = vec![ModelRef::Wildcard];
        return if models.len() == 1 && models[0] == ModelRef::Wildcard {
            None
        } else {
            Some(pruned)
        };
    }

    let mut seen = HashSet::new();
    let mut pruned = Vec::new();
    for model in models {
        let valid = match model {
            ModelRef::Wildcard => unreachable!("wildcard handled above"),
            ModelRef::Concrete { id } => known_models.contains(id),
            ModelRef::Alias { name } => aliases.iter().any(|a| a.spec.alias == *name),
        };
        if valid && seen.insert(model.clone()) {
            pruned.push(model.clone());
        }
    }

    if pruned == models {
        None
    } else {
        Some(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DmaSpec, ObjectMeta};

    fn alias(name: &str, model: &str) -> DefaultModelAlias {
        DefaultModelAlias {
            meta: ObjectMeta::new("ns", name),
            spec: DmaSpec { alias: name.into(), model_id: model.into() },
        }
    }

    #[test]
    fn duplicates_are_removed() {
        let known: HashSet<String> = ["m1".to_string()].into();
        let models = vec![
            ModelRef::Concrete { id: "m1".into() },
            ModelRef::Concrete { id: "m1".into() },
        ];
        let pruned = prune_policy(&models, &[], &known).unwrap();
        assert_eq!(pruned, vec![ModelRef::Concrete { id: "m1".into() }]);
    }

    #[test]
    fn wildcard_drops_concrete_refs() {
        let known: HashSet<String> = ["m1".to_string()].into();
        let models = vec![ModelRef::Concrete { id: "m1".into() }, ModelRef::Wildcard];
        let pruned = prune_policy(&models, &[], &known).unwrap();
        assert_eq!(pruned, vec![ModelRef::Wildcard]);
    }

    #[test]
    fn already_canonical_wildcard_is_no_op() {
        let known: HashSet<String> = HashSet::new();
        assert!(prune_policy(&[ModelRef::Wildcard], &[], &known).is_none());
    }

    #[test]
    fn unknown_alias_and_unknown_concrete_are_dropped() {
        let known: HashSet<String> = ["m1".to_string()].into();
        let aliases = vec![alias("llm", "m1")];
        let models = vec![
            ModelRef::Concrete { id: "m1".into() },
            ModelRef::Concrete { id: "ghost".into() },
            ModelRef::Alias { name: "llm".into() },
            ModelRef::Alias { name: "missing".into() },
        ];
        let pruned = prune_policy(&models, &aliases, &known).unwrap();
        assert_eq!(
            pruned,
            vec![ModelRef::Concrete { id: "m1".into() }, ModelRef::Alias { name: "llm".into() }]
        );
    }

    #[test]
    fn no_change_returns_none() {
        let known: HashSet<String> = ["m1".to_string()].into();
        let models = vec![ModelRef::Concrete { id: "m1".into() }];
        assert!(prune_policy(&models, &[], &known).is_none());
    }
}
