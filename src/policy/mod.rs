//! Access-policy evaluator (spec.md §4.B): `hasAccess(user, modelID) → bool`
//! and `allowedModels(user) → (set, isWildcard)`, plus the `E_map` pruning
//! side-handler.

mod evaluator;
mod pruning;

pub use evaluator::{AllowedModels, PolicyEvaluator, UserContext};
pub use pruning::prune_policy;
