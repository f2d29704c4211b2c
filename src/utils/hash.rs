//! Content hashing for manifest/config drift detection.
//!
//! Every place in the spec that says "hash(x)" — `status.manifestHash`,
//! `status.k8sSettingsHash`, `status.observedCompositeManifestHash`, the
//! `obot-revision` deployment annotation — goes through [`hash_value`] so
//! that hash semantics stay consistent across the whole control plane.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash any serializable value to a stable hex digest.
///
/// Uses `serde_json::to_value` first so that struct field order never
/// affects the hash (only the resulting JSON value's content does), then
/// serializes that value through `serde_json`'s canonical map ordering.
pub fn hash_value<T: Serialize>(value: &T) -> String {
    let json = serde_json::to_value(value).expect("value must serialize to JSON");
    let canonical = serde_json::to_string(&json).expect("JSON value must serialize to string");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two string slices as unordered multisets (used for `env[]` and
/// remote `headers` drift comparisons, which the spec defines as unordered).
pub fn unordered_eq<T: Ord + Clone>(a: &[T], b: &[T]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted = a.to_vec();
    let mut b_sorted = b.to_vec();
    a_sorted.sort();
    b_sorted.sort();
    a_sorted == b_sorted
}

/// Hash of an arbitrary secret string, used for `AUDIT_LOG_TOKEN` and OAuth
/// client-secret integrity checks (spec.md §4.E.6).
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_stable_across_field_order() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn unordered_eq_ignores_order() {
        assert!(unordered_eq(&["a", "b"], &["b", "a"]));
        assert!(!unordered_eq(&["a", "b"], &["a", "c"]));
        assert!(!unordered_eq(&["a"], &["a", "a"]));
    }
}
