use crate::model::Manifest;
use crate::utils::hash_value;

/// A composite entry's component has drifted when its recorded snapshot's
/// manifest hash no longer matches the live source's manifest hash
/// (spec.md §4.D).
pub fn component_source_drifted(snapshot: &Manifest, source: &Manifest) -> bool {
    hash_value(snapshot) != hash_value(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuntimeConfig;

    #[test]
    fn identical_manifests_do_not_drift() {
        let m = Manifest {
            runtime: RuntimeConfig::Uvx { package: "p@1.0".into(), command: None, args: vec![] },
            env: vec![],
        };
        assert!(!component_source_drifted(&m, &m));
    }

    #[test]
    fn package_bump_drifts() {
        let snapshot = Manifest {
            runtime: RuntimeConfig::Uvx { package: "p@1.0".into(), command: None, args: vec![] },
            env: vec![],
        };
        let source = Manifest {
            runtime: RuntimeConfig::Uvx { package: "p@1.1".into(), command: None, args: vec![] },
            env: vec![],
        };
        assert!(component_source_drifted(&snapshot, &source));
    }
}
