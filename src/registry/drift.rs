//! Field-granularity manifest drift (spec.md §4.E, "Drift algorithm (3)").
//!
//! Unlike `catalog::drift`'s whole-manifest hash comparison (used for
//! composite component snapshots), a server's drift against its catalog
//! entry is computed field-by-field so that irrelevant fields (e.g. a
//! catalog entry's `toolPreview`) never cause a false positive.

use crate::model::{Manifest, RuntimeConfig};
use crate::utils::unordered_eq;

/// `true` iff `server` has drifted from `catalog`.
pub fn manifest_drifted(server: &Manifest, catalog: &Manifest) -> bool {
    if server.runtime.kind() != catalog.runtime.kind() {
        return true;
    }
    if runtime_drifted(&server.runtime, &catalog.runtime) {
        return true;
    }
    let mut a = server.env.clone();
    let mut b = catalog.env.clone();
    a.sort();
    b.sort();
    !unordered_eq(&a, &b)
}

fn runtime_drifted(server: &RuntimeConfig, catalog: &RuntimeConfig) -> bool {
    match (server, catalog) {
        (
            RuntimeConfig::Uvx { package: p1, command: c1, args: a1 },
            RuntimeConfig::Uvx { package: p2, command: c2, args: a2 },
        ) => p1 != p2 || c1 != c2 || a1 != a2,
        (
            RuntimeConfig::Npx { package: p1, args: a1 },
            RuntimeConfig::Npx { package: p2, args: a2 },
        ) => p1 != p2 || a1 != a2,
        (
            RuntimeConfig::Containerized { image: i1, command: c1, args: a1, port: p1, path: pa1 },
            RuntimeConfig::Containerized { image: i2, command: c2, args: a2, port: p2, path: pa2 },
        ) => i1 != i2 || c1 != c2 || a1 != a2 || p1 != p2 || pa1 != pa2,
        (RuntimeConfig::Remote(r1), RuntimeConfig::Remote(r2)) => {
            remote_drifted(r1, r2)
        }
        (RuntimeConfig::Composite { components: c1 }, RuntimeConfig::Composite { components: c2 }) => {
            if c1.len() != c2.len() {
                return true;
            }
            c1.iter().any(|comp| {
                match c2.iter().find(|other| other.component_id == comp.component_id) {
                    None => true,
                    Some(other) => {
                        let overrides_differ = {
                            let mut a = comp.tool_overrides.clone();
                            let mut b = other.tool_overrides.clone();
                            a.sort();
                            b.sort();
                            a != b
                        };
                        overrides_differ || manifest_drifted(&comp.manifest, &other.manifest)
                    }
                }
            })
        }
        // Mismatched variants were already caught by the `kind()` check.
        _ => true,
    }
}

fn remote_drifted(server: &crate::model::RemoteConfig, catalog: &crate::model::RemoteConfig) -> bool {
    use crate::model::RemoteUrl;

    let url_drifted = match (&server.url, &catalog.url) {
        (RemoteUrl::Fixed { url: u1 }, RemoteUrl::Fixed { url: u2 }) => u1 != u2,
        (
            RemoteUrl::HostnameConstrained { hostname: h1, url_template: t1 },
            RemoteUrl::HostnameConstrained { hostname: h2, url_template: t2 },
        ) => h1 != h2 || t1 != t2,
        _ => true,
    };

    let mut h1 = server.headers.clone();
    let mut h2 = catalog.headers.clone();
    h1.sort();
    h2.sort();

    url_drifted || h1 != h2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnvVar, RemoteConfig, RemoteUrl};

    fn uvx(pkg: &str, env: Vec<EnvVar>) -> Manifest {
        Manifest { runtime: RuntimeConfig::Uvx { package: pkg.into(), command: None, args: vec![] }, env }
    }

    #[test]
    fn identical_manifests_do_not_drift() {
        let m = uvx("pkg@1.0", vec![]);
        assert!(!manifest_drifted(&m, &m));
    }

    #[test]
    fn package_bump_drifts() {
        assert!(manifest_drifted(&uvx("pkg@1.0", vec![]), &uvx("pkg@1.1", vec![])));
    }

    #[test]
    fn env_order_does_not_count_as_drift() {
        let e1 = EnvVar { key: "A".into(), required: true, sensitive: false, value: Some("1".into()) };
        let e2 = EnvVar { key: "B".into(), required: false, sensitive: false, value: Some("2".into()) };
        let server = uvx("pkg", vec![e1.clone(), e2.clone()]);
        let catalog = uvx("pkg", vec![e2, e1]);
        assert!(!manifest_drifted(&server, &catalog));
    }

    #[test]
    fn remote_header_multiset_ignores_order() {
        let server = Manifest {
            runtime: RuntimeConfig::Remote(RemoteConfig {
                url: RemoteUrl::Fixed { url: "https://x".into() },
                headers: vec![("A".into(), "1".into()), ("B".into(), "2".into())],
                static_oauth_required: false,
            }),
            env: vec![],
        };
        let catalog = Manifest {
            runtime: RuntimeConfig::Remote(RemoteConfig {
                url: RemoteUrl::Fixed { url: "https://x".into() },
                headers: vec![("B".into(), "2".into()), ("A".into(), "1".into())],
                static_oauth_required: false,
            }),
            env: vec![],
        };
        assert!(!manifest_drifted(&server, &catalog));
    }

    #[test]
    fn runtime_kind_mismatch_drifts() {
        let uvx_m = uvx("pkg", vec![]);
        let npx_m = Manifest {
            runtime: RuntimeConfig::Npx { package: "pkg".into(), args: vec![] },
            env: vec![],
        };
        assert!(manifest_drifted(&uvx_m, &npx_m));
    }
}
