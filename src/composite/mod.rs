//! Composite aggregator (spec.md §4.G): for a composite server, reconcile
//! its component sub-servers/instances towards the manifest's
//! `compositeConfig.componentServers` list.
//!
//! Drifted components are shut down (sessions) before their sub-server
//! record is updated; a session opened in the window between those two
//! steps survives until the next reconcile notices it again. Accepted,
//! not closed with an atomic gate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{
    CompositeComponent, RemoteUrl, RuntimeConfig, ServerInstance, ServerInstanceSpec, ServerRecord,
    ServerSpec,
};
use crate::store::{with_retry, ListOptions, ObjectStore};
use crate::utils::hash_value;

/// Narrow seam into the session manager (spec.md §4.H): a drifted component
/// must have its live sessions torn down before the sub-server record is
/// updated underneath them.
#[async_trait]
pub trait SessionShutdown: Send + Sync {
    async fn shutdown_server(&self, namespace: &str, server_name: &str) -> Result<()>;
}

pub enum ReconcileOutcome {
    Updated,
    NoOp,
}

pub struct CompositeAggregator {
    servers: Arc<dyn ObjectStore<ServerRecord>>,
    instances: Arc<dyn ObjectStore<ServerInstance>>,
    sessions: Arc<dyn SessionShutdown>,
    retry_start: std::time::Duration,
    retry_attempts: u32,
}

impl CompositeAggregator {
    pub fn new(
        servers: Arc<dyn ObjectStore<ServerRecord>>,
        instances: Arc<dyn ObjectStore<ServerInstance>>,
        sessions: Arc<dyn SessionShutdown>,
        retry_start: std::time::Duration,
        retry_attempts: u32,
    ) -> Self {
        Self { servers, instances, sessions, retry_start, retry_attempts }
    }

    fn sub_server_name(composite_name: &str, catalog_entry_id: &str) -> String {
        format!("{composite_name}-component-{catalog_entry_id}")
    }

    fn instance_name(composite_name: &str, mcp_server_id: &str) -> String {
        format!("{composite_name}-component-{mcp_server_id}")
    }

    /// A remote component whose snapshot only carries a hostname constraint
    /// (not yet a concrete URL) needs a URL from the caller before it can
    /// serve traffic (spec.md §3 `needsURL`, §4.G).
    fn component_needs_url(component: &CompositeComponent) -> bool {
        matches!(
            &component.manifest.runtime,
            RuntimeConfig::Remote(cfg) if matches!(cfg.url, RemoteUrl::HostnameConstrained { .. })
        )
    }

    pub async fn reconcile(&self, namespace: &str, composite_name: &str) -> Result<ReconcileOutcome> {
        let composite = self.servers.get(namespace, composite_name).await?;
        let RuntimeConfig::Composite { components } = &composite.spec.manifest.runtime else {
            return Ok(ReconcileOutcome::NoOp);
        };
        let components = components.clone();

        let all_servers = self.servers.list(ListOptions { namespace: Some(namespace.to_string()), limit: None }).await?;
        let mut existing_sub_servers: HashMap<String, ServerRecord> = all_servers
            .into_iter()
            .filter(|s| s.spec.composite_name.as_deref() == Some(composite_name) && s.spec.catalog_entry_id.is_some())
            .map(|s| (s.spec.catalog_entry_id.clone().unwrap(), s))
            .collect();

        let all_instances = self.instances.list(ListOptions { namespace: Some(namespace.to_string()), limit: None }).await?;
        let mut existing_instances: HashMap<String, ServerInstance> = all_instances
            .into_iter()
            .filter(|i| i.spec.composite_name.as_deref() == Some(composite_name))
            .map(|i| (i.spec.mcp_server_name.clone(), i))
            .collect();

        let mut matched_servers = std::collections::HashSet::new();
        let mut matched_instances = std::collections::HashSet::new();
        let mut any_change = false;

        for component in &components {
            if component.is_multi_user_reference() {
                let referenced = component.mcp_server_id.clone().unwrap();
                matched_instances.insert(referenced.clone());
                if !existing_instances.contains_key(&referenced) {
                    let instance = ServerInstance::new(
                        namespace,
                        Self::instance_name(composite_name, &referenced),
                        ServerInstanceSpec {
                            user_id: composite.spec.user_id.clone(),
                            mcp_server_name: referenced.clone(),
                            composite_name: Some(composite_name.to_string()),
                        },
                    );
                    let created = self.instances.create(instance).await?;
                    existing_instances.insert(referenced, created);
                    any_change = true;
                }
            } else if component.is_catalog_reference() {
                let entry_id = component.catalog_entry_id.clone().unwrap();
                matched_servers.insert(entry_id.clone());
                match existing_sub_servers.get(&entry_id) {
                    None => {
                        let sub = ServerRecord::new(
                            namespace,
                            Self::sub_server_name(composite_name, &entry_id),
                            ServerSpec {
                                user_id: composite.spec.user_id.clone(),
                                catalog_entry_id: Some(entry_id.clone()),
                                catalog_id: None,
                                workspace_id: None,
                                composite_name: Some(composite_name.to_string()),
                                shared_within_mcp_catalog_name: None,
                                manifest: (*component.manifest).clone(),
                                needs_url: Self::component_needs_url(component),
                                previous_url: None,
                            },
                        );
                        let created = self.servers.create(sub).await?;
                        existing_sub_servers.insert(entry_id, created);
                        any_change = true;
                    }
                    Some(existing) => {
                        if hash_value(&existing.spec.manifest) != hash_value(&*component.manifest) {
                            self.sessions.shutdown_server(namespace, &existing.meta.name).await?;
                            let name = existing.meta.name.clone();
                            let new_manifest = (*component.manifest).clone();
                            let updated = with_retry(self.retry_start, self.retry_attempts, || {
                                let name = name.clone();
                                let new_manifest = new_manifest.clone();
                                async move {
                                    let mut current = self.servers.get(namespace, &name).await?;
                                    current.spec.manifest = new_manifest;
                                    self.servers.update(current).await
                                }
                            })
                            .await?;
                            existing_sub_servers.insert(entry_id, updated);
                            any_change = true;
                        }
                    }
                }
            }
        }

        for (entry_id, server) in existing_sub_servers.iter() {
            if !matched_servers.contains(entry_id) {
                self.servers.delete(namespace, &server.meta.name).await?;
                any_change = true;
            }
        }
        for (mcp_server_id, instance) in existing_instances.iter() {
            if !matched_instances.contains(mcp_server_id) {
                self.instances.delete(namespace, &instance.meta.name).await?;
                any_change = true;
            }
        }

        let desired_hash = hash_value(&composite.spec.manifest);
        if composite.status.observed_composite_manifest_hash.as_deref() != Some(desired_hash.as_str()) {
            let mut updated = composite;
            updated.status.observed_composite_manifest_hash = Some(desired_hash);
            self.servers.update(updated).await?;
            any_change = true;
        }

        if any_change {
            info!(composite = %composite_name, "composite reconcile: applied changes");
            Ok(ReconcileOutcome::Updated)
        } else {
            debug!(composite = %composite_name, "composite reconcile: no-op");
            Ok(ReconcileOutcome::NoOp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnvVar, Manifest, RemoteConfig};
    use crate::store::InMemoryStore;

    struct NoopSessions;
    #[async_trait]
    impl SessionShutdown for NoopSessions {
        async fn shutdown_server(&self, _namespace: &str, _server_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn uvx(pkg: &str) -> Manifest {
        Manifest { runtime: RuntimeConfig::Uvx { package: pkg.into(), command: None, args: vec![] }, env: vec![] }
    }

    fn component(entry_id: &str, manifest: Manifest) -> CompositeComponent {
        CompositeComponent {
            component_id: format!("c-{entry_id}"),
            catalog_entry_id: Some(entry_id.to_string()),
            mcp_server_id: None,
            tool_overrides: vec![],
            manifest: Box::new(manifest),
        }
    }

    fn aggregator() -> CompositeAggregator {
        CompositeAggregator::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryStore::new()),
            Arc::new(NoopSessions),
            std::time::Duration::from_millis(1),
            5,
        )
    }

    async fn composite_with(agg: &CompositeAggregator, components: Vec<CompositeComponent>) {
        agg.servers
            .create(ServerRecord::new(
                "ns",
                "comp1",
                ServerSpec {
                    user_id: "u1".into(),
                    catalog_entry_id: None,
                    catalog_id: None,
                    workspace_id: None,
                    composite_name: None,
                    shared_within_mcp_catalog_name: None,
                    manifest: Manifest { runtime: RuntimeConfig::Composite { components }, env: vec![] },
                    needs_url: false,
                    previous_url: None,
                },
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn creates_missing_catalog_component_and_sets_observed_hash() {
        let agg = aggregator();
        composite_with(&agg, vec![component("entry1", uvx("pkg@1.0"))]).await;

        let outcome = agg.reconcile("ns", "comp1").await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Updated));

        let subs = agg.servers.list(Default::default()).await.unwrap();
        assert!(subs.iter().any(|s| s.spec.composite_name.as_deref() == Some("comp1")));

        let comp = agg.servers.get("ns", "comp1").await.unwrap();
        assert!(comp.status.observed_composite_manifest_hash.is_some());

        // Idempotent: rerun with the same inputs is a no-op.
        match agg.reconcile("ns", "comp1").await.unwrap() {
            ReconcileOutcome::NoOp => {}
            ReconcileOutcome::Updated => panic!("expected stable fixpoint"),
        }
    }

    #[tokio::test]
    async fn drifted_component_shuts_down_sessions_then_updates() {
        let agg = aggregator();
        composite_with(&agg, vec![component("entry1", uvx("pkg@1.0"))]).await;
        agg.reconcile("ns", "comp1").await.unwrap();

        let mut comp = agg.servers.get("ns", "comp1").await.unwrap();
        comp.spec.manifest.runtime = RuntimeConfig::Composite { components: vec![component("entry1", uvx("pkg@2.0"))] };
        agg.servers.update(comp).await.unwrap();

        agg.reconcile("ns", "comp1").await.unwrap();
        let subs = agg.servers.list(Default::default()).await.unwrap();
        let sub = subs.iter().find(|s| s.spec.composite_name.as_deref() == Some("comp1")).unwrap();
        assert_eq!(sub.spec.manifest, uvx("pkg@2.0"));
    }

    #[tokio::test]
    async fn leftover_component_server_is_deleted() {
        let agg = aggregator();
        composite_with(&agg, vec![component("entry1", uvx("pkg@1.0"))]).await;
        agg.reconcile("ns", "comp1").await.unwrap();
        assert_eq!(agg.servers.list(Default::default()).await.unwrap().len(), 2);

        let mut comp = agg.servers.get("ns", "comp1").await.unwrap();
        comp.spec.manifest.runtime = RuntimeConfig::Composite { components: vec![] };
        agg.servers.update(comp).await.unwrap();

        agg.reconcile("ns", "comp1").await.unwrap();
        assert_eq!(agg.servers.list(Default::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hostname_constrained_remote_component_needs_url() {
        let agg = aggregator();
        let remote = Manifest {
            runtime: RuntimeConfig::Remote(RemoteConfig {
                url: RemoteUrl::HostnameConstrained { hostname: "api.example.com".into(), url_template: None },
                headers: vec![],
                static_oauth_required: false,
            }),
            env: vec![EnvVar { key: "A".into(), required: false, sensitive: false, value: None }],
        };
        composite_with(&agg, vec![component("entry1", remote)]).await;
        agg.reconcile("ns", "comp1").await.unwrap();

        let subs = agg.servers.list(Default::default()).await.unwrap();
        let sub = subs.iter().find(|s| s.spec.composite_name.as_deref() == Some("comp1")).unwrap();
        assert!(sub.spec.needs_url);
    }
}
