use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::{ControlPlaneError, Result};
use crate::model::ObjectMeta;

/// Implemented by every record kind so the store can key and version them
/// without each caller threading `ObjectMeta` through by hand.
pub trait HasMeta {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_has_meta {
    ($ty:ty) => {
        impl HasMeta for $ty {
            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }
    };
}

impl_has_meta!(crate::model::CatalogEntry);
impl_has_meta!(crate::model::ServerRecord);
impl_has_meta!(crate::model::ServerInstance);
impl_has_meta!(crate::model::OAuthClient);
impl_has_meta!(crate::model::AccessControlRule);
impl_has_meta!(crate::model::ModelAccessPolicy);
impl_has_meta!(crate::model::DefaultModelAlias);
impl_has_meta!(crate::model::Model);

/// `ADDED|MODIFIED|DELETED` as in spec.md §4.A.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub limit: Option<usize>,
}

/// Narrow façade a caller depends on instead of the concrete store, so that
/// the production store (the declarative storage layer named in spec.md §6)
/// can be swapped in behind this trait without touching any handler.
#[async_trait::async_trait]
pub trait ObjectStore<T>: Send + Sync
where
    T: HasMeta + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<T>;
    async fn list(&self, opts: ListOptions) -> Result<Vec<T>>;
    async fn create(&self, value: T) -> Result<T>;
    async fn update(&self, value: T) -> Result<T>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}

/// An in-process, watch-capable implementation suitable for the reconciler
/// runtime and for tests. Keyed by `(namespace, name)`.
pub struct InMemoryStore<T> {
    records: Arc<DashMap<(String, String), T>>,
    watch_tx: broadcast::Sender<WatchEvent<T>>,
}

impl<T> Default for InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        let (watch_tx, _rx) = broadcast::channel(1024);
        Self { records: Arc::new(DashMap::new()), watch_tx }
    }
}

impl<T> InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl<T> ObjectStore<T> for InMemoryStore<T>
where
    T: HasMeta + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<T> {
        self.records
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ControlPlaneError::not_found(format!("{namespace}/{name}")))
    }

    async fn list(&self, opts: ListOptions) -> Result<Vec<T>> {
        let mut items: Vec<T> = self
            .records
            .iter()
            .filter(|entry| {
                opts.namespace
                    .as_ref()
                    .map(|ns| entry.key().0 == *ns)
                    .unwrap_or(true)
            })
            .map(|entry| entry.value().clone())
            .collect();
        if let Some(limit) = opts.limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn create(&self, mut value: T) -> Result<T> {
        let key = (value.meta().namespace.clone(), value.meta().name.clone());
        if self.records.contains_key(&key) {
            return Err(ControlPlaneError::conflict(format!(
                "{}/{} already exists",
                key.0, key.1
            )));
        }
        value.meta_mut().resource_version = 1;
        self.records.insert(key, value.clone());
        let _ = self.watch_tx.send(WatchEvent::Added(value.clone()));
        Ok(value)
    }

    async fn update(&self, mut value: T) -> Result<T> {
        let key = (value.meta().namespace.clone(), value.meta().name.clone());
        let mut entry = self
            .records
            .get_mut(&key)
            .ok_or_else(|| ControlPlaneError::not_found(format!("{}/{}", key.0, key.1)))?;

        if entry.meta().resource_version != value.meta().resource_version {
            return Err(ControlPlaneError::conflict(format!(
                "stale resourceVersion for {}/{}",
                key.0, key.1
            )));
        }
        value.meta_mut().resource_version += 1;
        *entry = value.clone();
        drop(entry);
        let _ = self.watch_tx.send(WatchEvent::Modified(value.clone()));
        Ok(value)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        match self.records.remove(&key) {
            Some((_, value)) => {
                let _ = self.watch_tx.send(WatchEvent::Deleted(value));
                Ok(())
            }
            None => Err(ControlPlaneError::not_found(format!("{namespace}/{name}"))),
        }
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watch_tx.subscribe()
    }
}

/// Secondary-index helper: group records by a field selector the way the
/// adapter's fielded indices do (spec.md §4.A "List calls support fielded
/// secondary indices").
pub fn index_by<T, K, F>(items: &[T], key_fn: F) -> HashMap<K, Vec<T>>
where
    T: Clone,
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> Option<K>,
{
    let mut out: HashMap<K, Vec<T>> = HashMap::new();
    for item in items {
        if let Some(key) = key_fn(item) {
            out.entry(key).or_default().push(item.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CatalogEntry, CatalogEntrySpec, Manifest, RuntimeConfig};

    fn entry(name: &str) -> CatalogEntry {
        CatalogEntry::new(
            "ns",
            name,
            CatalogEntrySpec {
                manifest: Manifest {
                    runtime: RuntimeConfig::Uvx { package: "p".into(), command: None, args: vec![] },
                    env: vec![],
                },
                tool_preview: vec![],
            },
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store: InMemoryStore<CatalogEntry> = InMemoryStore::new();
        let created = store.create(entry("e1")).await.unwrap();
        assert_eq!(created.meta.resource_version, 1);
        let fetched = store.get("ns", "e1").await.unwrap();
        assert_eq!(fetched.meta.name, "e1");
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store: InMemoryStore<CatalogEntry> = InMemoryStore::new();
        let created = store.create(entry("e1")).await.unwrap();

        // Simulate a second writer reading the same version...
        let mut stale = created.clone();
        store.update(created.clone()).await.unwrap(); // bumps to version 2

        stale.spec.tool_preview.push(crate::model::ToolPreview {
            name: "t".into(),
            description: "d".into(),
        });
        let err = store.update(stale).await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::Conflict { .. }));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store: InMemoryStore<CatalogEntry> = InMemoryStore::new();
        let err = store.delete("ns", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
