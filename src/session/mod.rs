//! Session manager (spec.md §4.H): the sole authority on "there is at most
//! one warm session per (user, server)", backed by a process-wide map with
//! per-entry locking so one user's cold launch never blocks another's warm
//! call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::ServerRecord;
use crate::store::ObjectStore;

/// Deployment-side half of launching/retiring a backend (spec.md §4.F).
/// Kept narrow so the session manager doesn't depend on `kube::Client`
/// directly — `deploy::DeploymentBackend` implements this.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn deploy(&self, namespace: &str, server: &ServerRecord) -> Result<String>;
    async fn health_check(&self, url: &str) -> Result<()>;
    async fn shutdown(&self, namespace: &str, server_name: &str) -> Result<()>;
}

/// The MCP wire operations a live session answers (spec.md §4.H operation
/// list). Implemented by the gateway's upstream client.
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn initialize(&self, url: &str) -> Result<Value>;
    async fn list_tools(&self, url: &str) -> Result<Value>;
    async fn list_resources(&self, url: &str) -> Result<Value>;
    async fn list_prompts(&self, url: &str) -> Result<Value>;
    async fn read_resource(&self, url: &str, uri: &str) -> Result<Value>;
    async fn get_prompt(&self, url: &str, name: &str, args: &Value) -> Result<Value>;
}

#[derive(Debug, Clone)]
struct Session {
    url: String,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    capabilities: Option<Value>,
    refcount: u32,
}

type SessionKey = (String, String);

pub struct SessionManager {
    sessions: DashMap<SessionKey, Arc<Mutex<Option<Session>>>>,
    backend: Arc<dyn SessionBackend>,
    client: Arc<dyn McpClient>,
    servers: Arc<dyn ObjectStore<ServerRecord>>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        client: Arc<dyn McpClient>,
        servers: Arc<dyn ObjectStore<ServerRecord>>,
        idle_timeout: Duration,
    ) -> Self {
        Self { sessions: DashMap::new(), backend, client, servers, idle_timeout }
    }

    fn entry(&self, user_id: &str, server_name: &str) -> Arc<Mutex<Option<Session>>> {
        self.sessions
            .entry((user_id.to_string(), server_name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// `LaunchServer`: return a cached, still-healthy session's URL, or
    /// deploy and cache a fresh one.
    pub async fn launch_server(&self, namespace: &str, user_id: &str, server_name: &str) -> Result<String> {
        let entry = self.entry(user_id, server_name);
        let mut guard = entry.lock().await;

        if let Some(session) = guard.as_mut() {
            if self.backend.health_check(&session.url).await.is_ok() {
                session.last_used_at = Utc::now();
                return Ok(session.url.clone());
            }
            debug!(user = %user_id, server = %server_name, "cached session failed health check, relaunching");
        }

        let server = self.servers.get(namespace, server_name).await?;
        let url = self.backend.deploy(namespace, &server).await?;
        self.backend.health_check(&url).await?;
        let now = Utc::now();
        *guard = Some(Session { url: url.clone(), created_at: now, last_used_at: now, capabilities: None, refcount: 0 });
        info!(user = %user_id, server = %server_name, "session launched");
        Ok(url)
    }

    /// Runs `f` against a live session's URL with `refcount` held above zero
    /// for the duration, so `evict_idle` can't tear the session down out from
    /// under an in-flight call.
    async fn with_session<F, Fut, R>(&self, namespace: &str, user_id: &str, server_name: &str, f: F) -> Result<R>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<R>>,
    {
        let url = self.launch_server(namespace, user_id, server_name).await?;
        let entry = self.entry(user_id, server_name);
        if let Some(session) = entry.lock().await.as_mut() {
            session.refcount += 1;
        }
        let result = f(url).await;
        if let Some(session) = entry.lock().await.as_mut() {
            session.refcount = session.refcount.saturating_sub(1);
        }
        result
    }

    pub async fn list_tools(&self, namespace: &str, user_id: &str, server_name: &str) -> Result<Value> {
        self.with_session(namespace, user_id, server_name, |url| async move { self.client.list_tools(&url).await })
            .await
    }

    pub async fn list_resources(&self, namespace: &str, user_id: &str, server_name: &str) -> Result<Value> {
        self.with_session(namespace, user_id, server_name, |url| async move { self.client.list_resources(&url).await })
            .await
    }

    pub async fn list_prompts(&self, namespace: &str, user_id: &str, server_name: &str) -> Result<Value> {
        self.with_session(namespace, user_id, server_name, |url| async move { self.client.list_prompts(&url).await })
            .await
    }

    pub async fn read_resource(&self, namespace: &str, user_id: &str, server_name: &str, uri: &str) -> Result<Value> {
        self.with_session(namespace, user_id, server_name, |url| async move { self.client.read_resource(&url, uri).await })
            .await
    }

    pub async fn get_prompt(
        &self,
        namespace: &str,
        user_id: &str,
        server_name: &str,
        name: &str,
        args: &Value,
    ) -> Result<Value> {
        self.with_session(namespace, user_id, server_name, |url| async move {
            self.client.get_prompt(&url, name, args).await
        })
        .await
    }

    /// Cached initial handshake result, computed once per session.
    pub async fn server_capabilities(&self, namespace: &str, user_id: &str, server_name: &str) -> Result<Value> {
        let entry = self.entry(user_id, server_name);
        let url = self.launch_server(namespace, user_id, server_name).await?;
        let mut guard = entry.lock().await;
        let session = guard.as_mut().expect("launch_server populates the entry");
        if let Some(caps) = &session.capabilities {
            return Ok(caps.clone());
        }
        let caps = self.client.initialize(&url).await?;
        session.capabilities = Some(caps.clone());
        Ok(caps)
    }

    /// `ShutdownServer`: evict the cache entry and tear down the orchestrator
    /// objects (spec.md §4.F) regardless of whether a session was cached.
    pub async fn shutdown_server(&self, namespace: &str, user_id: &str, server_name: &str) -> Result<()> {
        self.sessions.remove(&(user_id.to_string(), server_name.to_string()));
        self.backend.shutdown(namespace, server_name).await
    }

    /// Tear down every cached session for `server_name`, across all users.
    /// Used when a composite component drifts and must be replaced out from
    /// under whoever currently holds it (spec.md §4.G).
    pub async fn shutdown_server_for_all_users(&self, namespace: &str, server_name: &str) -> Result<()> {
        let stale_keys: Vec<SessionKey> =
            self.sessions.iter().map(|entry| entry.key().clone()).filter(|(_, name)| name == server_name).collect();
        for key in stale_keys {
            self.sessions.remove(&key);
        }
        self.backend.shutdown(namespace, server_name).await
    }

    /// Close sessions idle longer than the configured threshold. Intended to
    /// be driven periodically by the reconciler runtime (spec.md §4.K).
    pub async fn evict_idle(&self, namespace: &str) -> Vec<String> {
        let now = Utc::now();
        let mut evicted = Vec::new();
        let stale_keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let key = entry.key().clone();
                entry.value().try_lock().ok().and_then(|session| {
                    session.as_ref().and_then(|s| {
                        let idle = now.signed_duration_since(s.last_used_at).to_std().unwrap_or_default();
                        (s.refcount == 0 && idle >= self.idle_timeout).then_some(())
                    })
                })?;
                Some(key)
            })
            .collect();

        for (user_id, server_name) in stale_keys {
            if self.backend.shutdown(namespace, &server_name).await.is_ok() {
                self.sessions.remove(&(user_id.clone(), server_name.clone()));
                evicted.push(server_name);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlPlaneError;
    use crate::model::{EnvVar, Manifest, RuntimeConfig, ServerSpec};
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeBackend {
        deploy_calls: AtomicU32,
        healthy: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl SessionBackend for FakeBackend {
        async fn deploy(&self, _namespace: &str, server: &ServerRecord) -> Result<String> {
            self.deploy_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("http://{}.internal", server.meta.name))
        }
        async fn health_check(&self, _url: &str) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ControlPlaneError::HealthCheckFailed { message: "down".into() })
            }
        }
        async fn shutdown(&self, _namespace: &str, _server_name: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FakeClient;
    #[async_trait]
    impl McpClient for FakeClient {
        async fn initialize(&self, _url: &str) -> Result<Value> {
            Ok(serde_json::json!({"tools": true}))
        }
        async fn list_tools(&self, _url: &str) -> Result<Value> {
            Ok(serde_json::json!({"tools": []}))
        }
        async fn list_resources(&self, _url: &str) -> Result<Value> {
            Ok(serde_json::json!({"resources": []}))
        }
        async fn list_prompts(&self, _url: &str) -> Result<Value> {
            Ok(serde_json::json!({"prompts": []}))
        }
        async fn read_resource(&self, _url: &str, _uri: &str) -> Result<Value> {
            Ok(serde_json::json!({}))
        }
        async fn get_prompt(&self, _url: &str, _name: &str, _args: &Value) -> Result<Value> {
            Ok(serde_json::json!({}))
        }
    }

    fn manager(backend: Arc<FakeBackend>) -> SessionManager {
        let servers: Arc<dyn ObjectStore<ServerRecord>> = Arc::new(InMemoryStore::new());
        SessionManager::new(backend, Arc::new(FakeClient), servers, Duration::from_secs(300))
    }

    async fn seed_server(servers: &Arc<dyn ObjectStore<ServerRecord>>) {
        servers
            .create(ServerRecord::new(
                "ns",
                "srv1",
                ServerSpec {
                    user_id: "u1".into(),
                    catalog_entry_id: None,
                    catalog_id: None,
                    workspace_id: None,
                    composite_name: None,
                    shared_within_mcp_catalog_name: None,
                    manifest: Manifest {
                        runtime: RuntimeConfig::Uvx { package: "p".into(), command: None, args: vec![] },
                        env: vec![EnvVar { key: "A".into(), required: false, sensitive: false, value: None }],
                    },
                    needs_url: false,
                    previous_url: None,
                },
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_launch_reuses_healthy_session() {
        let backend = Arc::new(FakeBackend { deploy_calls: AtomicU32::new(0), healthy: true.into() });
        let mgr = manager(backend.clone());
        seed_server(&mgr.servers).await;

        let url1 = mgr.launch_server("ns", "u1", "srv1").await.unwrap();
        let url2 = mgr.launch_server("ns", "u1", "srv1").await.unwrap();
        assert_eq!(url1, url2);
        assert_eq!(backend.deploy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhealthy_cached_session_is_relaunched() {
        let backend = Arc::new(FakeBackend { deploy_calls: AtomicU32::new(0), healthy: true.into() });
        let mgr = manager(backend.clone());
        seed_server(&mgr.servers).await;

        mgr.launch_server("ns", "u1", "srv1").await.unwrap();
        backend.healthy.store(false, Ordering::SeqCst);
        // health_check fails now, but deploy() always succeeds regardless of
        // `healthy`, so relaunch succeeds and redeploys once more.
        mgr.launch_server("ns", "u1", "srv1").await.unwrap();
        assert_eq!(backend.deploy_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn capabilities_are_cached_after_first_call() {
        let backend = Arc::new(FakeBackend { deploy_calls: AtomicU32::new(0), healthy: true.into() });
        let mgr = manager(backend);
        seed_server(&mgr.servers).await;

        let caps1 = mgr.server_capabilities("ns", "u1", "srv1").await.unwrap();
        let caps2 = mgr.server_capabilities("ns", "u1", "srv1").await.unwrap();
        assert_eq!(caps1, caps2);
    }

    #[tokio::test]
    async fn shutdown_evicts_cache_entry() {
        let backend = Arc::new(FakeBackend { deploy_calls: AtomicU32::new(0), healthy: true.into() });
        let mgr = manager(backend.clone());
        seed_server(&mgr.servers).await;

        mgr.launch_server("ns", "u1", "srv1").await.unwrap();
        mgr.shutdown_server("ns", "u1", "srv1").await.unwrap();
        assert!(mgr.sessions.is_empty());

        mgr.launch_server("ns", "u1", "srv1").await.unwrap();
        assert_eq!(backend.deploy_calls.load(Ordering::SeqCst), 2);
    }
}
