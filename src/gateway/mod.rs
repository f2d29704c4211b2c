//! Connection router / reverse proxy (spec.md §4.I).
//!
//! Authentication itself (step 1: challenge an unauthenticated caller with
//! `WWW-Authenticate`) lives in the `auth` middleware seam ahead of this
//! router — by the time `GatewayRouter::dispatch` runs, the caller is
//! already a [`UserContext`](crate::policy::UserContext). [`discovery_challenge`]
//! is exposed here anyway since the `web` layer needs its exact string for
//! the 401 response.

use std::sync::Arc;

use crate::error::{ControlPlaneError, Result};
use crate::model::{ServerInstance, ServerRecord};
use crate::secrets::{CredentialBundle, SecretContext, SecretStore};
use crate::session::SessionManager;
use crate::store::{ListOptions, ObjectStore};

pub struct GatewayRouter {
    servers: Arc<dyn ObjectStore<ServerRecord>>,
    instances: Arc<dyn ObjectStore<ServerInstance>>,
    secrets: Arc<dyn SecretStore>,
    sessions: Arc<SessionManager>,
}

impl GatewayRouter {
    pub fn new(
        servers: Arc<dyn ObjectStore<ServerRecord>>,
        instances: Arc<dyn ObjectStore<ServerInstance>>,
        secrets: Arc<dyn SecretStore>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self { servers, instances, secrets, sessions }
    }

    /// `WWW-Authenticate` value for an unauthenticated `/mcp-connect/...`
    /// request (spec.md §4.I step 1).
    pub fn discovery_challenge(origin: &str, path: &str) -> String {
        format!(r#"Bearer resource_metadata="{origin}/.well-known/oauth-protected-resource{path}""#)
    }

    /// Step 2: resolve `(server, serverConfig)` from the path.
    pub async fn resolve_target(&self, namespace: &str, server_id: &str) -> Result<ServerRecord> {
        self.servers.get(namespace, server_id).await
    }

    /// Step 2 continued: a multi-user server's credential-sourced env
    /// (`TOKEN_EXCHANGE_*`, `AUDIT_LOG_TOKEN`) is only worth fetching when
    /// some declared env var isn't already pinned to a static value.
    pub async fn materialize_credentials(&self, server: &ServerRecord) -> Result<CredentialBundle> {
        if !server.spec.is_multi_user() || server.spec.manifest.env.iter().all(|e| e.value.is_some()) {
            return Ok(CredentialBundle::new());
        }
        let ctx = SecretContext::new(server.meta.name.clone(), server.meta.name.clone());
        self.secrets.get(&ctx).await
    }

    /// Step 3: a composite multi-user component may only be reached by the
    /// user who owns the `E_inst` that materialized it.
    pub async fn authorize_composite_component(
        &self,
        namespace: &str,
        component: &ServerRecord,
        caller_user_id: &str,
    ) -> Result<()> {
        if component.spec.composite_name.is_none() {
            return Ok(());
        }
        if component.spec.user_id == caller_user_id {
            return Ok(());
        }
        let instances = self.instances.list(ListOptions { namespace: Some(namespace.to_string()), limit: None }).await?;
        let owns = instances
            .iter()
            .any(|i| i.spec.mcp_server_name == component.meta.name && i.spec.user_id == caller_user_id);
        if owns {
            Ok(())
        } else {
            Err(ControlPlaneError::forbidden(format!(
                "{caller_user_id} does not own composite component {}",
                component.meta.name
            )))
        }
    }

    /// Step 4: obtain the upstream URL, launching a session if needed.
    pub async fn launch(&self, namespace: &str, user_id: &str, server_name: &str) -> Result<String> {
        self.sessions.launch_server(namespace, user_id, server_name).await
    }
}

/// Step 5: `X-Forwarded-Host`/`X-Forwarded-Proto`, set from the inbound
/// request's own host/scheme so the upstream can reconstruct the original
/// origin, plus a fresh `X-Request-Id` for cross-service correlation.
pub fn forwarded_headers(incoming_host: &str, incoming_proto: &str) -> Vec<(&'static str, String)> {
    vec![
        ("X-Forwarded-Host", incoming_host.to_string()),
        ("X-Forwarded-Proto", incoming_proto.to_string()),
        ("X-Request-Id", uuid::Uuid::new_v4().to_string()),
    ]
}

/// Rewrite the proxied request's URL: upstream scheme/host/path, with
/// `forwarded_path` (the inbound path past `/mcp-connect/<server-id>`)
/// appended, and incoming query parameters merged with any already baked
/// into `upstream_base` — both values are kept on key collision.
pub fn rewrite_upstream_url(upstream_base: &str, forwarded_path: &str, incoming_query: &str) -> Result<String> {
    let mut url = url::Url::parse(upstream_base)
        .map_err(|e| ControlPlaneError::bad_request(format!("invalid upstream URL: {e}")))?;

    if !forwarded_path.is_empty() && forwarded_path != "/" {
        let mut path = url.path().trim_end_matches('/').to_string();
        path.push('/');
        path.push_str(forwarded_path.trim_start_matches('/'));
        url.set_path(&path);
    }

    let mut combined: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    combined.extend(url::form_urlencoded::parse(incoming_query.as_bytes()).into_owned());

    if combined.is_empty() {
        url.set_query(None);
    } else {
        let serialized = url::form_urlencoded::Serializer::new(String::new()).extend_pairs(&combined).finish();
        url.set_query(Some(&serialized));
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnvVar, Manifest, RuntimeConfig, ServerInstanceSpec, ServerSpec};
    use crate::secrets::InMemorySecretStore;
    use crate::session::{McpClient, SessionBackend};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::Value;

    #[test]
    fn discovery_challenge_embeds_origin_and_path() {
        let header = GatewayRouter::discovery_challenge("https://obot.example.com", "/mcp-connect/srv1");
        assert_eq!(
            header,
            r#"Bearer resource_metadata="https://obot.example.com/.well-known/oauth-protected-resource/mcp-connect/srv1""#
        );
    }

    #[test]
    fn rewrite_merges_query_preserving_collisions() {
        let url = rewrite_upstream_url("http://srv.internal:8080/base?a=1", "tools/call", "a=2&b=3").unwrap();
        assert!(url.starts_with("http://srv.internal:8080/base/tools/call?"));
        assert!(url.contains("a=1"));
        assert!(url.contains("a=2"));
        assert!(url.contains("b=3"));
    }

    #[test]
    fn rewrite_with_no_forwarded_path_keeps_base_path() {
        let url = rewrite_upstream_url("http://srv.internal:8080/base", "", "").unwrap();
        assert_eq!(url, "http://srv.internal:8080/base");
    }

    struct NoopBackend;
    #[async_trait]
    impl SessionBackend for NoopBackend {
        async fn deploy(&self, _namespace: &str, server: &ServerRecord) -> Result<String> {
            Ok(format!("http://{}.internal", server.meta.name))
        }
        async fn health_check(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self, _namespace: &str, _server_name: &str) -> Result<()> {
            Ok(())
        }
    }
    struct NoopClient;
    #[async_trait]
    impl McpClient for NoopClient {
        async fn initialize(&self, _url: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn list_tools(&self, _url: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn list_resources(&self, _url: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn list_prompts(&self, _url: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn read_resource(&self, _url: &str, _uri: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn get_prompt(&self, _url: &str, _name: &str, _args: &Value) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn manifest(env: Vec<EnvVar>) -> Manifest {
        Manifest { runtime: RuntimeConfig::Uvx { package: "p".into(), command: None, args: vec![] }, env }
    }

    fn router() -> GatewayRouter {
        let servers: Arc<dyn ObjectStore<ServerRecord>> = Arc::new(InMemoryStore::new());
        let instances: Arc<dyn ObjectStore<ServerInstance>> = Arc::new(InMemoryStore::new());
        let secrets: Arc<dyn SecretStore> = Arc::new(InMemorySecretStore::new());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(NoopBackend),
            Arc::new(NoopClient),
            servers.clone(),
            std::time::Duration::from_secs(60),
        ));
        GatewayRouter::new(servers, instances, secrets, sessions)
    }

    #[tokio::test]
    async fn all_static_env_skips_credential_lookup() {
        let gw = router();
        let server = ServerRecord::new(
            "ns",
            "srv1",
            ServerSpec {
                user_id: "u1".into(),
                catalog_entry_id: None,
                catalog_id: Some("cat1".into()),
                workspace_id: None,
                composite_name: None,
                shared_within_mcp_catalog_name: None,
                manifest: manifest(vec![EnvVar { key: "A".into(), required: true, sensitive: false, value: Some("1".into()) }]),
                needs_url: false,
                previous_url: None,
            },
        );
        let bundle = gw.materialize_credentials(&server).await.unwrap();
        assert!(bundle.is_empty());
    }

    #[tokio::test]
    async fn dynamic_env_on_multi_user_server_pulls_from_secret_store() {
        let gw = router();
        let server = ServerRecord::new(
            "ns",
            "srv1",
            ServerSpec {
                user_id: "u1".into(),
                catalog_entry_id: None,
                catalog_id: Some("cat1".into()),
                workspace_id: None,
                composite_name: None,
                shared_within_mcp_catalog_name: None,
                manifest: manifest(vec![EnvVar { key: "TOKEN".into(), required: true, sensitive: true, value: None }]),
                needs_url: false,
                previous_url: None,
            },
        );
        let ctx = SecretContext::new("srv1", "srv1");
        let mut bundle = CredentialBundle::new();
        bundle.insert("TOKEN_EXCHANGE_CLIENT_ID".into(), "ns:abc".into());
        gw.secrets.put(&ctx, bundle.clone()).await.unwrap();

        let fetched = gw.materialize_credentials(&server).await.unwrap();
        assert_eq!(fetched, bundle);
    }

    #[tokio::test]
    async fn composite_component_denies_non_owner() {
        let gw = router();
        let component = ServerRecord::new(
            "ns",
            "comp1-component-entry1",
            ServerSpec {
                user_id: "owner".into(),
                catalog_entry_id: Some("entry1".into()),
                catalog_id: None,
                workspace_id: None,
                composite_name: Some("comp1".into()),
                shared_within_mcp_catalog_name: None,
                manifest: manifest(vec![]),
                needs_url: false,
                previous_url: None,
            },
        );
        gw.instances
            .create(ServerInstance::new(
                "ns",
                "inst1",
                ServerInstanceSpec {
                    user_id: "owner".into(),
                    mcp_server_name: "comp1-component-entry1".into(),
                    composite_name: Some("comp1".into()),
                },
            ))
            .await
            .unwrap();

        assert!(gw.authorize_composite_component("ns", &component, "owner").await.is_ok());
        assert!(gw.authorize_composite_component("ns", &component, "intruder").await.is_err());
    }
}
