use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::Mutex;
use tracing::info;

use mcp_control_plane::auth::{ApiKeyDirectory, ApiKeyRecord, Authenticator, JwtCodec};
use mcp_control_plane::catalog::registry::{CatalogRegistry, ComponentSource};
use mcp_control_plane::composite::{CompositeAggregator, SessionShutdown};
use mcp_control_plane::config::Config;
use mcp_control_plane::deploy::DeploymentBackend;
use mcp_control_plane::error::{ControlPlaneError, Result};
use mcp_control_plane::gateway::GatewayRouter;
use mcp_control_plane::llm_proxy::{
    CredentialHeaderStyle, LlmProxyService, ProviderRegistry, TokenBudget, TokenClaims, TokenDecoder, UsageRecord,
    UsageStore, UserDirectory,
};
use mcp_control_plane::model::{
    AccessControlRule, CatalogEntry, DefaultModelAlias, Model, ModelAccessPolicy, OAuthClient, ServerInstance, ServerRecord,
};
use mcp_control_plane::secrets::InMemorySecretStore;
use mcp_control_plane::session::{McpClient, SessionBackend, SessionManager};
use mcp_control_plane::store::{InMemoryStore, ListOptions, ObjectStore};
use mcp_control_plane::web::{self, AppState};

#[derive(Parser)]
#[command(name = "mcp-control-plane")]
#[command(about = "Multi-tenant control plane for Model Context Protocol servers")]
#[command(version)]
struct Cli {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Bridges `DeploymentBackend`'s settings-aware deploy call to the session
/// manager's narrower seam (spec.md §4.F / §4.H).
struct K8sSessionBackend {
    deployer: Arc<DeploymentBackend>,
    settings: mcp_control_plane::config::K8sSettings,
    http: reqwest::Client,
}

#[async_trait]
impl SessionBackend for K8sSessionBackend {
    async fn deploy(&self, _namespace: &str, server: &ServerRecord) -> Result<String> {
        self.deployer.deploy(server, &self.settings).await
    }

    async fn health_check(&self, url: &str) -> Result<()> {
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(ControlPlaneError::health_check_failed(format!("status {}", resp.status()))),
            Err(err) => Err(ControlPlaneError::health_check_failed(err.to_string())),
        }
    }

    async fn shutdown(&self, _namespace: &str, server_name: &str) -> Result<()> {
        self.deployer.shutdown(server_name).await
    }
}

/// Speaks MCP's JSON-RPC 2.0 wire format to a live backend pod (spec.md
/// §4.H operation list).
struct HttpMcpClient {
    http: reqwest::Client,
}

impl HttpMcpClient {
    async fn call(&self, url: &str, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let body = serde_json::json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let resp = self.http.post(url).json(&body).send().await?;
        let value: serde_json::Value = resp.json().await?;
        if let Some(error) = value.get("error") {
            return Err(ControlPlaneError::not_supported(format!("mcp error: {error}")));
        }
        Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl McpClient for HttpMcpClient {
    async fn initialize(&self, url: &str) -> Result<serde_json::Value> {
        self.call(url, "initialize", serde_json::json!({})).await
    }
    async fn list_tools(&self, url: &str) -> Result<serde_json::Value> {
        self.call(url, "tools/list", serde_json::json!({})).await
    }
    async fn list_resources(&self, url: &str) -> Result<serde_json::Value> {
        self.call(url, "resources/list", serde_json::json!({})).await
    }
    async fn list_prompts(&self, url: &str) -> Result<serde_json::Value> {
        self.call(url, "prompts/list", serde_json::json!({})).await
    }
    async fn read_resource(&self, url: &str, uri: &str) -> Result<serde_json::Value> {
        self.call(url, "resources/read", serde_json::json!({ "uri": uri })).await
    }
    async fn get_prompt(&self, url: &str, name: &str, args: &serde_json::Value) -> Result<serde_json::Value> {
        self.call(url, "prompts/get", serde_json::json!({ "name": name, "arguments": args })).await
    }
}

/// `composite::SessionShutdown` seam over the real session manager.
struct SessionManagerShutdown(Arc<SessionManager>);

#[async_trait]
impl SessionShutdown for SessionManagerShutdown {
    async fn shutdown_server(&self, namespace: &str, server_name: &str) -> Result<()> {
        self.0.shutdown_server_for_all_users(namespace, server_name).await
    }
}

/// In-memory API-key directory; the relational store named in spec.md §6
/// is an external collaborator, reached through `ApiKeyDirectory` — this is
/// the binary's own placeholder wiring for it, the same role `InMemoryStore`
/// plays for the declarative object store.
struct InMemoryApiKeys {
    keys: Mutex<HashMap<String, ApiKeyRecord>>,
}

#[async_trait]
impl ApiKeyDirectory for InMemoryApiKeys {
    async fn lookup(&self, key: &str) -> Result<ApiKeyRecord> {
        self.keys
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ControlPlaneError::unauthorized("unknown api key"))
    }

    async fn touch_last_used(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// In-memory LLM-proxy user directory, provider credential registry, and
/// usage store; same placeholder role as `InMemoryApiKeys` above.
struct StaticUserDirectory;

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn auth_provider_groups(&self, _user_id: &str) -> Result<Vec<String>> {
        Ok(vec![])
    }
}

struct EnvProviderRegistry {
    openai_base_url: String,
    anthropic_base_url: String,
}

#[async_trait]
impl ProviderRegistry for EnvProviderRegistry {
    async fn user_credential(&self, _provider: &str, _user_id: &str) -> Result<String> {
        Err(ControlPlaneError::not_supported("per-user provider credentials are not configured"))
    }
    async fn stored_key(&self, provider: &str) -> Result<String> {
        std::env::var(format!("{}_API_KEY", provider.to_uppercase()))
            .map_err(|_| ControlPlaneError::not_found(format!("no stored key for provider {provider}")))
    }
    async fn base_url(&self, provider: &str) -> Result<String> {
        match provider {
            "openai" => Ok(self.openai_base_url.clone()),
            "anthropic" => Ok(self.anthropic_base_url.clone()),
            other => Err(ControlPlaneError::not_found(format!("unknown provider {other}"))),
        }
    }
    fn header_style(&self, provider: &str) -> CredentialHeaderStyle {
        if provider == "anthropic" {
            CredentialHeaderStyle::ApiKey
        } else {
            CredentialHeaderStyle::Bearer
        }
    }
}

struct InMemoryUsageStore {
    records: Mutex<Vec<UsageRecord>>,
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
    async fn rolling_usage(&self, user_id: &str, since: DateTime<Utc>) -> Result<(u64, u64)> {
        let records = self.records.lock().await;
        let (prompt, completion) = records
            .iter()
            .filter(|r| r.user_id == user_id && r.recorded_at >= since)
            .fold((0u64, 0u64), |(p, c), r| (p + r.prompt, c + r.completion));
        Ok((prompt, completion))
    }
}

/// MCP-token decoder for the LLM-proxy path (spec.md §4.J "short-lived
/// tokens issued per user/session"). Same HS256 envelope as the session
/// codec, but a different claims shape, so it carries its own
/// `DecodingKey`/`Validation` rather than going through `auth::JwtCodec`
/// (which is hardcoded to `SessionClaims`).
struct JwtTokenDecoder {
    decoding_key: jsonwebtoken::DecodingKey,
    validation: jsonwebtoken::Validation,
}

impl JwtTokenDecoder {
    fn new(secret: &[u8]) -> Self {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;
        Self { decoding_key: jsonwebtoken::DecodingKey::from_secret(secret), validation }
    }
}

#[derive(serde::Deserialize)]
struct McpTokenClaims {
    namespace: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    user_groups: Vec<String>,
    model_ref: String,
    #[serde(default)]
    model_provider: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    exp: u64,
}

impl TokenDecoder for JwtTokenDecoder {
    fn decode(&self, token: &str) -> Result<TokenClaims> {
        let raw = jsonwebtoken::decode::<McpTokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| ControlPlaneError::unauthorized(format!("invalid mcp token: {e}")))?
            .claims;
        Ok(TokenClaims {
            namespace: raw.namespace,
            user_id: raw.user_id,
            user_groups: raw.user_groups,
            model_ref: raw.model_ref,
            model_provider: raw.model_provider,
            run_id: raw.run_id,
            thread_id: raw.thread_id,
            project_id: raw.project_id,
        })
    }
}

/// Handler adapter: runs the nine-handler server reconcile chain against
/// the freshly-read global K8s settings hash (spec.md §5: "read per
/// reconcile, not cached").
struct ServerReconcileHandler {
    registry: Arc<mcp_control_plane::registry::ServerRegistry>,
    k8s_settings: mcp_control_plane::config::K8sSettings,
}

#[async_trait]
impl mcp_control_plane::reconciler::ReconcileHandler<ServerRecord> for ServerReconcileHandler {
    async fn handle(
        &self,
        key: &mcp_control_plane::model::ObjectKey,
        _item: &ServerRecord,
    ) -> Result<mcp_control_plane::reconciler::HandlerOutcome> {
        let hash = self.k8s_settings.hash();
        self.registry.reconcile(&key.namespace, &key.name, &hash).await?;
        Ok(mcp_control_plane::reconciler::HandlerOutcome::Done)
    }
}

/// Handler adapter: reconciles a composite server's component fan-out
/// (spec.md §4.G), chained after server registry reconciliation so a
/// composite's own drift is evaluated against an already-settled record.
struct CompositeReconcileHandler {
    aggregator: Arc<CompositeAggregator>,
}

#[async_trait]
impl mcp_control_plane::reconciler::ReconcileHandler<ServerRecord> for CompositeReconcileHandler {
    async fn handle(
        &self,
        key: &mcp_control_plane::model::ObjectKey,
        _item: &ServerRecord,
    ) -> Result<mcp_control_plane::reconciler::HandlerOutcome> {
        self.aggregator.reconcile(&key.namespace, &key.name).await?;
        Ok(mcp_control_plane::reconciler::HandlerOutcome::Done)
    }
}

/// Handler adapter: recomputes a catalog entry's manifest hash, composite
/// drift, OAuth credential lifecycle, and user count (spec.md §4.D).
struct CatalogReconcileHandler {
    registry: Arc<CatalogRegistry>,
    servers: Arc<dyn ObjectStore<ServerRecord>>,
    catalog: Arc<dyn ObjectStore<CatalogEntry>>,
}

#[async_trait]
impl mcp_control_plane::reconciler::ReconcileHandler<CatalogEntry> for CatalogReconcileHandler {
    async fn handle(
        &self,
        key: &mcp_control_plane::model::ObjectKey,
        _item: &CatalogEntry,
    ) -> Result<mcp_control_plane::reconciler::HandlerOutcome> {
        let servers = self.servers.list(ListOptions { namespace: Some(key.namespace.clone()), limit: None }).await?;
        let all_catalog =
            self.catalog.list(ListOptions { namespace: Some(key.namespace.clone()), limit: None }).await?;
        let catalog_by_name: HashMap<String, CatalogEntry> =
            all_catalog.into_iter().map(|e| (e.meta.name.clone(), e)).collect();
        let servers_by_catalog_id: HashMap<String, ServerRecord> = servers
            .iter()
            .filter(|s| s.spec.catalog_entry_id.is_some())
            .map(|s| (s.spec.catalog_entry_id.clone().unwrap(), s.clone()))
            .collect();
        let resolve_source = |id: &str, _kind: &str| -> Option<ComponentSource> {
            catalog_by_name
                .get(id)
                .cloned()
                .map(ComponentSource::CatalogEntry)
                .or_else(|| servers_by_catalog_id.get(id).cloned().map(ComponentSource::MultiUserServer))
        };
        self.registry.reconcile(&key.namespace, &key.name, &servers, resolve_source).await?;
        Ok(mcp_control_plane::reconciler::HandlerOutcome::Done)
    }
}

/// Handler adapter: the §4.B pruning side-handler, run on every `E_map`
/// change so `models` stays canonical (spec.md §4.B "runs on every `E_map`
/// change").
struct PolicyPruneHandler {
    policies: Arc<dyn ObjectStore<ModelAccessPolicy>>,
    aliases: Arc<dyn ObjectStore<DefaultModelAlias>>,
    models: Arc<dyn ObjectStore<Model>>,
}

#[async_trait]
impl mcp_control_plane::reconciler::ReconcileHandler<ModelAccessPolicy> for PolicyPruneHandler {
    async fn handle(
        &self,
        key: &mcp_control_plane::model::ObjectKey,
        item: &ModelAccessPolicy,
    ) -> Result<mcp_control_plane::reconciler::HandlerOutcome> {
        let aliases = self.aliases.list(ListOptions { namespace: Some(key.namespace.clone()), limit: None }).await?;
        let known_models: std::collections::HashSet<String> = self
            .models
            .list(ListOptions { namespace: Some(key.namespace.clone()), limit: None })
            .await?
            .into_iter()
            .map(|m| m.spec.target_model)
            .collect();
        if let Some(pruned) = mcp_control_plane::policy::prune_policy(&item.models, &aliases, &known_models) {
            let mut updated = item.clone();
            updated.models = pruned;
            self.policies.update(updated).await?;
        }
        Ok(mcp_control_plane::reconciler::HandlerOutcome::Done)
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_line_number(true))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = Config::from_env()?;
    info!(namespace = %config.object_store_namespace, "starting mcp control plane");

    let servers: Arc<dyn ObjectStore<ServerRecord>> = Arc::new(InMemoryStore::new());
    let instances: Arc<dyn ObjectStore<ServerInstance>> = Arc::new(InMemoryStore::new());
    let catalog: Arc<dyn ObjectStore<CatalogEntry>> = Arc::new(InMemoryStore::new());
    let oauth_clients: Arc<dyn ObjectStore<OAuthClient>> = Arc::new(InMemoryStore::new());
    let acr_rules: Arc<dyn ObjectStore<AccessControlRule>> = Arc::new(InMemoryStore::new());
    let model_policies: Arc<dyn ObjectStore<ModelAccessPolicy>> = Arc::new(InMemoryStore::new());
    let model_aliases: Arc<dyn ObjectStore<DefaultModelAlias>> = Arc::new(InMemoryStore::new());
    let models: Arc<dyn ObjectStore<Model>> = Arc::new(InMemoryStore::new());

    let secrets = Arc::new(InMemorySecretStore::new());

    let kube_client = kube::Client::try_default().await?;
    let deployer_client = kube_client.clone();
    let deployer = Arc::new(DeploymentBackend::new(kube_client, config.object_store_namespace.clone()));
    let http = reqwest::Client::new();

    let session_backend: Arc<dyn SessionBackend> =
        Arc::new(K8sSessionBackend { deployer: deployer.clone(), settings: config.k8s_settings.clone(), http: http.clone() });
    let mcp_client: Arc<dyn McpClient> = Arc::new(HttpMcpClient { http: http.clone() });
    let sessions = Arc::new(SessionManager::new(session_backend, mcp_client, servers.clone(), config.session_idle_eviction));

    let gateway = Arc::new(GatewayRouter::new(servers.clone(), instances.clone(), secrets.clone(), sessions.clone()));

    let jwt_secret = std::env::var("SESSION_JWT_SECRET").unwrap_or_else(|_| "development-only-secret-change-me!!".to_string());
    let api_keys = Arc::new(InMemoryApiKeys { keys: Mutex::new(HashMap::new()) });
    let authenticator = Arc::new(Authenticator::new(JwtCodec::new(jwt_secret.as_bytes()), api_keys));

    let llm_proxy = Arc::new(LlmProxyService::new(
        models.clone(),
        model_aliases.clone(),
        model_policies.clone(),
        Arc::new(StaticUserDirectory),
        Arc::new(EnvProviderRegistry {
            openai_base_url: config.openai_base_url.clone().unwrap_or_else(|| "https://api.openai.com".to_string()),
            anthropic_base_url: config.anthropic_base_url.clone().unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }),
        Arc::new(InMemoryUsageStore { records: Mutex::new(vec![]) }),
        TokenBudget { prompt_limit: config.token_limits.prompt_per_day, completion_limit: config.token_limits.completion_per_day },
    ));
    let mcp_token_decoder: Arc<dyn TokenDecoder> = Arc::new(JwtTokenDecoder::new(jwt_secret.as_bytes()));

    let server_registry = Arc::new(mcp_control_plane::registry::ServerRegistry::new(
        servers.clone(),
        instances.clone(),
        oauth_clients.clone(),
        catalog.clone(),
        secrets.clone(),
        config.retry_backoff_start,
        config.retry_max_attempts,
    ));
    let composite_aggregator = Arc::new(CompositeAggregator::new(
        servers.clone(),
        instances.clone(),
        Arc::new(SessionManagerShutdown(sessions.clone())) as Arc<dyn SessionShutdown>,
        config.retry_backoff_start,
        config.retry_max_attempts,
    ));
    let catalog_registry =
        Arc::new(CatalogRegistry::new(catalog.clone(), secrets.clone(), config.retry_backoff_start, config.retry_max_attempts));

    let server_runtime = mcp_control_plane::reconciler::ReconcilerRuntime::new(
        servers.clone(),
        vec![
            Arc::new(ServerReconcileHandler { registry: server_registry, k8s_settings: config.k8s_settings.clone() }),
            Arc::new(CompositeReconcileHandler { aggregator: composite_aggregator }),
        ],
        Arc::new(mcp_control_plane::reconciler::SingleProcessLeader),
        config.reconciler_workers,
    );
    tokio::spawn(server_runtime.clone().run_watch_loop());

    let catalog_runtime = mcp_control_plane::reconciler::ReconcilerRuntime::new(
        catalog.clone(),
        vec![Arc::new(CatalogReconcileHandler { registry: catalog_registry, servers: servers.clone(), catalog: catalog.clone() })],
        Arc::new(mcp_control_plane::reconciler::SingleProcessLeader),
        config.reconciler_workers,
    );
    tokio::spawn(catalog_runtime.clone().run_watch_loop());

    let policy_runtime = mcp_control_plane::reconciler::ReconcilerRuntime::new(
        model_policies.clone(),
        vec![Arc::new(PolicyPruneHandler {
            policies: model_policies.clone(),
            aliases: model_aliases.clone(),
            models: models.clone(),
        })],
        Arc::new(mcp_control_plane::reconciler::SingleProcessLeader),
        config.reconciler_workers,
    );
    tokio::spawn(policy_runtime.clone().run_watch_loop());

    tokio::spawn(mcp_control_plane::deploy::watch_workload_status(
        deployer_client.clone(),
        config.object_store_namespace.clone(),
        servers.clone(),
    ));

    let reconcilers: Vec<Arc<dyn mcp_control_plane::reconciler::ReconcilerMetricsSource>> =
        vec![server_runtime.clone(), catalog_runtime.clone(), policy_runtime.clone()];

    let state = AppState {
        catalog,
        servers,
        instances,
        oauth_clients,
        acr_rules,
        gateway,
        sessions,
        llm_proxy,
        mcp_token_decoder,
        authenticator,
        http,
        default_namespace: config.object_store_namespace.clone(),
        public_origin: std::env::var("PUBLIC_ORIGIN").unwrap_or_else(|_| "http://localhost:8080".to_string()),
        reconcilers,
    };

    let host = cli.host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = cli.port.unwrap_or(8080);
    info!(%host, %port, "listening");
    web::run(state, &host, port).await?;
    Ok(())
}
