//! LLM proxy: model access enforcement, model-id rewriting, and streamed
//! token-usage accounting (spec.md §4.J).
//!
//! JWT decoding, the provider credential registry, and the relational usage
//! store are external collaborators reached through narrow traits, the same
//! seam shape `session::SessionBackend` and `secrets::SecretStore` use
//! elsewhere in this crate.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ControlPlaneError, Result};
use crate::model::{DefaultModelAlias, Model, ModelAccessPolicy, ModelRef};
use crate::policy::{AllowedModels, PolicyEvaluator, UserContext};
use crate::store::{ListOptions, ObjectStore};

/// Claims carried by a short-lived token-authenticated-path bearer token
/// (spec.md §4.J: `{namespace, userID, userGroups, modelRef, modelProvider,
/// run/thread/project context}`). `model_ref` is the *raw* wire form (`"*"`,
/// `"obot://<alias>"`, or a bare id) so it can be compared against the
/// request body's `model` string before deciding whether resolution is
/// needed at all.
#[derive(Debug, Clone)]
pub struct TokenClaims {
    pub namespace: String,
    pub user_id: Option<String>,
    pub user_groups: Vec<String>,
    pub model_ref: String,
    pub model_provider: Option<String>,
    pub run_id: Option<String>,
    pub thread_id: Option<String>,
    pub project_id: Option<String>,
}

pub trait TokenDecoder: Send + Sync {
    fn decode(&self, token: &str) -> Result<TokenClaims>;
}

#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// `auth_provider_groups`, looked up from the user record (spec.md §4.J).
    async fn auth_provider_groups(&self, user_id: &str) -> Result<Vec<String>>;
}

/// Credential header style for a provider's direct API (spec.md §6: "HTTPS
/// with provider-specific credential header").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialHeaderStyle {
    Bearer,
    ApiKey,
}

#[async_trait::async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn user_credential(&self, provider: &str, user_id: &str) -> Result<String>;
    async fn stored_key(&self, provider: &str) -> Result<String>;
    async fn base_url(&self, provider: &str) -> Result<String>;
    fn header_style(&self, provider: &str) -> CredentialHeaderStyle;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub run_id: Option<String>,
    pub user_id: String,
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
    pub personal_token: bool,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<()>;
    /// `(prompt, completion)` summed since `since`.
    async fn rolling_usage(&self, user_id: &str, since: DateTime<Utc>) -> Result<(u64, u64)>;
}

/// Rolling-window budget; either side may be unlimited (spec.md §4.J).
#[derive(Debug, Clone, Default)]
pub struct TokenBudget {
    pub prompt_limit: Option<u64>,
    pub completion_limit: Option<u64>,
}

pub struct ResolvedModel {
    pub model_id: String,
    pub provider: String,
}

pub struct LlmProxyService {
    models: Arc<dyn ObjectStore<Model>>,
    aliases: Arc<dyn ObjectStore<DefaultModelAlias>>,
    policies: Arc<dyn ObjectStore<ModelAccessPolicy>>,
    users: Arc<dyn UserDirectory>,
    providers: Arc<dyn ProviderRegistry>,
    usage: Arc<dyn UsageStore>,
    budget: TokenBudget,
}

impl LlmProxyService {
    pub fn new(
        models: Arc<dyn ObjectStore<Model>>,
        aliases: Arc<dyn ObjectStore<DefaultModelAlias>>,
        policies: Arc<dyn ObjectStore<ModelAccessPolicy>>,
        users: Arc<dyn UserDirectory>,
        providers: Arc<dyn ProviderRegistry>,
        usage: Arc<dyn UsageStore>,
        budget: TokenBudget,
    ) -> Self {
        Self { models, aliases, policies, users, providers, usage, budget }
    }

    /// Whether the token path must resolve `modelRef` fresh, vs. trusting the
    /// token's already-resolved `modelProvider` (spec.md §4.J step 1).
    pub fn needs_resolution(claims: &TokenClaims, requested_model: &str) -> bool {
        claims.model_provider.as_deref().unwrap_or("").is_empty() || requested_model != claims.model_ref
    }

    async fn known_target_models(&self) -> Result<HashSet<String>> {
        let models = self.models.list(ListOptions::default()).await?;
        Ok(models.into_iter().map(|m| m.spec.target_model).collect())
    }

    /// Resolve `modelRef` against `E_dma` (alias) or `Model` records (by name
    /// or by `targetModel`, oldest-first tiebreak); reject if inactive.
    pub async fn resolve_model_ref(&self, raw: &str) -> Result<ResolvedModel> {
        match ModelRef::parse(raw) {
            ModelRef::Wildcard => {
                Err(ControlPlaneError::bad_request("modelRef wildcard cannot be resolved to a concrete model"))
            }
            ModelRef::Alias { name } => {
                let aliases = self.aliases.list(ListOptions::default()).await?;
                let dma = aliases
                    .into_iter()
                    .find(|a| a.spec.alias == name)
                    .ok_or_else(|| ControlPlaneError::not_found(format!("default model alias {name}")))?;
                self.resolve_by_name_or_target(&dma.spec.model_id).await
            }
            ModelRef::Concrete { id } => self.resolve_by_name_or_target(&id).await,
        }
    }

    async fn resolve_by_name_or_target(&self, name_or_target: &str) -> Result<ResolvedModel> {
        let mut candidates: Vec<Model> = self
            .models
            .list(ListOptions::default())
            .await?
            .into_iter()
            .filter(|m| m.meta.name == name_or_target || m.spec.target_model == name_or_target)
            .collect();
        candidates.sort_by_key(|m| m.spec.created_at);
        let chosen = candidates
            .into_iter()
            .next()
            .ok_or_else(|| ControlPlaneError::not_found(format!("model {name_or_target}")))?;
        if !chosen.spec.active {
            return Err(ControlPlaneError::bad_request(format!("model {name_or_target} is inactive")));
        }
        Ok(ResolvedModel { model_id: chosen.spec.target_model, provider: chosen.spec.provider })
    }

    /// `hasAccess(user, modelID)` with `auth_provider_groups` folded into the
    /// caller's declared groups; only run when a `userID` is present.
    pub async fn check_access(&self, user_id: Option<&str>, groups: &[String], model_id: &str) -> Result<()> {
        let Some(user_id) = user_id else { return Ok(()) };
        let mut full_groups = groups.to_vec();
        full_groups.extend(self.users.auth_provider_groups(user_id).await?);

        let policies = self.policies.list(ListOptions::default()).await?;
        let aliases = self.aliases.list(ListOptions::default()).await?;
        let known = self.known_target_models().await?;
        let evaluator = PolicyEvaluator::new(&policies, &aliases, &known);
        let user = UserContext::new(user_id, full_groups);
        if evaluator.has_access(&user, model_id) {
            Ok(())
        } else {
            Err(ControlPlaneError::forbidden(format!("{user_id} has no access to {model_id}")))
        }
    }

    /// Provider-direct path: list `Model`s matching `(targetModel, provider)`
    /// and deny unless the caller can reach at least one of them.
    pub async fn check_access_any_provider_model(
        &self,
        user_id: &str,
        groups: &[String],
        target_model: &str,
        provider: &str,
    ) -> Result<Vec<Model>> {
        let candidates: Vec<Model> = self
            .models
            .list(ListOptions::default())
            .await?
            .into_iter()
            .filter(|m| m.spec.target_model == target_model && m.spec.provider == provider)
            .collect();
        if candidates.is_empty() {
            return Err(ControlPlaneError::not_found(format!("no model {target_model} for provider {provider}")));
        }

        let mut full_groups = groups.to_vec();
        full_groups.extend(self.users.auth_provider_groups(user_id).await?);
        let policies = self.policies.list(ListOptions::default()).await?;
        let aliases = self.aliases.list(ListOptions::default()).await?;
        let known = self.known_target_models().await?;
        let evaluator = PolicyEvaluator::new(&policies, &aliases, &known);
        let user = UserContext::new(user_id, full_groups);

        let reachable = matches!(evaluator.allowed_models(&user), AllowedModels::Wildcard)
            || candidates.iter().any(|m| evaluator.has_access(&user, &m.spec.target_model));
        if reachable {
            Ok(candidates)
        } else {
            Err(ControlPlaneError::forbidden(format!("{user_id} has no access to {target_model}")))
        }
    }

    /// Rolling 24h budget check; `TooManyRequests` maps to 429.
    pub async fn enforce_budget(&self, user_id: &str) -> Result<()> {
        if self.budget.prompt_limit.is_none() && self.budget.completion_limit.is_none() {
            return Ok(());
        }
        let since = Utc::now() - ChronoDuration::hours(24);
        let (prompt_used, completion_used) = self.usage.rolling_usage(user_id, since).await?;
        if let Some(limit) = self.budget.prompt_limit {
            if prompt_used >= limit {
                return Err(ControlPlaneError::TooManyRequests);
            }
        }
        if let Some(limit) = self.budget.completion_limit {
            if completion_used >= limit {
                return Err(ControlPlaneError::TooManyRequests);
            }
        }
        Ok(())
    }

    pub async fn user_credential(&self, provider: &str, user_id: &str) -> Result<String> {
        self.providers.user_credential(provider, user_id).await
    }

    /// `Authorization: Bearer …` or `X-Api-Key: …` with the provider's stored
    /// key, for the provider-direct path.
    pub async fn replacement_credential_header(&self, provider: &str) -> Result<(&'static str, String)> {
        let key = self.providers.stored_key(provider).await?;
        Ok(match self.providers.header_style(provider) {
            CredentialHeaderStyle::Bearer => ("Authorization", format!("Bearer {key}")),
            CredentialHeaderStyle::ApiKey => ("X-Api-Key", key),
        })
    }

    pub async fn provider_base_url(&self, provider: &str) -> Result<String> {
        self.providers.base_url(provider).await
    }

    /// Rewrite `body.model` to the provider-native target model and
    /// re-serialize, returning the new body and its `Content-Length`.
    pub fn rewrite_model(body: &[u8], target_model: &str) -> Result<(Vec<u8>, usize)> {
        let mut value: Value = serde_json::from_slice(body)?;
        match value.as_object_mut() {
            Some(obj) => {
                obj.insert("model".to_string(), Value::String(target_model.to_string()));
            }
            None => return Err(ControlPlaneError::bad_request("request body is not a JSON object")),
        }
        let serialized = serde_json::to_vec(&value)?;
        let len = serialized.len();
        Ok((serialized, len))
    }

    /// Detached background write of the usage record (spec.md §5: cancelling
    /// the client request must not drop metering). Errors are logged only.
    pub fn flush_usage(&self, totals: UsageTotals, run_id: Option<String>, user_id: String, personal_token: bool) {
        let usage = self.usage_store();
        tokio::spawn(async move {
            let record = UsageRecord {
                run_id,
                user_id: user_id.clone(),
                prompt: totals.prompt,
                completion: totals.completion,
                total: totals.total,
                personal_token,
                recorded_at: Utc::now(),
            };
            if let Err(err) = usage.record(record).await {
                warn!(user_id = %user_id, error = %err, "failed to record LLM token usage");
            }
        });
    }

    fn usage_store(&self) -> Arc<dyn UsageStore> {
        self.usage.clone()
    }
}

/// `body.model` read for both proxy paths.
pub fn extract_requested_model(body: &[u8]) -> Result<String> {
    let value: Value = serde_json::from_slice(body)?;
    value
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ControlPlaneError::bad_request("request body has no model field"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// Accumulates token usage from a streamed `/v1/chat/completions` response
/// body, line by line (spec.md §4.J "Streaming token accounting").
///
/// Usage is looked for at three places a line might carry it: top-level
/// `usage`, `message.usage` (Anthropic `message_start`), and `response.usage`
/// (OpenAI `response.completed`). A later value always overwrites an earlier
/// one — this is what makes Anthropic's cumulative `message_delta` output
/// count correct without any special-casing.
#[derive(Debug, Default, Clone)]
pub struct UsageAccumulator {
    prompt: Option<u64>,
    completion: Option<u64>,
    total: Option<u64>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of the response body. Lines that aren't an SSE `data:`
    /// payload, or whose payload isn't JSON, pass through untouched. Kept for
    /// tests and non-SSE callers; the live upstream path feeds events via
    /// [`Self::feed_event_data`] after `eventsource-stream` framing.
    pub fn feed_line(&mut self, line: &str) {
        let Some(rest) = line.strip_prefix("data:") else { return };
        self.feed_event_data(rest.trim_start());
    }

    /// Feed one SSE event's `data` field, already de-framed by
    /// `eventsource-stream` (spec.md §4.J "Streaming token accounting").
    pub fn feed_event_data(&mut self, payload: &str) {
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(payload) else { return };
        let Some(usage) = locate_usage(&value) else { return };

        if let Some(p) = usage.get("prompt_tokens").or_else(|| usage.get("input_tokens")).and_then(Value::as_u64) {
            self.prompt = Some(p);
        }
        if let Some(c) = usage.get("completion_tokens").or_else(|| usage.get("output_tokens")).and_then(Value::as_u64)
        {
            self.completion = Some(c);
        }
        if let Some(t) = usage.get("total_tokens").and_then(Value::as_u64) {
            self.total = Some(t);
        }
    }

    /// `Close()`: derive `total` as `prompt + completion` if no line ever
    /// carried one.
    pub fn close(self) -> UsageTotals {
        let prompt = self.prompt.unwrap_or(0);
        let completion = self.completion.unwrap_or(0);
        let total = self.total.unwrap_or(prompt + completion);
        UsageTotals { prompt, completion, total }
    }
}

fn locate_usage(value: &Value) -> Option<&Value> {
    value
        .get("usage")
        .or_else(|| value.get("message").and_then(|m| m.get("usage")))
        .or_else(|| value.get("response").and_then(|r| r.get("usage")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DmaSpec, ModelSpec};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    fn model(name: &str, target: &str, provider: &str, active: bool, created_at: DateTime<Utc>) -> Model {
        Model::new("ns", name, ModelSpec { target_model: target.into(), provider: provider.into(), active, created_at })
    }

    struct FakeUsers;
    #[async_trait]
    impl UserDirectory for FakeUsers {
        async fn auth_provider_groups(&self, user_id: &str) -> Result<Vec<String>> {
            if user_id == "u1" {
                Ok(vec!["sso-eng".to_string()])
            } else {
                Ok(vec![])
            }
        }
    }

    struct FakeProviders;
    #[async_trait]
    impl ProviderRegistry for FakeProviders {
        async fn user_credential(&self, _provider: &str, _user_id: &str) -> Result<String> {
            Ok("user-cred".into())
        }
        async fn stored_key(&self, _provider: &str) -> Result<String> {
            Ok("stored-key".into())
        }
        async fn base_url(&self, provider: &str) -> Result<String> {
            Ok(format!("https://{provider}.example.com"))
        }
        fn header_style(&self, provider: &str) -> CredentialHeaderStyle {
            if provider == "anthropic" {
                CredentialHeaderStyle::ApiKey
            } else {
                CredentialHeaderStyle::Bearer
            }
        }
    }

    struct FakeUsage {
        prompt: AtomicU64,
        completion: AtomicU64,
        recorded: Mutex<Vec<UsageRecord>>,
    }
    impl FakeUsage {
        fn new(prompt: u64, completion: u64) -> Self {
            Self { prompt: AtomicU64::new(prompt), completion: AtomicU64::new(completion), recorded: Mutex::new(vec![]) }
        }
    }
    #[async_trait]
    impl UsageStore for FakeUsage {
        async fn record(&self, record: UsageRecord) -> Result<()> {
            self.recorded.lock().await.push(record);
            Ok(())
        }
        async fn rolling_usage(&self, _user_id: &str, _since: DateTime<Utc>) -> Result<(u64, u64)> {
            Ok((self.prompt.load(Ordering::SeqCst), self.completion.load(Ordering::SeqCst)))
        }
    }

    async fn service(models: Vec<Model>, budget: TokenBudget, usage: Arc<FakeUsage>) -> LlmProxyService {
        let model_store: Arc<dyn ObjectStore<Model>> = Arc::new(InMemoryStore::new());
        for m in models {
            model_store.create(m).await.unwrap();
        }
        let aliases: Arc<dyn ObjectStore<DefaultModelAlias>> = Arc::new(InMemoryStore::new());
        let policies: Arc<dyn ObjectStore<ModelAccessPolicy>> = Arc::new(InMemoryStore::new());
        LlmProxyService::new(model_store, aliases, policies, Arc::new(FakeUsers), Arc::new(FakeProviders), usage, budget)
    }

    #[tokio::test]
    async fn resolves_concrete_model_by_target_oldest_first() {
        let older = Utc::now() - ChronoDuration::days(1);
        let newer = Utc::now();
        let svc = service(
            vec![
                model("m-a", "claude-sonnet", "anthropic", true, newer),
                model("m-b", "claude-sonnet", "anthropic", true, older),
            ],
            TokenBudget::default(),
            Arc::new(FakeUsage::new(0, 0)),
        )
        .await;
        let resolved = svc.resolve_model_ref("claude-sonnet").await.unwrap();
        assert_eq!(resolved.provider, "anthropic");
    }

    #[tokio::test]
    async fn inactive_resolution_is_rejected() {
        let svc = service(
            vec![model("m-a", "claude-sonnet", "anthropic", false, Utc::now())],
            TokenBudget::default(),
            Arc::new(FakeUsage::new(0, 0)),
        )
        .await;
        assert!(svc.resolve_model_ref("claude-sonnet").await.is_err());
    }

    #[tokio::test]
    async fn alias_resolves_through_dma() {
        let svc = service(
            vec![model("m-a", "claude-sonnet", "anthropic", true, Utc::now())],
            TokenBudget::default(),
            Arc::new(FakeUsage::new(0, 0)),
        )
        .await;
        svc.aliases
            .create(DefaultModelAlias {
                meta: crate::model::ObjectMeta::new("ns", "llm"),
                spec: DmaSpec { alias: "llm".into(), model_id: "claude-sonnet".into() },
            })
            .await
            .unwrap();
        let resolved = svc.resolve_model_ref("obot://llm").await.unwrap();
        assert_eq!(resolved.model_id, "claude-sonnet");
    }

    #[tokio::test]
    async fn budget_over_limit_yields_too_many_requests() {
        let svc = service(vec![], TokenBudget { prompt_limit: Some(100), completion_limit: None }, Arc::new(FakeUsage::new(150, 0))).await;
        let err = svc.enforce_budget("u1").await.unwrap_err();
        assert!(matches!(err, ControlPlaneError::TooManyRequests));
    }

    #[tokio::test]
    async fn budget_under_limit_passes() {
        let svc = service(vec![], TokenBudget { prompt_limit: Some(100), completion_limit: None }, Arc::new(FakeUsage::new(10, 0))).await;
        assert!(svc.enforce_budget("u1").await.is_ok());
    }

    #[test]
    fn rewrite_model_sets_field_and_length() {
        let body = br#"{"model":"gpt-4","messages":[]}"#;
        let (rewritten, len) = LlmProxyService::rewrite_model(body, "gpt-4-native").unwrap();
        assert_eq!(len, rewritten.len());
        let value: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "gpt-4-native");
    }

    #[test]
    fn needs_resolution_when_provider_blank_or_model_mismatched() {
        let claims = TokenClaims {
            namespace: "ns".into(),
            user_id: Some("u1".into()),
            user_groups: vec![],
            model_ref: "claude-sonnet".into(),
            model_provider: None,
            run_id: None,
            thread_id: None,
            project_id: None,
        };
        assert!(LlmProxyService::needs_resolution(&claims, "claude-sonnet"));

        let resolved_claims = TokenClaims { model_provider: Some("anthropic".into()), ..claims };
        assert!(!LlmProxyService::needs_resolution(&resolved_claims, "claude-sonnet"));
        assert!(LlmProxyService::needs_resolution(&resolved_claims, "gpt-4"));
    }

    /// spec.md §8 scenario 4.
    #[test]
    fn streaming_usage_anthropic_scenario() {
        let mut acc = UsageAccumulator::new();
        acc.feed_line(r#"data: {"type":"message_start","message":{"model":"claude-sonnet","usage":{"input_tokens":25,"output_tokens":1}}}"#);
        acc.feed_line(r#"data: {"type":"message_delta","usage":{"output_tokens":15}}"#);
        let totals = acc.close();
        assert_eq!(totals.prompt, 25);
        assert_eq!(totals.completion, 15);
        assert_eq!(totals.total, 40);
    }

    #[test]
    fn streaming_usage_openai_nested_under_response() {
        let mut acc = UsageAccumulator::new();
        acc.feed_line(r#"data: {"type":"response.completed","response":{"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}}"#);
        let totals = acc.close();
        assert_eq!(totals, UsageTotals { prompt: 10, completion: 5, total: 15 });
    }

    #[test]
    fn non_data_and_done_lines_are_ignored() {
        let mut acc = UsageAccumulator::new();
        acc.feed_line(": keep-alive");
        acc.feed_line("data: [DONE]");
        let totals = acc.close();
        assert_eq!(totals, UsageTotals::default());
    }
}
