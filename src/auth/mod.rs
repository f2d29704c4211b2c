//! Authentication and route gating (spec.md §6).
//!
//! Two bearer forms share one `Authorization` header: a session JWT, and an
//! opaque `ok1-`-prefixed API key. Both resolve to an [`Identity`]; callers
//! downstream (the gateway, the LLM proxy) only ever see that, never which
//! path produced it — mirrors the teacher's `AuthenticationResult` shape in
//! `auth::middleware`, collapsed from three variants to two since this
//! control plane has no separate OAuth-bearer path at the HTTP layer (OAuth
//! here gates MCP server access, not control-plane API access).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::acr::{AccessControlHelper, TargetKind};
use crate::error::{ControlPlaneError, Result};
use crate::policy::UserContext;

/// Opaque API-key prefix (spec.md §6).
pub const API_KEY_PREFIX: &str = "ok1-";

pub fn is_api_key(bearer: &str) -> bool {
    bearer.starts_with(API_KEY_PREFIX)
}

/// `Authorization: Bearer <token>` extraction.
pub fn extract_bearer(header_value: Option<&str>) -> Option<&str> {
    header_value.and_then(|v| v.strip_prefix("Bearer "))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub groups: Vec<String>,
    pub iat: u64,
    pub exp: u64,
}

/// Session-cookie / bearer-JWT codec.
pub struct JwtCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    validation: Validation,
}

impl JwtCodec {
    pub fn new(secret: &[u8]) -> Self {
        let algorithm = Algorithm::HS256;
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            algorithm,
            validation,
        }
    }

    pub fn issue(&self, user_id: &str, groups: Vec<String>, ttl: Duration) -> Result<String> {
        let now = Utc::now().timestamp() as u64;
        let claims = SessionClaims { sub: user_id.to_string(), groups, iat: now, exp: now + ttl.as_secs() };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| ControlPlaneError::unauthorized(format!("failed to issue token: {e}")))
    }

    pub fn decode(&self, token: &str) -> Result<SessionClaims> {
        decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                warn!(error = %e, "jwt validation failed");
                ControlPlaneError::unauthorized("invalid or expired token")
            })
    }
}

/// The resolved caller, regardless of which bearer form produced it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub groups: Vec<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.groups.iter().any(|g| g == "admin")
    }

    pub fn is_api_key(&self) -> bool {
        self.groups.iter().any(|g| g == "api-key")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedServers {
    Wildcard,
    Set(HashSet<String>),
}

impl AllowedServers {
    pub fn allows(&self, server_id: &str) -> bool {
        match self {
            AllowedServers::Wildcard => true,
            AllowedServers::Set(set) => set.contains(server_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub user_id: String,
    pub allowed_servers: AllowedServers,
    pub active: bool,
}

/// API-key metadata is relational-store state (spec.md §6), reached through
/// a narrow trait like every other external collaborator in this crate.
#[async_trait::async_trait]
pub trait ApiKeyDirectory: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<ApiKeyRecord>;
    /// `lastUsedAt` is updated asynchronously (spec.md §6); callers never
    /// await this directly — see [`Authenticator::authenticate`].
    async fn touch_last_used(&self, key: &str) -> Result<()>;
}

pub struct Authenticator {
    jwt: JwtCodec,
    api_keys: Arc<dyn ApiKeyDirectory>,
}

impl Authenticator {
    pub fn new(jwt: JwtCodec, api_keys: Arc<dyn ApiKeyDirectory>) -> Self {
        Self { jwt, api_keys }
    }

    /// `Some` only for API-key bearers, since that's the only identity kind
    /// `authorize_mcp_connect` needs an allow-list for.
    pub async fn api_key_scope(&self, bearer: &str) -> Result<Option<AllowedServers>> {
        if is_api_key(bearer) {
            Ok(Some(self.api_keys.lookup(bearer).await?.allowed_servers))
        } else {
            Ok(None)
        }
    }

    pub async fn authenticate(&self, bearer: &str) -> Result<Identity> {
        if is_api_key(bearer) {
            let record = self.api_keys.lookup(bearer).await?;
            if !record.active {
                return Err(ControlPlaneError::unauthorized("api key is expired or inactive"));
            }
            let api_keys = self.api_keys.clone();
            let key = bearer.to_string();
            tokio::spawn(async move {
                if let Err(err) = api_keys.touch_last_used(&key).await {
                    warn!(error = %err, "failed to update api key lastUsedAt");
                }
            });
            Ok(Identity { user_id: record.user_id, groups: vec!["api-key".to_string()] })
        } else {
            let claims = self.jwt.decode(bearer)?;
            Ok(Identity { user_id: claims.sub, groups: claims.groups })
        }
    }
}

/// spec.md §6: "the MCP connect auth webhook validates per-request that (a)
/// the server is in the key's allow-list (for component servers, the parent
/// composite is also checked) and (b) the user still has ACR-based access".
/// Only meaningful for API-key identities; JWT-session callers reach the
/// gateway through [`crate::gateway::GatewayRouter::authorize_composite_component`]
/// instead.
pub fn authorize_mcp_connect(
    identity: &Identity,
    allowed_servers: &AllowedServers,
    server_id: &str,
    composite_parent_id: Option<&str>,
    acr: &AccessControlHelper<'_>,
    owner_user_id: Option<&str>,
    scope: &str,
) -> Result<()> {
    let server_allowed =
        allowed_servers.allows(server_id) || composite_parent_id.map(|p| allowed_servers.allows(p)).unwrap_or(false);
    if !server_allowed {
        return Err(ControlPlaneError::forbidden(format!("api key is not scoped to server {server_id}")));
    }
    let user = UserContext::new(identity.user_id.clone(), identity.groups.clone());
    if acr.can_access(&user, owner_user_id, TargetKind::McpServer, server_id, scope) {
        Ok(())
    } else {
        Err(ControlPlaneError::forbidden(format!("{} has no access to server {server_id}", identity.user_id)))
    }
}

/// Domain-role route categories gated by the static allow-list (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteCategory {
    OauthWellKnown,
    Webhooks,
    Bootstrap,
    Healthz,
    PublicCatalogRead,
    McpConnect,
    ApiMe,
    LlmProxy,
    Metrics,
    AuthenticatedGeneral,
}

/// `admin` passes everything; `*` (any caller, including unauthenticated)
/// passes the categories spec.md names explicitly.
fn route_allowed_for_groups(category: RouteCategory, groups: &[String]) -> bool {
    if groups.iter().any(|g| g == "admin") {
        return true;
    }
    match category {
        RouteCategory::OauthWellKnown
        | RouteCategory::Webhooks
        | RouteCategory::Bootstrap
        | RouteCategory::Healthz
        | RouteCategory::PublicCatalogRead
        | RouteCategory::McpConnect => true,
        RouteCategory::ApiMe => !groups.is_empty(),
        RouteCategory::Metrics => groups.iter().any(|g| g == "metrics"),
        RouteCategory::LlmProxy | RouteCategory::AuthenticatedGeneral => groups.iter().any(|g| g == "authenticated"),
    }
}

/// API keys are restricted to MCP-connect routes and `/api/me`, overriding
/// whatever `route_allowed_for_groups` would otherwise permit for `"*"`.
pub fn is_route_reachable(category: RouteCategory, identity: &Identity) -> bool {
    if identity.is_api_key() {
        matches!(category, RouteCategory::McpConnect | RouteCategory::ApiMe)
    } else {
        route_allowed_for_groups(category, &identity.groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jwt_round_trips() {
        let codec = JwtCodec::new(b"test-secret-at-least-32-bytes-long!");
        let token = codec.issue("u1", vec!["authenticated".to_string()], Duration::from_secs(3600)).unwrap();
        let claims = codec.decode(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.groups, vec!["authenticated".to_string()]);
    }

    #[test]
    fn jwt_wrong_secret_is_rejected() {
        let codec = JwtCodec::new(b"test-secret-at-least-32-bytes-long!");
        let token = codec.issue("u1", vec![], Duration::from_secs(3600)).unwrap();
        let other = JwtCodec::new(b"different-secret-at-least-32-bytes!");
        assert!(other.decode(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let codec = JwtCodec::new(b"test-secret-at-least-32-bytes-long!");
        let token = codec.issue("u1", vec![], Duration::from_secs(0)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(codec.decode(&token).is_err());
    }

    #[test]
    fn api_key_prefix_detection() {
        assert!(is_api_key("ok1-abc123"));
        assert!(!is_api_key("eyJhbGciOi..."));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer(Some("Bearer abc")), Some("abc"));
        assert_eq!(extract_bearer(Some("abc")), None);
        assert_eq!(extract_bearer(None), None);
    }

    struct FakeDirectory {
        calls: std::sync::Arc<AtomicUsize>,
    }
    #[async_trait::async_trait]
    impl ApiKeyDirectory for FakeDirectory {
        async fn lookup(&self, key: &str) -> Result<ApiKeyRecord> {
            if key == "ok1-good" {
                Ok(ApiKeyRecord { user_id: "u1".into(), allowed_servers: AllowedServers::Wildcard, active: true })
            } else {
                Err(ControlPlaneError::unauthorized("invalid api key"))
            }
        }
        async fn touch_last_used(&self, _key: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn api_key_authenticates_into_api_key_group() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let auth = Authenticator::new(
            JwtCodec::new(b"test-secret-at-least-32-bytes-long!"),
            Arc::new(FakeDirectory { calls: calls.clone() }),
        );
        let identity = auth.authenticate("ok1-good").await.unwrap();
        assert_eq!(identity.user_id, "u1");
        assert!(identity.is_api_key());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_api_key_is_rejected() {
        let auth = Authenticator::new(
            JwtCodec::new(b"test-secret-at-least-32-bytes-long!"),
            Arc::new(FakeDirectory { calls: std::sync::Arc::new(AtomicUsize::new(0)) }),
        );
        assert!(auth.authenticate("ok1-bad").await.is_err());
    }

    #[test]
    fn admin_bypasses_every_category() {
        let admin = vec!["admin".to_string()];
        assert!(route_allowed_for_groups(RouteCategory::Metrics, &admin));
        assert!(route_allowed_for_groups(RouteCategory::AuthenticatedGeneral, &admin));
    }

    #[test]
    fn wildcard_categories_need_no_group() {
        assert!(route_allowed_for_groups(RouteCategory::Healthz, &[]));
        assert!(route_allowed_for_groups(RouteCategory::McpConnect, &[]));
        assert!(!route_allowed_for_groups(RouteCategory::Metrics, &[]));
    }

    #[test]
    fn api_key_identity_restricted_to_mcp_connect_and_me() {
        let identity = Identity { user_id: "u1".into(), groups: vec!["api-key".to_string()] };
        assert!(is_route_reachable(RouteCategory::McpConnect, &identity));
        assert!(is_route_reachable(RouteCategory::ApiMe, &identity));
        assert!(!is_route_reachable(RouteCategory::Healthz, &identity));
        assert!(!is_route_reachable(RouteCategory::PublicCatalogRead, &identity));
    }

    #[test]
    fn mcp_connect_authorization_checks_allow_list_then_acr() {
        let rules = vec![];
        let helper = AccessControlHelper::new(&rules);
        let identity = Identity { user_id: "u1".into(), groups: vec!["api-key".to_string()] };

        let scoped = AllowedServers::Set(["srv1".to_string()].into_iter().collect());
        assert!(authorize_mcp_connect(&identity, &scoped, "srv1", None, &helper, Some("u1"), "ws1").is_ok());
        assert!(authorize_mcp_connect(&identity, &scoped, "srv2", None, &helper, Some("u1"), "ws1").is_err());

        // Component server reachable via its composite parent's allow-list entry.
        let parent_scoped = AllowedServers::Set(["composite1".to_string()].into_iter().collect());
        assert!(
            authorize_mcp_connect(&identity, &parent_scoped, "composite1-component-x", Some("composite1"), &helper, Some("u1"), "ws1")
                .is_ok()
        );
    }
}
