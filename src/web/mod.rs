//! actix-web HTTP surface (spec.md §6 "Inbound HTTP surface").
//!
//! Handlers stay thin: authenticate, delegate to the owning module
//! (`gateway`, `llm_proxy`, the `ObjectStore`s, `session::SessionManager`),
//! translate the result to a response. Business logic never lives here —
//! grounded on the teacher's `web::dashboard` handlers, which are the same
//! kind of thin wrapper over `registry`/`mcp`/`supervisor`.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::json;
use tracing::warn;

use crate::acr::AccessControlHelper;
use crate::auth::{self, Authenticator, Identity, RouteCategory};
use crate::error::ControlPlaneError;
use crate::gateway::{forwarded_headers, rewrite_upstream_url, GatewayRouter};
use crate::llm_proxy::{extract_requested_model, LlmProxyService, TokenClaims, TokenDecoder, UsageAccumulator};
use crate::model::{AccessControlRule, CatalogEntry, OAuthClient, ServerInstance, ServerRecord};
use crate::reconciler::ReconcilerMetricsSource;
use crate::session::SessionManager;
use crate::store::{ListOptions, ObjectStore};

pub struct AppState {
    pub catalog: Arc<dyn ObjectStore<CatalogEntry>>,
    pub servers: Arc<dyn ObjectStore<ServerRecord>>,
    pub instances: Arc<dyn ObjectStore<ServerInstance>>,
    pub oauth_clients: Arc<dyn ObjectStore<OAuthClient>>,
    pub acr_rules: Arc<dyn ObjectStore<AccessControlRule>>,
    pub gateway: Arc<GatewayRouter>,
    pub sessions: Arc<SessionManager>,
    pub llm_proxy: Arc<LlmProxyService>,
    pub mcp_token_decoder: Arc<dyn TokenDecoder>,
    pub authenticator: Arc<Authenticator>,
    pub http: reqwest::Client,
    pub default_namespace: String,
    pub public_origin: String,
    pub reconcilers: Vec<Arc<dyn ReconcilerMetricsSource>>,
}

fn error_response(err: &ControlPlaneError) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(err.status_code())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(json!({ "error": err.to_string() }))
}

fn bearer_from(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::extract_bearer)
        .map(str::to_string)
}

/// Authenticates `req` against `category`, rejecting with 401/403 per
/// spec.md §6's static route allow-list.
async fn authenticate(req: &HttpRequest, state: &AppState, category: RouteCategory) -> Result<Identity, HttpResponse> {
    let bearer = bearer_from(req);
    let identity = match bearer {
        Some(token) => match state.authenticator.authenticate(&token).await {
            Ok(identity) => identity,
            Err(err) => return Err(error_response(&err)),
        },
        None => Identity { user_id: String::new(), groups: vec![] },
    };
    if auth::is_route_reachable(category, &identity) {
        Ok(identity)
    } else {
        Err(error_response(&ControlPlaneError::forbidden("route not reachable for this identity")))
    }
}

pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub async fn oauth_protected_resource(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let resource = format!("{}/mcp-connect/{}", state.public_origin, path.into_inner());
    HttpResponse::Ok().json(json!({
        "resource": resource,
        "authorization_servers": [format!("{}/.well-known/oauth-authorization-server", state.public_origin)],
        "bearer_methods_supported": ["header"],
    }))
}

pub async fn oauth_authorization_server(
    state: web::Data<AppState>,
    oauth_id: Option<web::Path<String>>,
) -> HttpResponse {
    let issuer = state.public_origin.clone();
    if let Some(id) = oauth_id {
        match state.oauth_clients.get(&state.default_namespace, &id).await {
            Ok(client) => HttpResponse::Ok().json(json!({
                "issuer": issuer,
                "client_id": client.spec.client_id,
                "grant_types_supported": client.spec.grant_types,
            })),
            Err(err) => error_response(&err),
        }
    } else {
        HttpResponse::Ok().json(json!({ "issuer": issuer }))
    }
}

/// `/mcp-connect/{server_id}/{tail:.*}` reverse proxy (spec.md §4.I).
pub async fn mcp_connect(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> HttpResponse {
    let (server_id, tail) = path.into_inner();
    let bearer = bearer_from(&req);
    let Some(bearer) = bearer else {
        let origin = state.public_origin.clone();
        return HttpResponse::Unauthorized()
            .insert_header(("WWW-Authenticate", GatewayRouter::discovery_challenge(&origin, &format!("/mcp-connect/{server_id}"))))
            .finish();
    };
    let identity = match state.authenticator.authenticate(&bearer).await {
        Ok(identity) => identity,
        Err(err) => return error_response(&err),
    };

    let server = match state.gateway.resolve_target(&state.default_namespace, &server_id).await {
        Ok(server) => server,
        Err(err) => return error_response(&err),
    };

    if identity.is_api_key() {
        let allowed_servers = match state.authenticator.api_key_scope(&bearer).await {
            Ok(Some(scope)) => scope,
            Ok(None) => return error_response(&ControlPlaneError::unauthorized("api key scope not found")),
            Err(err) => return error_response(&err),
        };
        let rules = match state.acr_rules.list(ListOptions { namespace: Some(state.default_namespace.clone()), limit: None }).await {
            Ok(rules) => rules,
            Err(err) => return error_response(&err),
        };
        let helper = AccessControlHelper::new(&rules);
        if let Err(err) = auth::authorize_mcp_connect(
            &identity,
            &allowed_servers,
            &server.meta.name,
            server.spec.composite_name.as_deref(),
            &helper,
            Some(&server.spec.user_id),
            "connect",
        ) {
            return error_response(&err);
        }
    }

    if let Err(err) = state.gateway.authorize_composite_component(&state.default_namespace, &server, &identity.user_id).await {
        return error_response(&err);
    }

    let upstream_base = match state.gateway.launch(&state.default_namespace, &identity.user_id, &server.meta.name).await {
        Ok(url) => url,
        Err(err) => return error_response(&err),
    };
    let target = match rewrite_upstream_url(&upstream_base, &tail, req.query_string()) {
        Ok(url) => url,
        Err(err) => return error_response(&err),
    };

    let incoming_host = req.connection_info().host().to_string();
    let incoming_scheme = req.connection_info().scheme().to_string();
    let mut builder = state.http.request(req.method().clone(), &target);
    for (name, value) in forwarded_headers(&incoming_host, &incoming_scheme) {
        builder = builder.header(name, value);
    }
    let credentials = match state.gateway.materialize_credentials(&server).await {
        Ok(bundle) => bundle,
        Err(err) => return error_response(&err),
    };
    for (key, value) in credentials.iter() {
        builder = builder.header(key.as_str(), value.as_str());
    }

    match builder.body(body.to_vec()).send().await {
        Ok(resp) => forward_response(resp).await,
        Err(err) => {
            warn!(server = %server_id, error = %err, "mcp-connect upstream request failed");
            error_response(&ControlPlaneError::health_check_failed(format!("upstream request failed: {err}")))
        }
    }
}

async fn forward_response(resp: reqwest::Response) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(resp.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in resp.headers() {
        if let Ok(v) = value.to_str() {
            builder.insert_header((name.as_str(), v));
        }
    }
    match resp.bytes().await {
        Ok(bytes) => builder.body(bytes),
        Err(_) => builder.finish(),
    }
}

/// `POST /api/llm-proxy/{tail:.*}`: token-authenticated LLM path (spec.md §4.J).
pub async fn llm_proxy_forward(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    let Some(bearer) = bearer_from(&req) else {
        return error_response(&ControlPlaneError::AuthRequired);
    };
    let claims: TokenClaims = match state.mcp_token_decoder.decode(&bearer) {
        Ok(claims) => claims,
        Err(err) => return error_response(&err),
    };

    let requested_model = match extract_requested_model(&body) {
        Ok(model) => model,
        Err(err) => return error_response(&err),
    };

    let (model_id, provider) = if LlmProxyService::needs_resolution(&claims, &requested_model) {
        match state.llm_proxy.resolve_model_ref(&requested_model).await {
            Ok(resolved) => (resolved.model_id, resolved.provider),
            Err(err) => return error_response(&err),
        }
    } else {
        (requested_model.clone(), claims.model_provider.clone().unwrap_or_default())
    };

    if let Err(err) = state.llm_proxy.check_access(claims.user_id.as_deref(), &claims.user_groups, &model_id).await {
        return error_response(&err);
    }
    if let Some(user_id) = &claims.user_id {
        if let Err(err) = state.llm_proxy.enforce_budget(user_id).await {
            return error_response(&err);
        }
    }

    let (rewritten_body, content_length) = match LlmProxyService::rewrite_model(&body, &model_id) {
        Ok(pair) => pair,
        Err(err) => return error_response(&err),
    };

    let base_url = match state.llm_proxy.provider_base_url(&provider).await {
        Ok(url) => url,
        Err(err) => return error_response(&err),
    };
    let (header_name, header_value) = match state.llm_proxy.replacement_credential_header(&provider).await {
        Ok(pair) => pair,
        Err(err) => return error_response(&err),
    };

    let upstream_resp = match state
        .http
        .post(format!("{base_url}{}", req.uri().path().trim_start_matches("/api/llm-proxy")))
        .header(header_name, header_value)
        .header("Content-Length", content_length.to_string())
        .body(rewritten_body)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(err) => return error_response(&ControlPlaneError::health_check_failed(format!("provider request failed: {err}"))),
    };

    let status = actix_web::http::StatusCode::from_u16(upstream_resp.status().as_u16())
        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);

    let run_id = claims.run_id.clone();
    let user_id = claims.user_id.clone().unwrap_or_default();
    let personal_token = claims.user_id.is_some();
    let llm_proxy = state.llm_proxy.clone();

    let mut accumulator = UsageAccumulator::new();
    let mut buffered = Vec::new();
    let mut raw_chunks: Vec<Bytes> = Vec::new();
    let mut stream = upstream_resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                buffered.extend_from_slice(&bytes);
                raw_chunks.push(bytes);
            }
            Err(err) => {
                warn!(error = %err, "llm proxy upstream stream error");
                break;
            }
        }
    }

    let replay = futures_util::stream::iter(raw_chunks.into_iter().map(Ok::<_, std::io::Error>));
    let mut events = replay.eventsource();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => accumulator.feed_event_data(&event.data),
            Err(_) => break,
        }
    }

    llm_proxy.flush_usage(accumulator.close(), run_id, user_id, personal_token);

    HttpResponse::build(status).body(buffered)
}

pub async fn get_catalog_entry(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    if let Err(resp) = authenticate(&req, &state, RouteCategory::PublicCatalogRead).await {
        return resp;
    }
    match state.catalog.get(&state.default_namespace, &path).await {
        Ok(entry) => HttpResponse::Ok().json(entry),
        Err(err) => error_response(&err),
    }
}

pub async fn list_catalog_entries(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(resp) = authenticate(&req, &state, RouteCategory::PublicCatalogRead).await {
        return resp;
    }
    match state.catalog.list(ListOptions { namespace: Some(state.default_namespace.clone()), limit: None }).await {
        Ok(entries) => HttpResponse::Ok().json(entries),
        Err(err) => error_response(&err),
    }
}

pub async fn create_catalog_entry(req: HttpRequest, state: web::Data<AppState>, body: web::Json<CatalogEntry>) -> HttpResponse {
    if let Err(resp) = authenticate(&req, &state, RouteCategory::AuthenticatedGeneral).await {
        return resp;
    }
    match state.catalog.create(body.into_inner()).await {
        Ok(entry) => HttpResponse::Created().json(entry),
        Err(err) => error_response(&err),
    }
}

pub async fn delete_catalog_entry(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    if let Err(resp) = authenticate(&req, &state, RouteCategory::AuthenticatedGeneral).await {
        return resp;
    }
    match state.catalog.delete(&state.default_namespace, &path).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(err) => error_response(&err),
    }
}

pub async fn get_server(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    if let Err(resp) = authenticate(&req, &state, RouteCategory::AuthenticatedGeneral).await {
        return resp;
    }
    match state.servers.get(&state.default_namespace, &path).await {
        Ok(server) => HttpResponse::Ok().json(server),
        Err(err) => error_response(&err),
    }
}

/// `/api/mcp/{id}/restart`: evict the session so the next connect relaunches
/// a fresh pod (spec.md §4.H "idle eviction"; the reconciler notices the
/// torn-down instance and redeploys per §4.F/§4.K).
pub async fn restart_server(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let identity = match authenticate(&req, &state, RouteCategory::AuthenticatedGeneral).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };
    match state.sessions.shutdown_server(&state.default_namespace, &identity.user_id, &path).await {
        Ok(()) => HttpResponse::Accepted().finish(),
        Err(err) => error_response(&err),
    }
}

pub async fn server_tools(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let identity = match authenticate(&req, &state, RouteCategory::AuthenticatedGeneral).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };
    match state.sessions.list_tools(&state.default_namespace, &identity.user_id, &path).await {
        Ok(tools) => HttpResponse::Ok().json(tools),
        Err(err) => error_response(&err),
    }
}

pub async fn server_prompts(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let identity = match authenticate(&req, &state, RouteCategory::AuthenticatedGeneral).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };
    match state.sessions.list_prompts(&state.default_namespace, &identity.user_id, &path).await {
        Ok(prompts) => HttpResponse::Ok().json(prompts),
        Err(err) => error_response(&err),
    }
}

pub async fn server_resources(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let identity = match authenticate(&req, &state, RouteCategory::AuthenticatedGeneral).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };
    match state.sessions.list_resources(&state.default_namespace, &identity.user_id, &path).await {
        Ok(resources) => HttpResponse::Ok().json(resources),
        Err(err) => error_response(&err),
    }
}

pub async fn server_details(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let identity = match authenticate(&req, &state, RouteCategory::AuthenticatedGeneral).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };
    match state.sessions.server_capabilities(&state.default_namespace, &identity.user_id, &path).await {
        Ok(details) => HttpResponse::Ok().json(details),
        Err(err) => error_response(&err),
    }
}

pub async fn api_me(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match authenticate(&req, &state, RouteCategory::ApiMe).await {
        Ok(identity) => HttpResponse::Ok().json(json!({ "userId": identity.user_id, "groups": identity.groups })),
        Err(resp) => resp,
    }
}

/// Reconciler queue depth and leader status per record type (`SPEC_FULL.md`
/// §10), gated behind the `metrics` group like the teacher gates its own
/// operational endpoints.
pub async fn metrics(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(resp) = authenticate(&req, &state, RouteCategory::Metrics).await {
        return resp;
    }
    let reconcilers: Vec<_> = state
        .reconcilers
        .iter()
        .map(|r| json!({ "recordKind": r.record_kind(), "queueDepth": r.queue_depth(), "isLeader": r.is_leader() }))
        .collect();
    HttpResponse::Ok().json(json!({ "reconcilers": reconcilers }))
}

/// Builds the actix `App` factory; `main.rs` wires this into `HttpServer::new`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz))
        .route("/.well-known/oauth-protected-resource/{tail:.*}", web::get().to(oauth_protected_resource))
        .route("/.well-known/oauth-authorization-server", web::get().to(oauth_authorization_server_root))
        .route("/.well-known/oauth-authorization-server/{oauth_id}", web::get().to(oauth_authorization_server))
        .route("/mcp-connect/{server_id}/{tail:.*}", web::route().to(mcp_connect))
        .route("/api/llm-proxy/{tail:.*}", web::post().to(llm_proxy_forward))
        .route("/api/mcp/catalog", web::get().to(list_catalog_entries))
        .route("/api/mcp/catalog", web::post().to(create_catalog_entry))
        .route("/api/mcp/catalog/{id}", web::get().to(get_catalog_entry))
        .route("/api/mcp/catalog/{id}", web::delete().to(delete_catalog_entry))
        .route("/api/mcp/{id}/restart", web::post().to(restart_server))
        .route("/api/mcp/{id}/tools", web::get().to(server_tools))
        .route("/api/mcp/{id}/prompts", web::get().to(server_prompts))
        .route("/api/mcp/{id}/resources", web::get().to(server_resources))
        .route("/api/mcp/{id}/details", web::get().to(server_details))
        .route("/api/mcp/{id}", web::get().to(get_server))
        .route("/api/me", web::get().to(api_me))
        .route("/metrics", web::get().to(metrics));
}

async fn oauth_authorization_server_root(state: web::Data<AppState>) -> HttpResponse {
    oauth_authorization_server(state, None).await
}

/// Binds and runs the server, draining in-flight proxy calls and idle
/// sessions on `ctrl_c` (`SPEC_FULL.md` §10) within the 30s shutdown window.
pub async fn run(state: AppState, host: &str, port: u16) -> std::io::Result<()> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .bind((host, port))?
        .shutdown_timeout(Duration::from_secs(30).as_secs())
        .run();

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl_c received, draining in-flight requests before shutdown");
            handle.stop(true).await;
        }
    });

    server.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_maps_status_codes() {
        let resp = error_response(&ControlPlaneError::TooManyRequests);
        assert_eq!(resp.status(), actix_web::http::StatusCode::TOO_MANY_REQUESTS);
        let resp = error_response(&ControlPlaneError::AuthRequired);
        assert_eq!(resp.status(), actix_web::http::StatusCode::PRECONDITION_FAILED);
    }

    #[test]
    fn bearer_extracted_from_authorization_header() {
        let req = actix_web::test::TestRequest::default()
            .insert_header((actix_web::http::header::AUTHORIZATION, "Bearer abc123"))
            .to_http_request();
        assert_eq!(bearer_from(&req), Some("abc123".to_string()));
    }

    #[test]
    fn missing_authorization_header_yields_none() {
        let req = actix_web::test::TestRequest::default().to_http_request();
        assert_eq!(bearer_from(&req), None);
    }
}
