//! Axum-based HTTP gateway for the macro-trigger relay.
//!
//! Surface:
//! - `/auth/*` — cookie-based signup/login/logout plus current-user lookup
//! - `/api/devices*`, `/api/macros/*` — session-scoped provisioning
//! - `/invoke/{endpoint}` — the relay path: resolve macro, run the access
//!   gate, proxy to the trigger service, and hand back its response verbatim
//!
//! Request bodies are size-limited (64KB) and the whole surface carries a
//! request timeout, so a stalled client or upstream cannot pin a worker.
//! Sessions ride in an `HttpOnly; SameSite=Strict` cookie named `sessionId`.

use crate::access::{can_invoke, AccessTier};
use crate::cache::SessionCache;
use crate::config::Config;
use crate::error::Error;
use crate::store::{hash_token, RelayStore, User};
use crate::trigger::{TriggerClient, TriggerResponse};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB) — prevents memory exhaustion
const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout for the whole surface, outbound trigger call included.
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Session cookie name.
const SESSION_COOKIE: &str = "sessionId";
/// Session cookie lifetime: one year.
const COOKIE_MAX_AGE_SECS: u64 = 31_536_000;
/// How often the cache sweeper drops expired session entries.
const CACHE_SWEEP_INTERVAL_SECS: u64 = 60;

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RelayStore>,
    /// Optional read-through session cache; `None` disables caching entirely.
    pub cache: Option<Arc<SessionCache>>,
    pub trigger: Arc<TriggerClient>,
}

/// Run the HTTP gateway until a shutdown signal arrives.
///
/// All process-wide handles (store, cache, trigger client) are constructed
/// here, up front, and dropped when the server loop returns.
pub async fn run_gateway(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    let store = Arc::new(RelayStore::open(&config.database.path)?);
    tracing::info!(path = %config.database.path.display(), "relay store initialized");

    let cache = if config.cache.enabled {
        let cache = Arc::new(SessionCache::with_ttl(config.cache.ttl_secs));
        let cache_for_sweep = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(CACHE_SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let removed = cache_for_sweep.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired session cache entries");
                }
            }
        });
        tracing::info!(ttl = config.cache.ttl_secs, "session cache enabled");
        Some(cache)
    } else {
        None
    };

    let trigger = Arc::new(TriggerClient::new(
        config.trigger.base_url.clone(),
        Duration::from_secs(config.trigger.timeout_secs),
    )?);

    let state = AppState {
        store,
        cache,
        trigger,
    };

    println!("macrorelay gateway listening on {actual_addr}");
    println!("  POST /auth/signup                   — create account + session cookie");
    println!("  POST /auth/login                    — authenticate + session cookie");
    println!("  GET  /auth/logout                   — revoke current session");
    println!("  GET  /auth/me                       — current user info");
    println!("  GET|POST /api/devices               — list / register devices");
    println!("  GET|POST /api/devices/{{id}}/macros   — list / register macros");
    println!("  GET  /invoke/{{endpoint}}             — fire a macro through the relay");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("gateway stopped; store and cache handles released");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Build the router with all routes and middleware.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/signup", post(handle_signup))
        .route("/auth/login", post(handle_login))
        .route("/auth/logout", get(handle_logout))
        .route("/auth/me", get(handle_me))
        .route("/api/me/keys", axum::routing::put(handle_set_keys))
        .route("/api/devices", get(handle_devices_list))
        .route("/api/devices", post(handle_device_create))
        .route("/api/devices/{device_id}", delete(handle_device_delete))
        .route("/api/devices/{device_id}/macros", get(handle_macros_list))
        .route("/api/devices/{device_id}/macros", post(handle_macro_create))
        .route("/api/macros/{endpoint}", delete(handle_macro_delete))
        .route("/invoke/{endpoint}", get(handle_invoke))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

// ── Cookie plumbing ─────────────────────────────────────────────────

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get(header::COOKIE)?;
    let raw = cookie.to_str().ok()?;
    for part in raw.split(';') {
        if let Some((key, value)) = part.trim().split_once('=') {
            if key == name {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn set_session_cookie(token: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={COOKIE_MAX_AGE_SECS}"
    ))
    .ok()
}

fn clear_session_cookie() -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}=deleted; Path=/; HttpOnly; SameSite=Strict; Max-Age=0"
    ))
    .ok()
}

// ── Session resolution ──────────────────────────────────────────────

/// Resolve the request's session cookie to its user, read-through cached.
fn session_user(state: &AppState, headers: &HeaderMap) -> Option<User> {
    let token = parse_cookie(headers, SESSION_COOKIE)?;
    let token_hash = hash_token(&token);
    if let Some(cache) = &state.cache {
        if let Some(user) = cache.get(&token_hash) {
            return Some(user);
        }
    }
    let user = state.store.validate_session(&token)?;
    if let Some(cache) = &state.cache {
        cache.put(&token_hash, user.clone());
    }
    Some(user)
}

fn require_session(state: &AppState, headers: &HeaderMap) -> Result<User, Error> {
    session_user(state, headers).ok_or_else(|| Error::unauthorized("Missing or invalid session"))
}

// ── Auth handlers ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct CredentialsBody {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// 201 with the user JSON (no password material) and the session cookie.
fn session_created_response(user: &User, token: &str) -> Response {
    let mut response = (StatusCode::CREATED, Json(user)).into_response();
    if let Some(value) = set_session_cookie(token) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

/// POST /auth/signup — create a user + initial session in one transaction.
async fn handle_signup(
    State(state): State<AppState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return Error::validation(format!("Invalid request: {e}")).into_response(),
    };
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Error::validation("Missing username or password").into_response();
    }

    // Password stretching is deliberately slow; keep it off the async workers.
    let store = Arc::clone(&state.store);
    let result =
        tokio::task::spawn_blocking(move || store.sign_up(&body.username, &body.password)).await;
    match result {
        Ok(Ok((user, token))) => {
            tracing::info!(user = %user.name, "new account registered");
            session_created_response(&user, &token)
        }
        Ok(Err(e)) => e.into_response(),
        Err(e) => Error::Internal(anyhow::anyhow!("signup task failed: {e}")).into_response(),
    }
}

/// POST /auth/login — verify credentials and issue a fresh session.
async fn handle_login(
    State(state): State<AppState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return Error::validation(format!("Invalid request: {e}")).into_response(),
    };
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Error::validation("Missing username or password").into_response();
    }

    let store = Arc::clone(&state.store);
    let result =
        tokio::task::spawn_blocking(move || store.login(&body.username, &body.password)).await;
    match result {
        Ok(Ok((user, token))) => session_created_response(&user, &token),
        Ok(Err(e)) => e.into_response(),
        Err(e) => Error::Internal(anyhow::anyhow!("login task failed: {e}")).into_response(),
    }
}

/// GET /auth/logout — revoke the cookie-carried session.
///
/// Revoking an unknown or already-revoked token still succeeds; only a
/// request with no cookie at all is an error.
async fn handle_logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = parse_cookie(&headers, SESSION_COOKIE) else {
        return Error::validation("No session found").into_response();
    };
    if let Some(cache) = &state.cache {
        cache.invalidate(&hash_token(&token));
    }
    match state.store.logout(&token) {
        Ok(_) => {
            let mut response = (
                StatusCode::OK,
                Json(serde_json::json!({"status": "logged_out"})),
            )
                .into_response();
            if let Some(value) = clear_session_cookie() {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

/// GET /auth/me — current user for a valid session.
async fn handle_me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match require_session(&state, &headers) {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct KeysBody {
    keys: HashSet<String>,
}

/// PUT /api/me/keys — replace the caller's bearer-key set.
///
/// Keys are bearer strings: holding one IS the authorization, so users
/// manage their own keychain with keys they have been handed out-of-band.
async fn handle_set_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<KeysBody>, JsonRejection>,
) -> Response {
    let user = match require_session(&state, &headers) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return Error::validation(format!("Invalid request: {e}")).into_response(),
    };
    match state.store.set_user_keys(&user.id, &body.keys) {
        Ok(true) => {
            // This session's cached entry now carries stale keys; drop it.
            // Other sessions of the same user refresh within the cache TTL.
            if let (Some(cache), Some(token)) =
                (&state.cache, parse_cookie(&headers, SESSION_COOKIE))
            {
                cache.invalidate(&hash_token(&token));
            }
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "updated", "keys": body.keys})),
            )
                .into_response()
        }
        Ok(false) => Error::not_found("User not found").into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Device handlers ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct DeviceCreateBody {
    id: String,
    name: String,
    access: AccessTier,
    #[serde(default)]
    keys: HashSet<String>,
}

/// POST /api/devices — register a device for the authenticated user.
async fn handle_device_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<DeviceCreateBody>, JsonRejection>,
) -> Response {
    let user = match require_session(&state, &headers) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return Error::validation(format!("Invalid request: {e}")).into_response(),
    };
    match state
        .store
        .create_device(&user.id, &body.id, &body.name, body.access, &body.keys)
    {
        Ok(device) => (StatusCode::CREATED, Json(device)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/devices — list the authenticated user's devices.
async fn handle_devices_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match require_session(&state, &headers) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    match state.store.list_devices(&user.id) {
        Ok(devices) => (
            StatusCode::OK,
            Json(serde_json::json!({"devices": devices})),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/devices/{device_id} — remove an owned device and its macros.
async fn handle_device_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    let user = match require_session(&state, &headers) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    match state.store.delete_device(&user.id, &device_id) {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "deleted"})),
        )
            .into_response(),
        Ok(false) => Error::not_found("Device not found").into_response(),
        Err(e) => e.into_response(),
    }
}

/// Fetch a device, treating someone else's device the same as a missing one.
fn owned_device(
    state: &AppState,
    user: &User,
    device_id: &str,
) -> Result<crate::store::Device, Error> {
    match state.store.device(device_id)? {
        Some(device) if device.user_id == user.id => Ok(device),
        _ => Err(Error::not_found("Device not found")),
    }
}

// ── Macro handlers ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct MacroCreateBody {
    endpoint: String,
    access: AccessTier,
    #[serde(default)]
    keys: HashSet<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

/// POST /api/devices/{device_id}/macros — register a macro under an owned device.
async fn handle_macro_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    body: Result<Json<MacroCreateBody>, JsonRejection>,
) -> Response {
    let user = match require_session(&state, &headers) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return Error::validation(format!("Invalid request: {e}")).into_response(),
    };
    let device = match owned_device(&state, &user, &device_id) {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };
    match state.store.create_macro(
        &device.id,
        &body.endpoint,
        body.access,
        &body.keys,
        body.params.as_ref(),
    ) {
        Ok(m) => (StatusCode::CREATED, Json(m)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/devices/{device_id}/macros — list macros of an owned device.
async fn handle_macros_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Response {
    let user = match require_session(&state, &headers) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    let device = match owned_device(&state, &user, &device_id) {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };
    match state.store.list_macros(&device.id) {
        Ok(macros) => {
            (StatusCode::OK, Json(serde_json::json!({"macros": macros}))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/macros/{endpoint} — remove a macro from an owned device.
async fn handle_macro_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(endpoint): Path<String>,
) -> Response {
    let user = match require_session(&state, &headers) {
        Ok(u) => u,
        Err(e) => return e.into_response(),
    };
    match state.store.delete_macro(&user.id, &endpoint) {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "deleted"})),
        )
            .into_response(),
        Ok(false) => Error::not_found("Macro not found").into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Invocation ──────────────────────────────────────────────────────

/// GET /invoke/{endpoint} — fire a macro through the relay.
///
/// Anonymous callers are welcome and carry the empty key set; a session
/// cookie contributes the user's keys. The invocation must pass the access
/// gate for BOTH the macro and its owning device.
async fn handle_invoke(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(endpoint): Path<String>,
) -> Response {
    let actor_keys = session_user(&state, &headers)
        .map(|u| u.keys)
        .unwrap_or_default();

    let m = match state.store.macro_by_endpoint(&endpoint) {
        Ok(Some(m)) => m,
        Ok(None) => return Error::not_found("Macro not found").into_response(),
        Err(e) => return e.into_response(),
    };
    let device = match state.store.device(&m.device_id) {
        Ok(Some(d)) => d,
        Ok(None) => return Error::not_found("Macro not found").into_response(),
        Err(e) => return e.into_response(),
    };

    if !can_invoke(&actor_keys, device.access, &device.keys)
        || !can_invoke(&actor_keys, m.access, &m.keys)
    {
        return Error::unauthorized("Not permitted to invoke this macro").into_response();
    }

    tracing::info!(endpoint = %m.endpoint, device = %device.id, "relaying macro trigger");
    match state
        .trigger
        .fire(&device.id, &m.endpoint, m.params.as_ref())
        .await
    {
        Ok(upstream) => relay_response(upstream),
        Err(e) => e.into_response(),
    }
}

/// Rebuild the upstream response verbatim: status, content type, body.
fn relay_response(upstream: TriggerResponse) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(axum::body::Body::from(upstream.body));
    *response.status_mut() = status;
    if let Some(value) = upstream
        .content_type
        .and_then(|ct| HeaderValue::from_str(&ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

/// GET /health — liveness probe.
async fn handle_health() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn test_state() -> (AppState, MockServer) {
        let server = MockServer::start().await;
        let state = AppState {
            store: Arc::new(RelayStore::open_in_memory().unwrap()),
            cache: Some(Arc::new(SessionCache::with_ttl(300))),
            trigger: Arc::new(TriggerClient::new(server.uri(), Duration::from_secs(5)).unwrap()),
        };
        (state, server)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(c) = cookie {
            builder = builder.header(header::COOKIE, format!("{SESSION_COOKIE}={c}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn with_cookie(mut request: Request<Body>, cookie: &str) -> Request<Body> {
        request.headers_mut().insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE}={cookie}")).unwrap(),
        );
        request
    }

    /// Extract the session token from a Set-Cookie header.
    fn session_cookie(response: &Response) -> Option<String> {
        let raw = response.headers().get(header::SET_COOKIE)?.to_str().ok()?;
        let (name_value, _) = raw.split_once(';')?;
        let (name, value) = name_value.split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    }

    async fn sign_up(app: &Router, username: &str) -> String {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/signup",
                serde_json::json!({"username": username, "password": "pw1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        session_cookie(&response).expect("signup sets a session cookie")
    }

    #[tokio::test]
    async fn signup_sets_cookie_and_omits_password() {
        let (state, _server) = test_state().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/signup",
                serde_json::json!({"username": "alice", "password": "pw1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let raw_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(raw_cookie.starts_with("sessionId="));
        assert!(raw_cookie.contains("HttpOnly"));
        assert!(raw_cookie.contains("SameSite=Strict"));
        assert!(raw_cookie.contains("Max-Age=31536000"));
        assert!(raw_cookie.contains("Path=/"));

        let body = body_json(response).await;
        assert_eq!(body["name"], "alice");
        assert!(body.get("password").is_none());
        assert!(body.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn signup_with_missing_fields_is_400() {
        let (state, _server) = test_state().await;
        let app = router(state);

        for payload in [
            serde_json::json!({"username": "alice"}),
            serde_json::json!({"password": "pw1"}),
            serde_json::json!({}),
        ] {
            let response = app
                .clone()
                .oneshot(json_request("POST", "/auth/signup", payload))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn duplicate_signup_is_409() {
        let (state, _server) = test_state().await;
        let app = router(state);

        sign_up(&app, "alice").await;
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/signup",
                serde_json::json!({"username": "alice", "password": "other"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn login_status_codes_follow_the_contract() {
        let (state, _server) = test_state().await;
        let app = router(state);
        sign_up(&app, "alice").await;

        // Unknown user: 404.
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/login",
                serde_json::json!({"username": "ghost", "password": "pw1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Wrong password: 401.
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/login",
                serde_json::json!({"username": "alice", "password": "wrong"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Success: 201 with a fresh cookie.
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/login",
                serde_json::json!({"username": "alice", "password": "pw1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(session_cookie(&response).is_some());
    }

    #[tokio::test]
    async fn each_login_issues_a_distinct_token() {
        let (state, _server) = test_state().await;
        let app = router(state);

        let first = sign_up(&app, "alice").await;
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/auth/login",
                serde_json::json!({"username": "alice", "password": "pw1"}),
            ))
            .await
            .unwrap();
        let second = session_cookie(&response).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn logout_lifecycle_matches_the_contract() {
        let (state, _server) = test_state().await;
        let app = router(state);
        let token = sign_up(&app, "alice").await;

        // No cookie: 400.
        let response = app
            .clone()
            .oneshot(get_request("/auth/logout", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // With cookie: 200 + cookie cleared.
        let response = app
            .clone()
            .oneshot(get_request("/auth/logout", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cleared = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(cleared.contains("Max-Age=0"));

        // The token no longer resolves.
        let response = app
            .clone()
            .oneshot(get_request("/auth/me", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // A second logout with the dead token is still a success.
        let response = app
            .clone()
            .oneshot(get_request("/auth/logout", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn me_reflects_the_session_user() {
        let (state, _server) = test_state().await;
        let app = router(state);
        let token = sign_up(&app, "alice").await;

        let response = app
            .clone()
            .oneshot(get_request("/auth/me", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["name"], "alice");

        let response = app
            .clone()
            .oneshot(get_request("/auth/me", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn device_provisioning_requires_a_session() {
        let (state, _server) = test_state().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/devices",
                serde_json::json!({"id": "dev1", "name": "Living Room", "access": "SHARED"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn device_and_macro_provisioning_flow() {
        let (state, _server) = test_state().await;
        let app = router(state);
        let token = sign_up(&app, "alice").await;

        let response = app
            .clone()
            .oneshot(with_cookie(
                json_request(
                    "POST",
                    "/api/devices",
                    serde_json::json!({"id": "dev1", "name": "Living Room", "access": "SHARED"}),
                ),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(with_cookie(
                json_request(
                    "POST",
                    "/api/devices/dev1/macros",
                    serde_json::json!({
                        "endpoint": "lights_on",
                        "access": "SHARED",
                        "params": {"brightness": 80}
                    }),
                ),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(get_request("/api/devices", Some(&token)))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["devices"].as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(get_request("/api/devices/dev1/macros", Some(&token)))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["macros"][0]["endpoint"], "lights_on");
    }

    #[tokio::test]
    async fn macros_cannot_be_attached_to_someone_elses_device() {
        let (state, _server) = test_state().await;
        let app = router(state);
        let alice = sign_up(&app, "alice").await;
        let bob = sign_up(&app, "bob").await;

        let response = app
            .clone()
            .oneshot(with_cookie(
                json_request(
                    "POST",
                    "/api/devices",
                    serde_json::json!({"id": "dev1", "name": "Alice's", "access": "SHARED"}),
                ),
                &alice,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(with_cookie(
                json_request(
                    "POST",
                    "/api/devices/dev1/macros",
                    serde_json::json!({"endpoint": "evil", "access": "SHARED"}),
                ),
                &bob,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// Provision a device + macro for an invoke test.
    async fn provision(
        app: &Router,
        token: &str,
        device_access: &str,
        device_keys: serde_json::Value,
        macro_access: &str,
        macro_keys: serde_json::Value,
    ) {
        let response = app
            .clone()
            .oneshot(with_cookie(
                json_request(
                    "POST",
                    "/api/devices",
                    serde_json::json!({
                        "id": "dev1",
                        "name": "Living Room",
                        "access": device_access,
                        "keys": device_keys
                    }),
                ),
                token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(with_cookie(
                json_request(
                    "POST",
                    "/api/devices/dev1/macros",
                    serde_json::json!({
                        "endpoint": "lights_on",
                        "access": macro_access,
                        "keys": macro_keys,
                        "params": {"brightness": 80}
                    }),
                ),
                token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn shared_macro_is_invocable_anonymously_and_passes_through() {
        let (state, server) = test_state().await;
        let app = router(state);
        let token = sign_up(&app, "alice").await;
        provision(
            &app,
            &token,
            "SHARED",
            serde_json::json!([]),
            "SHARED",
            serde_json::json!([]),
        )
        .await;

        Mock::given(method("GET"))
            .and(path("/dev1/lights_on"))
            .and(query_param("brightness", "80"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fired"))
            .mount(&server)
            .await;

        let response = app
            .clone()
            .oneshot(get_request("/invoke/lights_on", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"fired");
    }

    #[tokio::test]
    async fn restricted_macro_requires_a_matching_key() {
        let (state, server) = test_state().await;
        let app = router(state);
        let token = sign_up(&app, "alice").await;
        provision(
            &app,
            &token,
            "SHARED",
            serde_json::json!([]),
            "RESTRICTED",
            serde_json::json!(["k1"]),
        )
        .await;

        Mock::given(method("GET"))
            .and(path("/dev1/lights_on"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        // Anonymous: no keys, denied.
        let response = app
            .clone()
            .oneshot(get_request("/invoke/lights_on", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Authenticated but holding the wrong key: denied.
        let response = app
            .clone()
            .oneshot(with_cookie(
                json_request("PUT", "/api/me/keys", serde_json::json!({"keys": ["k2"]})),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app
            .clone()
            .oneshot(get_request("/invoke/lights_on", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Holding the matching key: allowed.
        let response = app
            .clone()
            .oneshot(with_cookie(
                json_request(
                    "PUT",
                    "/api/me/keys",
                    serde_json::json!({"keys": ["k1", "k2"]}),
                ),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app
            .clone()
            .oneshot(get_request("/invoke/lights_on", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn device_none_tier_disables_all_its_macros() {
        let (state, _server) = test_state().await;
        let app = router(state);
        let token = sign_up(&app, "alice").await;
        provision(
            &app,
            &token,
            "NONE",
            serde_json::json!([]),
            "SHARED",
            serde_json::json!([]),
        )
        .await;

        let response = app
            .clone()
            .oneshot(get_request("/invoke/lights_on", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_endpoint_is_404() {
        let (state, _server) = test_state().await;
        let app = router(state);

        let response = app
            .clone()
            .oneshot(get_request("/invoke/nope", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upstream_errors_pass_through_verbatim() {
        let (state, server) = test_state().await;
        let app = router(state);
        let token = sign_up(&app, "alice").await;
        provision(
            &app,
            &token,
            "SHARED",
            serde_json::json!([]),
            "SHARED",
            serde_json::json!([]),
        )
        .await;

        Mock::given(method("GET"))
            .and(path("/dev1/lights_on"))
            .respond_with(ResponseTemplate::new(500).set_body_string("macro exploded"))
            .mount(&server)
            .await;

        let response = app
            .clone()
            .oneshot(get_request("/invoke/lights_on", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"macro exploded");
    }

    #[tokio::test]
    async fn health_is_public() {
        let (state, _server) = test_state().await;
        let app = router(state);
        let response = app
            .clone()
            .oneshot(get_request("/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
