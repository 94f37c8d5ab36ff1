//! # HTTP API
//!
//! Builds the axum router that exposes the authentication server's HTTP
//! interface. All endpoints share application state through axum's `State`
//! extractor.
//!
//! ## Endpoints
//!
//! | Method | Path            | Description                                 |
//! |--------|-----------------|---------------------------------------------|
//! | GET    | `/health`       | Liveness probe                              |
//! | GET    | `/urls`         | Mint a login URL bundle for the caller      |
//! | POST   | `/sqrl`         | SQRL protocol exchange endpoint             |
//! | GET    | `/authenticate` | Redeem an out-of-band code into a session   |
//! | GET    | `/loggedin`     | Current session info                        |
//! | POST   | `/logout`       | Terminate the current session               |

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use sqrl_protocol::{SqrlHandler, UrlBuilder};

use crate::metrics::SharedMetrics;

/// Name of the browser session cookie.
const SESSION_COOKIE: &str = "user";

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// A logged-in browser session, keyed by its cookie token.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: Uuid,
    pub created: DateTime<Utc>,
}

/// Shared application state available to all request handlers.
///
/// Cheap to clone — everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The server's reported version string.
    pub version: String,
    /// The SQRL protocol exchange handler.
    pub handler: Arc<SqrlHandler>,
    /// Mints login URL bundles and redeems out-of-band codes.
    pub urls: Arc<UrlBuilder>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
    /// Live browser sessions, cookie token -> session.
    pub sessions: Arc<DashMap<String, Session>>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
///
/// The returned router is ready to be served on the configured API port.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/urls", get(urls_handler))
        .route("/sqrl", post(sqrl_handler))
        .route("/authenticate", get(authenticate_handler))
        .route("/loggedin", get(loggedin_handler))
        .route("/logout", post(logout_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Query parameters for `POST /sqrl`.
#[derive(Debug, Deserialize)]
pub struct SqrlQuery {
    /// The nut the client is answering. The protocol engine handles its
    /// absence; the HTTP layer only forwards it.
    pub nut: Option<String>,
}

/// Query parameters for `GET /authenticate`.
#[derive(Debug, Deserialize)]
pub struct AuthenticateQuery {
    pub code: Option<String>,
}

/// Response payload for `GET /loggedin`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    /// Account the session belongs to.
    pub user_id: Uuid,
    /// When the session was established.
    pub logged_in_at: DateTime<Utc>,
}

/// Generic error body returned by REST endpoints on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — returns 200 if the server is alive.
///
/// This is the liveness probe for orchestrators (k8s, systemd, etc.).
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "version": state.version })),
    )
}

/// `GET /urls` — mints a fresh login URL bundle for the calling browser.
///
/// The bundle's nut is bound to the caller's address; the same address must
/// later redeem the poll code.
async fn urls_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ip = client_ip(&headers, addr);
    match state.urls.create_urls(ip).await {
        Ok(urls) => {
            state.metrics.urls_issued_total.inc();
            Json(urls).into_response()
        }
        Err(e) => {
            tracing::error!("failed to create login urls: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "failed to create login urls".into(),
                }),
            )
                .into_response()
        }
    }
}

/// `POST /sqrl` — the SQRL protocol exchange endpoint.
///
/// Always answers 200 with a base64url protocol pack; failures are conveyed
/// in-band via `tif` flags, never as HTTP errors. SQRL clients expect the
/// reply as `application/x-www-form-urlencoded`.
async fn sqrl_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<SqrlQuery>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let ip = client_ip(&headers, addr);
    let nut = query.nut.unwrap_or_default();

    let timer = state.metrics.exchange_duration_seconds.start_timer();
    let reply = state.handler.handle(ip, &nut, &body).await;
    timer.observe_duration();
    state.metrics.exchanges_total.inc();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-www-form-urlencoded")],
        reply,
    )
}

/// `GET /authenticate` — redeems an out-of-band code into a browser session.
///
/// On success, sets the session cookie and redirects (302) to the configured
/// success URL. Any failure is a plain 404: codes are unguessable, so
/// distinguishing failure modes would only help an attacker probe.
async fn authenticate_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<AuthenticateQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ip = client_ip(&headers, addr);
    let code = query.code.unwrap_or_default();
    tracing::info!(code, %ip, "authenticate");

    match state.urls.use_code(&code, ip).await {
        Ok(Some(account)) => {
            let token = Uuid::new_v4().to_string();
            state.sessions.insert(
                token.clone(),
                Session {
                    user_id: account.id,
                    created: Utc::now(),
                },
            );
            state.metrics.codes_redeemed_total.inc();
            state.metrics.active_sessions.inc();
            tracing::info!(user_id = %account.id, "session established");

            (
                StatusCode::FOUND,
                [
                    (header::SET_COOKIE, session_cookie(&token)),
                    (
                        header::LOCATION,
                        state.handler.config().success_url.clone(),
                    ),
                ],
            )
                .into_response()
        }
        Ok(None) => {
            state.metrics.codes_rejected_total.inc();
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            tracing::error!("code redemption failed: {}", e);
            state.metrics.codes_rejected_total.inc();
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// `GET /loggedin` — returns the caller's session, or 401 without one.
async fn loggedin_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let session = session_token(&headers)
        .and_then(|token| state.sessions.get(&token).map(|s| s.value().clone()));

    match session {
        Some(session) => Json(SessionResponse {
            user_id: session.user_id,
            logged_in_at: session.created,
        })
        .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "not logged in".into(),
            }),
        )
            .into_response(),
    }
}

/// `POST /logout` — drops the caller's session and expires the cookie.
///
/// Idempotent: logging out without a session still answers 200 with an
/// expired cookie.
async fn logout_handler(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(token) = session_token(&headers) {
        if state.sessions.remove(&token).is_some() {
            state.metrics.active_sessions.dec();
        }
    }

    (
        StatusCode::OK,
        [(header::SET_COOKIE, expired_session_cookie())],
        Json(serde_json::json!({ "status": "ok" })),
    )
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve the client's address, preferring `X-Forwarded-For` over the
/// socket peer. Deployments terminate TLS at a proxy; the socket address
/// would otherwise pin every nut to the proxy.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| addr.ip())
}

/// Extract the session token from the request's cookies.
fn session_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';')
        .map(str::trim)
        .filter_map(|kv| kv.split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Build the `Set-Cookie` value for a fresh session.
fn session_cookie(token: &str) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict")
}

/// Build the `Set-Cookie` value that expires the session cookie.
fn expired_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use sqrl_protocol::{pack, MemoryStore, SqrlConfig, SqrlStore};
    use tower::ServiceExt;

    /// Creates a test AppState backed by a shared in-memory store.
    fn test_app_state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = SqrlConfig::new("https://example.com", "api-test-secret").unwrap();
        let handler = Arc::new(SqrlHandler::new(
            config.clone(),
            Arc::clone(&store) as Arc<dyn SqrlStore>,
        ));
        let urls = Arc::new(UrlBuilder::new(
            config,
            Arc::clone(&store) as Arc<dyn SqrlStore>,
        ));
        let metrics = Arc::new(crate::metrics::ServerMetrics::new());

        (
            AppState {
                version: "0.1.0-test".into(),
                handler,
                urls,
                metrics,
                sessions: Arc::new(DashMap::new()),
            },
            store,
        )
    }

    fn socket(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 41234)
    }

    /// Sends a GET request from the given peer address and returns
    /// (status, headers, body_bytes).
    async fn get_from(
        router: &Router,
        path: &str,
        ip: &str,
        extra: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, Vec<u8>) {
        let mut builder = Request::builder()
            .uri(path)
            .extension(ConnectInfo(socket(ip)));
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        let req = builder.body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, headers, body)
    }

    /// Sends a POST request with a raw body and returns (status, headers,
    /// body_bytes).
    async fn post_from(
        router: &Router,
        path: &str,
        ip: &str,
        body: &str,
        extra: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, Vec<u8>) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/x-www-form-urlencoded")
            .extension(ConnectInfo(socket(ip)));
        for (name, value) in extra {
            builder = builder.header(*name, *value);
        }
        let req = builder.body(Body::from(body.to_string())).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, headers, body)
    }

    /// Marks a url bundle's root nut as authenticated for a fresh account,
    /// simulating a completed SQRL exchange.
    async fn identify_nut(store: &Arc<MemoryStore>, nut_id: &str) -> Uuid {
        let account = store.create_account().await.unwrap();
        let mut nut = store.retrieve_nut(nut_id).await.unwrap().unwrap();
        nut.identified = Some(Utc::now());
        nut.user_id = Some(account.id);
        store.update_nut(&nut).await.unwrap();
        account.id
    }

    fn poll_code(urls: &sqrl_protocol::urls::SqrlUrls) -> String {
        urls.poll.split("code=").nth(1).unwrap().to_string()
    }

    // -- 1. Health endpoint ---------------------------------------------------

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (state, _) = test_app_state();
        let router = create_router(state);
        let (status, _, body) = get_from(&router, "/health", "127.0.0.1", &[]).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], "0.1.0-test");
    }

    // -- 2. URL bundle issuance -----------------------------------------------

    #[tokio::test]
    async fn urls_endpoint_issues_bundle() {
        let (state, _) = test_app_state();
        let metrics = Arc::clone(&state.metrics);
        let router = create_router(state);

        let (status, _, body) = get_from(&router, "/urls", "192.0.2.7", &[]).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let login = json["login"].as_str().unwrap();
        assert!(login.starts_with("sqrl://example.com/sqrl?nut="));
        assert_eq!(json["success"], "https://example.com/loggedin");
        assert!(json["poll"].as_str().unwrap().contains("code=off-"));
        assert_eq!(metrics.urls_issued_total.get(), 1);
    }

    // -- 3. Protocol endpoint answers in-band ---------------------------------

    #[tokio::test]
    async fn sqrl_endpoint_always_answers_in_protocol_form() {
        let (state, _) = test_app_state();
        let router = create_router(state);

        // Garbage in: the reply is still HTTP 200 with a protocol pack.
        let (status, headers, body) =
            post_from(&router, "/sqrl?nut=unknown", "192.0.2.7", "not-a-pack", &[]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );

        let reply = String::from_utf8(body).unwrap();
        let decoded = pack::from_base64url_utf8(&reply).unwrap();
        assert!(decoded.contains("tif="));
        assert!(decoded.starts_with("ver=1\r\n"));
    }

    // -- 4. Unknown code is a 404 ---------------------------------------------

    #[tokio::test]
    async fn authenticate_rejects_unknown_code() {
        let (state, _) = test_app_state();
        let metrics = Arc::clone(&state.metrics);
        let router = create_router(state);

        let (status, _, _) =
            get_from(&router, "/authenticate?code=off-nope", "192.0.2.7", &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = get_from(&router, "/authenticate", "192.0.2.7", &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(metrics.codes_rejected_total.get(), 2);
    }

    // -- 5. Full session lifecycle --------------------------------------------

    #[tokio::test]
    async fn authenticate_establishes_session_and_logout_ends_it() {
        let (state, store) = test_app_state();
        let url_builder = Arc::clone(&state.urls);
        let metrics = Arc::clone(&state.metrics);
        let router = create_router(state);

        let ip = "192.0.2.7";
        let urls = url_builder.create_urls(ip.parse().unwrap()).await.unwrap();
        let code = poll_code(&urls);
        let nut_id = code.strip_prefix("off-").unwrap();
        let user_id = identify_nut(&store, nut_id).await;

        // Redemption: 302 to the success URL with a session cookie.
        let (status, headers, _) =
            get_from(&router, &format!("/authenticate?code={code}"), ip, &[]).await;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(
            headers.get(header::LOCATION).unwrap(),
            "https://example.com/loggedin"
        );
        let cookie = headers
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("user="));
        assert_eq!(metrics.active_sessions.get(), 1);

        // The cookie identifies the session.
        let cookie_pair = cookie.split(';').next().unwrap();
        let (status, _, body) =
            get_from(&router, "/loggedin", ip, &[("cookie", cookie_pair)]).await;
        assert_eq!(status, StatusCode::OK);
        let session: SessionResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(session.user_id, user_id);

        // Logout expires the cookie and drops the session.
        let (status, headers, _) =
            post_from(&router, "/logout", ip, "", &[("cookie", cookie_pair)]).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));
        assert_eq!(metrics.active_sessions.get(), 0);

        let (status, _, _) = get_from(&router, "/loggedin", ip, &[("cookie", cookie_pair)]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // -- 6. No session is 401 -------------------------------------------------

    #[tokio::test]
    async fn loggedin_without_session_is_unauthorized() {
        let (state, _) = test_app_state();
        let router = create_router(state);

        let (status, _, body) = get_from(&router, "/loggedin", "192.0.2.7", &[]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.error.contains("not logged in"));
    }

    // -- 7. Codes redeem once -------------------------------------------------

    #[tokio::test]
    async fn authenticate_is_single_use() {
        let (state, store) = test_app_state();
        let url_builder = Arc::clone(&state.urls);
        let router = create_router(state);

        let ip = "192.0.2.7";
        let urls = url_builder.create_urls(ip.parse().unwrap()).await.unwrap();
        let code = poll_code(&urls);
        identify_nut(&store, code.strip_prefix("off-").unwrap()).await;

        let path = format!("/authenticate?code={code}");
        let (status, _, _) = get_from(&router, &path, ip, &[]).await;
        assert_eq!(status, StatusCode::FOUND);

        let (status, _, _) = get_from(&router, &path, ip, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // -- 8. Proxy header wins over socket address -----------------------------

    #[tokio::test]
    async fn forwarded_header_overrides_socket_address() {
        let (state, store) = test_app_state();
        let url_builder = Arc::clone(&state.urls);
        let router = create_router(state);

        let real_ip = "203.0.113.9";
        let urls = url_builder
            .create_urls(real_ip.parse().unwrap())
            .await
            .unwrap();
        let code = poll_code(&urls);
        identify_nut(&store, code.strip_prefix("off-").unwrap()).await;

        // Socket peer is the proxy, the forwarded header names the browser.
        let (status, _, _) = get_from(
            &router,
            &format!("/authenticate?code={code}"),
            "127.0.0.1",
            &[("x-forwarded-for", real_ip)],
        )
        .await;
        assert_eq!(status, StatusCode::FOUND);
    }

    // -- 9. Cookie parsing ----------------------------------------------------

    #[test]
    fn session_token_parses_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "a=b; user=tok-123; c=d".parse().unwrap());
        assert_eq!(session_token(&headers), Some("tok-123".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "a=b; c=d".parse().unwrap());
        assert_eq!(session_token(&headers), None);

        assert_eq!(session_token(&HeaderMap::new()), None);
    }
}
