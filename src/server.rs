use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ip_extraction::{extract_client_ip, IpExtractionConfig, IpSource};
use crate::mcp_integrity::{McpIntegrityVerifier, McpResponse};
use crate::rate_limiter::{rate_limit_headers, RateLimitConfig, RateLimitResult, RateLimiter};
use crate::session::{
    SessionBinding, SessionManager, SessionOptions, SessionPayload, ValidationContext,
};
use crate::time_utils::now_millis;

pub const SESSION_TOKEN_HEADER: &str = "x-session-token";
pub const CSRF_TOKEN_HEADER: &str = "x-csrf-token";

/// Largest JSON body accepted on `/api/*`
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// Services shared by every request
pub struct AppState {
    pub rate_limiter: RateLimiter,
    pub sessions: Arc<SessionManager>,
    pub mcp: McpIntegrityVerifier,
    pub ip_config: IpExtractionConfig,
    /// Budget for every `/api/*` route, keyed by client IP
    pub api_limit: RateLimitConfig,
    /// Budget for session creation; shares the per-IP window but fails closed
    pub session_create_limit: RateLimitConfig,
    pub binding: SessionBinding,
    pub strict_binding: bool,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        config: &Config,
        rate_limiter: RateLimiter,
        sessions: Arc<SessionManager>,
        mcp: McpIntegrityVerifier,
    ) -> Self {
        let window = config.server.api_window_secs;
        Self {
            rate_limiter,
            sessions,
            mcp,
            ip_config: IpExtractionConfig::default(),
            api_limit: RateLimitConfig::new(config.server.api_limit, window).with_reputation(),
            session_create_limit: RateLimitConfig::new(config.server.session_create_limit, window)
                .fail_closed()
                .with_reputation(),
            binding: SessionBinding::from(&config.session),
            strict_binding: config.session.strict_binding,
            started_at: Instant::now(),
        }
    }
}

/// Per-request data pulled from headers once
struct RequestContext {
    client_ip: IpSource,
    user_agent: Option<String>,
}

impl RequestContext {
    fn from_headers(ip_config: &IpExtractionConfig, headers: &HeaderMap) -> Self {
        let pairs: Vec<(String, String)> = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            client_ip: extract_client_ip(ip_config, &pairs),
            user_agent: header_str(headers, USER_AGENT.as_str()),
        }
    }

    /// The client IP only when a header actually supplied one
    fn known_ip(&self) -> Option<String> {
        match &self.client_ip {
            IpSource::Header { ip, .. } => Some(ip.clone()),
            IpSource::Unknown => None,
        }
    }

    /// The identifier checked against a bound session; a missing header reads as "unknown"
    fn binding_ip(&self) -> Option<String> {
        Some(self.client_ip.ip().to_string())
    }
}

/// Handle incoming HTTP requests
pub async fn handle_request(
    state: Arc<AppState>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("{} {}", method, path);

    if !path.starts_with("/api/") {
        return Ok(match (&method, path.as_str()) {
            (&Method::GET, "/health") => handle_health(&state),
            _ => handle_not_found(&method, &path),
        });
    }

    let ctx = RequestContext::from_headers(&state.ip_config, req.headers());
    let limit = if method == Method::POST && path == "/api/session" {
        &state.session_create_limit
    } else {
        &state.api_limit
    };

    let verdict = state.rate_limiter.rate_limit(ctx.client_ip.ip(), limit).await;
    if !verdict.success {
        return Ok(too_many_requests(&verdict));
    }

    let mut response = match (&method, path.as_str()) {
        (&Method::POST, "/api/session") => handle_create_session(&state, &ctx, req).await,
        (&Method::GET, "/api/session") => handle_get_session(&state, &ctx, req.headers()).await,
        (&Method::DELETE, "/api/session") => {
            handle_destroy_session(&state, &ctx, req.headers()).await
        }
        (&Method::POST, "/api/mcp/verify") => handle_mcp_verify(&state, req).await,
        _ => handle_not_found(&method, &path),
    };

    apply_rate_limit_headers(response.headers_mut(), &verdict);
    Ok(response)
}

/// Health check endpoint - JSON response
fn handle_health(state: &AppState) -> Response<Body> {
    let health = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "store": if state.rate_limiter.has_store() { "redis" } else { "memory" },
        "mcp_servers": state.mcp.list_servers().len(),
    });
    json_response(StatusCode::OK, &health)
}

async fn handle_create_session(
    state: &AppState,
    ctx: &RequestContext,
    req: Request<Body>,
) -> Response<Body> {
    let payload: SessionPayload = match read_json(req).await {
        Ok(Some(payload)) => payload,
        Ok(None) => SessionPayload::default(),
        Err(response) => return response,
    };

    let options = SessionOptions {
        expiry_seconds: None,
        client_ip: ctx.known_ip(),
        user_agent: ctx.user_agent.clone(),
        binding: Some(state.binding),
    };

    match state.sessions.create_session(payload, options).await {
        Ok(created) => json_response(StatusCode::CREATED, &created),
        Err(e) => {
            error!("Session creation failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not create session")
        }
    }
}

async fn handle_get_session(
    state: &AppState,
    ctx: &RequestContext,
    headers: &HeaderMap,
) -> Response<Body> {
    let Some(token) = header_str(headers, SESSION_TOKEN_HEADER) else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing session token");
    };

    let validation = ValidationContext {
        client_ip: ctx.binding_ip(),
        user_agent: ctx.user_agent.clone(),
        strict_binding: state.strict_binding,
    };

    match state.sessions.validate_session(&token, &validation).await {
        Some(session) => json_response(StatusCode::OK, &session),
        None => error_response(StatusCode::UNAUTHORIZED, "Invalid or expired session"),
    }
}

async fn handle_destroy_session(
    state: &AppState,
    ctx: &RequestContext,
    headers: &HeaderMap,
) -> Response<Body> {
    let Some(token) = header_str(headers, SESSION_TOKEN_HEADER) else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing session token");
    };

    let validation = ValidationContext {
        client_ip: ctx.binding_ip(),
        user_agent: ctx.user_agent.clone(),
        strict_binding: state.strict_binding,
    };
    if state.sessions.validate_session(&token, &validation).await.is_none() {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid or expired session");
    }

    let csrf = header_str(headers, CSRF_TOKEN_HEADER).unwrap_or_default();
    if !state.sessions.validate_csrf(&token, &csrf).await {
        warn!("CSRF token mismatch on session destroy from {}", ctx.client_ip.ip());
        return error_response(StatusCode::FORBIDDEN, "Invalid CSRF token");
    }

    state.sessions.destroy_session(&token).await;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

async fn handle_mcp_verify(state: &AppState, req: Request<Body>) -> Response<Body> {
    let mcp_response: McpResponse = match read_json(req).await {
        Ok(Some(r)) => r,
        Ok(None) => return error_response(StatusCode::BAD_REQUEST, "Missing MCP response body"),
        Err(response) => return response,
    };

    let report = state.mcp.verify(&mcp_response);
    if report.valid {
        json_response(StatusCode::OK, &serde_json::json!({ "data": mcp_response.data }))
    } else {
        json_response(StatusCode::UNPROCESSABLE_ENTITY, &report)
    }
}

/// 404 handler
fn handle_not_found(method: &Method, path: &str) -> Response<Body> {
    warn!("404 Not Found: {} {}", method, path);
    error_response(StatusCode::NOT_FOUND, "Not found")
}

fn too_many_requests(verdict: &RateLimitResult) -> Response<Body> {
    let retry_after = verdict.retry_after_secs(now_millis());
    debug!("Rate limited, retry after {}s", retry_after);

    let mut body = serde_json::json!({
        "error": "Too many requests",
        "retryAfter": retry_after,
    });
    if let Some(reputation) = &verdict.reputation {
        body["reputation"] = serde_json::to_value(reputation).unwrap_or_default();
    }

    let mut response = json_response(StatusCode::TOO_MANY_REQUESTS, &body);
    apply_rate_limit_headers(response.headers_mut(), verdict);
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, verdict: &RateLimitResult) {
    for (name, value) in rate_limit_headers(verdict) {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("Dropping unrepresentable {} header", name),
        }
    }
}

/// Parse an optional JSON body; an empty body reads as `None`
async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Body>,
) -> Result<Option<T>, Response<Body>> {
    let declared = req
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > MAX_BODY_BYTES) {
        return Err(error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"));
    }

    let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|e| {
        warn!("Failed to read request body: {}", e);
        error_response(StatusCode::BAD_REQUEST, "Unreadable request body")
    })?;

    if bytes.len() as u64 > MAX_BODY_BYTES {
        return Err(error_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"));
    }
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        debug!("Rejected malformed JSON body: {}", e);
        error_response(StatusCode::BAD_REQUEST, "Malformed JSON body")
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let (status, text) = match serde_json::to_string(body) {
        Ok(text) => (status, text),
        Err(e) => {
            error!("Failed to serialize response body: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"Internal error"}"#.to_string())
        }
    };

    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &serde_json::json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;
    use crate::kv_store::MemoryStore;
    use crate::mcp_integrity::{compute_signature, McpServer, McpServerType};
    use crate::session_crypto::SessionCipher;

    fn state_with(config: Config) -> Arc<AppState> {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(&RateLimitSettings::default()).with_store(store.clone());
        let cipher = SessionCipher::from_secret("server-test-secret").unwrap();
        let sessions = Arc::new(SessionManager::new(store, cipher, 3600));
        let mcp = McpIntegrityVerifier::default();
        mcp.register_server(McpServer::new("docs", McpServerType::Http).with_shared_secret("k"));
        Arc::new(AppState::new(&config, limiter, sessions, mcp))
    }

    fn state() -> Arc<AppState> {
        state_with(Config::default())
    }

    /// Helper to create a test request
    fn request(method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(state: &Arc<AppState>, ip: &str) -> (String, String) {
        let req = request(
            Method::POST,
            "/api/session",
            &[("x-forwarded-for", ip)],
            r#"{"userId":"u-1","email":"u1@example.com"}"#,
        );
        let response = handle_request(state.clone(), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        (
            json["sessionToken"].as_str().unwrap().to_string(),
            json["csrfToken"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn test_health_endpoint_returns_json() {
        let response = handle_request(state(), request(Method::GET, "/health", &[], ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "application/json");
        assert!(response.headers().get("x-ratelimit-limit").is_none());

        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["store"], "redis");
        assert_eq!(json["mcp_servers"], 1);
    }

    #[tokio::test]
    async fn test_unknown_route_404() {
        let response = handle_request(state(), request(Method::GET, "/nope", &[], ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let state = state();
        let (token, csrf) = create(&state, "203.0.113.9").await;

        let get = request(Method::GET, "/api/session", &[("x-session-token", &token)], "");
        let response = handle_request(state.clone(), get).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
        assert_eq!(body_json(response).await["userId"], "u-1");

        let bad_csrf = request(
            Method::DELETE,
            "/api/session",
            &[("x-session-token", &token), ("x-csrf-token", "forged")],
            "",
        );
        let response = handle_request(state.clone(), bad_csrf).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let delete = request(
            Method::DELETE,
            "/api/session",
            &[("x-session-token", &token), ("x-csrf-token", &csrf)],
            "",
        );
        let response = handle_request(state.clone(), delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let get = request(Method::GET, "/api/session", &[("x-session-token", &token)], "");
        let response = handle_request(state.clone(), get).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let response = handle_request(state(), request(Method::GET, "/api/session", &[], ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let req = request(Method::POST, "/api/session", &[], "{not json");
        let response = handle_request(state(), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ip_binding_enforced() {
        let mut config = Config::default();
        config.session.bind_ip = true;
        let state = state_with(config);
        let (token, _) = create(&state, "203.0.113.10").await;

        let elsewhere = request(
            Method::GET,
            "/api/session",
            &[("x-session-token", &token), ("x-forwarded-for", "198.51.100.1")],
            "",
        );
        let response = handle_request(state.clone(), elsewhere).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let same = request(
            Method::GET,
            "/api/session",
            &[("x-session-token", &token), ("x-forwarded-for", "203.0.113.10")],
            "",
        );
        let response = handle_request(state.clone(), same).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ip_bound_session_rejected_without_forwarding_headers() {
        let mut config = Config::default();
        config.session.bind_ip = true;
        let state = state_with(config);
        let (token, csrf) = create(&state, "203.0.113.10").await;

        let bare = request(Method::GET, "/api/session", &[("x-session-token", &token)], "");
        let response = handle_request(state.clone(), bare).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bare_delete = request(
            Method::DELETE,
            "/api/session",
            &[("x-session-token", &token), ("x-csrf-token", &csrf)],
            "",
        );
        let response = handle_request(state.clone(), bare_delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Session survives the rejected attempts
        let same = request(
            Method::GET,
            "/api/session",
            &[("x-session-token", &token), ("x-forwarded-for", "203.0.113.10")],
            "",
        );
        let response = handle_request(state.clone(), same).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_session_creation_rate_limited() {
        let mut config = Config::default();
        config.server.session_create_limit = 2;
        let state = state_with(config);

        create(&state, "192.0.2.50").await;
        create(&state, "192.0.2.50").await;

        let req = request(Method::POST, "/api/session", &[("x-forwarded-for", "192.0.2.50")], "");
        let response = handle_request(state.clone(), req).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(response.headers().get("x-ratelimit-reputation").unwrap(), "unknown");

        // Another client is unaffected
        create(&state, "192.0.2.51").await;
    }

    #[tokio::test]
    async fn test_mcp_verify_endpoint() {
        let state = state();
        let mut message = McpResponse {
            server: "docs".to_string(),
            method: "resources/read".to_string(),
            data: serde_json::json!({"title": "hello"}),
            timestamp: now_millis(),
            signature: None,
            nonce: Some("n-1".to_string()),
        };
        message.signature = Some(compute_signature(b"k", &message));
        let body = serde_json::to_string(&message).unwrap();

        let response = handle_request(state.clone(), request(Method::POST, "/api/mcp/verify", &[], &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["title"], "hello");

        // Same nonce again
        let response = handle_request(state.clone(), request(Method::POST, "/api/mcp/verify", &[], &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let report = body_json(response).await;
        assert_eq!(report["valid"], false);
        assert_eq!(report["checks"]["nonceValid"], false);
    }
}
