//! Axum-based HTTP surface of the bridge.
//!
//! Browser extensions talk to this over localhost:
//! - `GET /health`, `GET /status`, `GET /oauth/start` for liveness probes
//! - `POST /explain` runs one correlated explain call
//! - `POST /abort` cancels an in-flight explain by request id
//!
//! Bodies are capped at 64KB and every request has an outer timeout a bit
//! longer than the explain deadline, so a stuck handler cannot pin a
//! connection forever.

use crate::bridge::{BridgeError, ExplainCoordinator, ExplainRequest, PollSettings};
use crate::channels;
use crate::config::Config;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Slack added on top of the explain deadline for the outer request timeout.
pub const REQUEST_TIMEOUT_GRACE_SECS: u64 = 15;
/// Reported by `/status` and `/oauth/start`.
pub const BRIDGE_MODE: &str = "openclaw-bridge";

/// Non-standard "client closed request" status used for aborted explains.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ExplainCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<ExplainCoordinator>) -> Self {
        Self { coordinator }
    }
}

/// Build the router with CORS, body limit and outer timeout applied.
pub fn build_router(state: AppState) -> Router {
    let outer_timeout =
        state.coordinator.settings().request_timeout + Duration::from_secs(REQUEST_TIMEOUT_GRACE_SECS);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/oauth/start", get(handle_oauth_start))
        .route(
            "/explain",
            post(handle_explain)
                .options(handle_options)
                .fallback(handle_method_not_allowed),
        )
        .route(
            "/abort",
            post(handle_abort)
                .options(handle_options)
                .fallback(handle_method_not_allowed),
        )
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            outer_timeout,
        ))
        .layer(cors)
}

/// Run the HTTP bridge until Ctrl+C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    let channel = channels::create_channel(&config.bridge);
    let coordinator = Arc::new(ExplainCoordinator::new(
        channel,
        PollSettings::from(&config.bridge),
    ));
    let app = build_router(AppState::new(coordinator));

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        mode = BRIDGE_MODE,
        session_key = %config.bridge.default_session_key,
        openclaw_bin = %config.bridge.openclaw_bin,
        "Bridge gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down bridge gateway");
        })
        .await
        .context("gateway server error")?;

    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

fn error_body(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(serde_json::json!({"ok": false, "error": message})),
    )
}

/// Map a terminal explain failure onto an HTTP status.
fn bridge_error_response(err: &BridgeError) -> (StatusCode, Json<Value>) {
    match err {
        BridgeError::InvalidRequest(message) => error_body(StatusCode::BAD_REQUEST, message),
        BridgeError::Canceled { .. } => error_body(client_closed_request(), "request canceled"),
        BridgeError::Timeout { .. } => error_body(StatusCode::GATEWAY_TIMEOUT, &err.to_string()),
        BridgeError::Submit(_) => error_body(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

/// GET /status
async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    Json(serde_json::json!({
        "ok": true,
        "connected": true,
        "mode": BRIDGE_MODE,
        "sessionKey": coordinator.settings().default_session_key,
        "inFlight": coordinator.registry().len(),
    }))
}

/// GET /oauth/start, kept for clients that still probe it
async fn handle_oauth_start() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "mode": BRIDGE_MODE,
        "message": "OAuth disabled in bridge mode",
    }))
}

/// Plain OPTIONS without preflight headers; real preflights are answered by
/// the CORS layer before routing.
async fn handle_options() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_method_not_allowed() -> impl IntoResponse {
    error_body(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

/// `/explain` request body. Absent and null fields read as blank.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExplainBody {
    pub text: Option<String>,
    pub session_key: Option<String>,
    pub user_language: Option<String>,
    pub request_id: Option<String>,
}

impl From<ExplainBody> for ExplainRequest {
    fn from(body: ExplainBody) -> Self {
        Self {
            text: body.text.unwrap_or_default(),
            session_key: body.session_key,
            user_language: body.user_language,
            request_id: body.request_id,
            deadline: None,
        }
    }
}

/// `/abort` request body.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AbortBody {
    pub request_id: Option<String>,
}

/// POST /explain
async fn handle_explain(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let parsed: ExplainBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Explain JSON parse error: {e}");
            return error_body(StatusCode::BAD_REQUEST, "invalid json");
        }
    };

    match state.coordinator.explain(parsed.into()).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "items": outcome.items,
                "requestId": outcome.request_id,
            })),
        ),
        Err(e) => bridge_error_response(&e),
    }
}

/// POST /abort. Succeeds whether or not the id was in flight.
async fn handle_abort(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let parsed: AbortBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!("Abort JSON parse error: {e}");
            return error_body(StatusCode::BAD_REQUEST, "invalid json");
        }
    };
    let Some(request_id) = parsed
        .request_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    else {
        return error_body(StatusCode::BAD_REQUEST, "missing requestId");
    };

    state.coordinator.abort(request_id);
    (StatusCode::OK, Json(serde_json::json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::coordinator::testing::ScriptedChannel;
    use crate::channels::ChatChannel;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state_with(channel: &Arc<ScriptedChannel>) -> AppState {
        let channel: Arc<dyn ChatChannel> = channel.clone();
        AppState::new(Arc::new(ExplainCoordinator::new(
            channel,
            PollSettings::default(),
        )))
    }

    async fn json_of(response: axum::response::Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = handle_health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn status_reports_mode_session_and_in_flight() {
        let state = state_with(&Arc::new(ScriptedChannel::default()));
        state.coordinator.registry().register(
            "RID-live",
            tokio_util::sync::CancellationToken::new(),
            "ext-transcript",
        );

        let parsed = json_of(handle_status(State(state)).await.into_response()).await;
        assert_eq!(parsed["connected"], true);
        assert_eq!(parsed["mode"], "openclaw-bridge");
        assert_eq!(parsed["sessionKey"], "ext-transcript");
        assert_eq!(parsed["inFlight"], 1);
    }

    #[tokio::test]
    async fn oauth_start_is_disabled() {
        let parsed = json_of(handle_oauth_start().await.into_response()).await;
        assert_eq!(parsed["message"], "OAuth disabled in bridge mode");
    }

    #[tokio::test(start_paused = true)]
    async fn explain_returns_items_and_request_id() {
        let state = state_with(&Arc::new(ScriptedChannel::replying_on_fetch(1)));
        let body = Bytes::from(r#"{"text":"食べる","requestId":"RID-http"}"#);

        let response = handle_explain(State(state), body).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let parsed = json_of(response).await;
        assert_eq!(parsed["ok"], true);
        assert_eq!(parsed["requestId"], "RID-http");
        assert_eq!(parsed["items"][0]["word"], "scripted");
    }

    #[tokio::test]
    async fn explain_rejects_invalid_json_and_blank_text() {
        let state = state_with(&Arc::new(ScriptedChannel::default()));

        let response = handle_explain(State(state.clone()), Bytes::from("{not json"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["error"], "invalid json");

        let response = handle_explain(State(state), Bytes::from(r#"{"text":"  "}"#))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let parsed = json_of(response).await;
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"], "missing text");
    }

    #[tokio::test(start_paused = true)]
    async fn explain_timeout_maps_to_gateway_timeout() {
        let state = state_with(&Arc::new(ScriptedChannel::default()));
        let response = handle_explain(
            State(state),
            Bytes::from(r#"{"text":"x","requestId":"RID-slow"}"#),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(json_of(response).await["error"]
            .as_str()
            .unwrap()
            .contains("RID-slow"));
    }

    #[tokio::test]
    async fn explain_submit_failure_maps_to_bad_gateway() {
        let state = state_with(&Arc::new(ScriptedChannel {
            fail_submit: true,
            ..ScriptedChannel::default()
        }));
        let response = handle_explain(State(state), Bytes::from(r#"{"text":"x"}"#))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_explain_with_499() {
        let channel = Arc::new(ScriptedChannel::default());
        let state = state_with(&channel);

        let explain = tokio::spawn(handle_explain(
            State(state.clone()),
            Bytes::from(r#"{"text":"x","requestId":"RID-stop"}"#),
        ));
        for _ in 0..100 {
            if state.coordinator.registry().contains("RID-stop") {
                break;
            }
            tokio::task::yield_now().await;
        }

        let response = handle_abort(
            State(state.clone()),
            Bytes::from(r#"{"requestId":" RID-stop "}"#),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = explain.await.unwrap().into_response();
        assert_eq!(response.status().as_u16(), 499);
        assert_eq!(json_of(response).await["error"], "request canceled");
        assert!(state.coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn abort_validates_body_and_ignores_unknown_ids() {
        let state = state_with(&Arc::new(ScriptedChannel::default()));

        let response = handle_abort(State(state.clone()), Bytes::from("[]"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_abort(State(state.clone()), Bytes::from("{}"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_of(response).await["error"], "missing requestId");

        let response = handle_abort(State(state), Bytes::from(r#"{"requestId":"RID-none"}"#))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_of(response).await, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn wrong_method_is_405_json() {
        let app = build_router(state_with(&Arc::new(ScriptedChannel::default())));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/explain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let parsed = json_of(response).await;
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"], "method not allowed");
    }

    #[tokio::test]
    async fn plain_options_gets_no_content() {
        let app = build_router(state_with(&Arc::new(ScriptedChannel::default())));
        for uri in ["/explain", "/abort"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method(Method::OPTIONS)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT, "{uri}");
        }
    }

    #[tokio::test]
    async fn cors_preflight_is_answered() {
        let app = build_router(state_with(&Arc::new(ScriptedChannel::default())));
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/explain")
                    .header(header::ORIGIN, "chrome-extension://abc")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn router_serves_health_with_cors_header() {
        let app = build_router(state_with(&Arc::new(ScriptedChannel::default())));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "chrome-extension://abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let app = build_router(state_with(&Arc::new(ScriptedChannel::default())));
        let text = "a".repeat(MAX_BODY_SIZE + 1);
        let response = app
            .oneshot(post_json("/explain", &format!(r#"{{"text":"{text}"}}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
