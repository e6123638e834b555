//! Whatsflow HTTP REST API
//!
//! Axum server for session management, connector commands, the connector
//! status callback and webhook configuration. Every route is also mounted
//! under `/api`, where connectors post their callbacks.
//!
//! Architecture: each endpoint has a thin axum handler that delegates to an
//! inner function returning `(StatusCode, Value)`. Inner functions take the
//! shared state directly and are tested without axum dispatch.
//!
//! Endpoints:
//! - GET  /health, /version
//! - GET|POST /sessions, GET|PUT|DELETE /sessions/:id
//! - POST /sessions/:id/restart, /sessions/:id/status
//! - POST /sessions/:id/{send-text,send-image,send-document,send-audio,seen,typing}
//! - GET  /sessions/:id/webhooks?event=, /sessions/:id/process
//! - GET|POST /webhooks, GET|PUT|DELETE /webhooks/:id

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use whatsflow_core::config::HttpConfig;
use whatsflow_core::models::{SessionPatch, WebhookPatch};
use whatsflow_core::{
    AddressAllocator, CommandKind, SessionId, SessionStore, WebhookId, WhatsflowConfig,
    WhatsflowError,
};

use crate::subsystems::ingest::CALLBACK_TOKEN_HEADER;
use crate::subsystems::supervisor::ExitReceiver;
use crate::subsystems::{
    CommandRouter, ConnectorSupervisor, CreateWebhook, SessionRegistry, StatusIngestor,
    StatusUpdate, WebhookConfigService,
};

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub store: Arc<dyn SessionStore>,
    pub supervisor: Arc<ConnectorSupervisor>,
    pub registry: Arc<SessionRegistry>,
    pub commands: CommandRouter,
    pub ingestor: StatusIngestor,
    pub webhooks: WebhookConfigService,
}

impl HttpState {
    /// Wire every subsystem over `store`. The returned receiver carries
    /// connector exits and must be handed to `run_exit_monitor`.
    pub fn build(
        store: Arc<dyn SessionStore>,
        config: &WhatsflowConfig,
    ) -> whatsflow_core::Result<(Arc<Self>, ExitReceiver)> {
        let allocator = AddressAllocator::from_config(&config.connector);
        let (supervisor, exits) = ConnectorSupervisor::new(
            config.connector.clone(),
            config.supervisor.clone(),
            allocator.clone(),
        );
        let supervisor = Arc::new(supervisor);
        let registry = Arc::new(SessionRegistry::new(store.clone(), supervisor.clone()));
        let commands = CommandRouter::new(registry.clone(), allocator, config.router.clone())?;
        let ingestor =
            StatusIngestor::new(registry.clone(), supervisor.clone(), config.callback.clone());
        let webhooks = WebhookConfigService::new(store.clone());

        let state = Self {
            store,
            supervisor,
            registry,
            commands,
            ingestor,
            webhooks,
        };
        Ok((Arc::new(state), exits))
    }
}

fn routes() -> Router<Arc<HttpState>> {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/sessions", get(list_sessions_handler).post(create_session_handler))
        .route(
            "/sessions/:id",
            get(get_session_handler)
                .put(update_session_handler)
                .delete(delete_session_handler),
        )
        .route("/sessions/:id/restart", post(restart_session_handler))
        .route("/sessions/:id/status", post(status_callback_handler))
        .route("/sessions/:id/process", get(process_handler))
        .route("/sessions/:id/webhooks", get(subscribers_handler))
        .route("/webhooks", get(list_webhooks_handler).post(create_webhook_handler))
        .route(
            "/webhooks/:id",
            get(get_webhook_handler)
                .put(update_webhook_handler)
                .delete(delete_webhook_handler),
        );

    for kind in CommandKind::ALL {
        router = router.route(
            &format!("/sessions/:id/{}", kind.route()),
            post(
                move |state: State<Arc<HttpState>>,
                      id: ApiPath<SessionId>,
                      body: JsonBody| command_handler(kind, state, id, body),
            ),
        );
    }
    router
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .merge(routes())
        .nest("/api", routes())
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    config: HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Whatsflow HTTP API listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
        tracing::info!("HTTP server shutting down...");
    })
    .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct WebhookListQuery {
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SubscribersQuery {
    pub event: Option<String>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    fn into_body(self) -> Value {
        json!({ "error": self.error, "status": self.status })
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check: probes the store.
pub async fn health_inner(state: &HttpState) -> (StatusCode, Value) {
    match state.store.health().await {
        Ok(backend) => (
            StatusCode::OK,
            json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": state.store.name(),
                "backend": backend,
                "connectors_running": state.supervisor.snapshot().iter().filter(|p| p.running).count(),
            }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "status": "unhealthy",
                    "store": state.store.name(),
                    "error": e.public_message(),
                }),
            )
        }
    }
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "whatsflow/1",
    })
}

pub async fn list_sessions_inner(state: &HttpState) -> (StatusCode, Value) {
    respond(state.registry.list().await, StatusCode::OK)
}

pub async fn create_session_inner(state: &HttpState, body: Value) -> (StatusCode, Value) {
    let req: CreateSessionRequest = match parse_body(body) {
        Ok(req) => req,
        Err(e) => return error_response(e),
    };
    respond(
        state.registry.create(req.name, req.description).await,
        StatusCode::CREATED,
    )
}

pub async fn get_session_inner(state: &HttpState, id: SessionId) -> (StatusCode, Value) {
    respond(state.registry.get(id).await, StatusCode::OK)
}

pub async fn update_session_inner(
    state: &HttpState,
    id: SessionId,
    body: Value,
) -> (StatusCode, Value) {
    let patch: SessionPatch = match parse_body(body) {
        Ok(patch) => patch,
        Err(e) => return error_response(e),
    };
    respond(state.registry.update(id, patch).await, StatusCode::OK)
}

pub async fn delete_session_inner(state: &HttpState, id: SessionId) -> (StatusCode, Value) {
    match state.registry.delete(id).await {
        Ok(()) => (
            StatusCode::OK,
            json!({ "message": "Session deleted successfully" }),
        ),
        Err(e) => error_response(e),
    }
}

pub async fn restart_session_inner(state: &HttpState, id: SessionId) -> (StatusCode, Value) {
    match state.registry.restart(id).await {
        Ok((session, process)) => (
            StatusCode::OK,
            json!({
                "message": "Session restarted successfully",
                "session": session,
                "process": process,
            }),
        ),
        Err(e) => error_response(e),
    }
}

/// Inner status callback: authenticates the connector, then applies the report.
pub async fn status_callback_inner(
    state: &HttpState,
    id: SessionId,
    peer: Option<IpAddr>,
    token: Option<&str>,
    body: Value,
) -> (StatusCode, Value) {
    let update: StatusUpdate = match parse_body(body) {
        Ok(update) => update,
        Err(e) => return error_response(e),
    };
    match state.ingestor.on_callback(id, peer, token, update).await {
        Ok(session) => (
            StatusCode::OK,
            json!({ "message": "Status updated successfully", "session": session }),
        ),
        Err(e) => error_response(e),
    }
}

/// Inner command: validates, checks the session is connected and forwards.
/// The connector's success body is passed through with its status code.
pub async fn command_inner(
    state: &HttpState,
    id: SessionId,
    kind: CommandKind,
    body: Value,
) -> (StatusCode, Value) {
    match state.commands.dispatch(id, kind, body).await {
        Ok(reply) => {
            tracing::info!(
                session_id = id,
                route = kind.route(),
                message_id = reply.message_id.as_deref().unwrap_or("-"),
                "Command delivered"
            );
            let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
            (status, reply.body)
        }
        Err(e) => error_response(e),
    }
}

pub async fn process_inner(state: &HttpState, id: SessionId) -> (StatusCode, Value) {
    if let Err(e) = state.registry.get(id).await {
        return error_response(e);
    }
    respond(Ok(state.supervisor.info(id)), StatusCode::OK)
}

pub async fn subscribers_inner(
    state: &HttpState,
    id: SessionId,
    event: Option<String>,
) -> (StatusCode, Value) {
    let result = match event {
        Some(event) => state.webhooks.subscribers(id, &event).await,
        None => match state.registry.get(id).await {
            Ok(_) => state.webhooks.list(Some(id)).await,
            Err(e) => Err(e),
        },
    };
    respond(result, StatusCode::OK)
}

pub async fn list_webhooks_inner(
    state: &HttpState,
    session_id: Option<SessionId>,
) -> (StatusCode, Value) {
    respond(state.webhooks.list(session_id).await, StatusCode::OK)
}

pub async fn create_webhook_inner(state: &HttpState, body: Value) -> (StatusCode, Value) {
    let req: CreateWebhook = match parse_body(body) {
        Ok(req) => req,
        Err(e) => return error_response(e),
    };
    respond(state.webhooks.create(req).await, StatusCode::CREATED)
}

pub async fn get_webhook_inner(state: &HttpState, id: WebhookId) -> (StatusCode, Value) {
    respond(state.webhooks.get(id).await, StatusCode::OK)
}

pub async fn update_webhook_inner(
    state: &HttpState,
    id: WebhookId,
    body: Value,
) -> (StatusCode, Value) {
    let patch: WebhookPatch = match parse_body(body) {
        Ok(patch) => patch,
        Err(e) => return error_response(e),
    };
    respond(state.webhooks.update(id, patch).await, StatusCode::OK)
}

pub async fn delete_webhook_inner(state: &HttpState, id: WebhookId) -> (StatusCode, Value) {
    match state.webhooks.delete(id).await {
        Ok(()) => (
            StatusCode::OK,
            json!({ "message": "Webhook deleted successfully" }),
        ),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

fn rejection(message: String) -> (StatusCode, Json<Value>) {
    let (status, body) = error_response(WhatsflowError::Validation(message));
    (status, Json(body))
}

/// Path parameters whose parse failures use the JSON error body.
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(Self(value)),
            Err(e) => Err(rejection(format!("invalid path parameter: {}", e.body_text()))),
        }
    }
}

/// JSON request body. An empty body reads as `{}` so field validation
/// names the missing field; anything else must parse.
pub struct JsonBody(pub Value);

#[async_trait]
impl<S> FromRequest<S> for JsonBody
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| rejection(format!("unreadable request body: {}", e.body_text())))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self(json!({})));
        }
        serde_json::from_slice(&bytes)
            .map(Self)
            .map_err(|e| rejection(format!("malformed JSON body: {}", e)))
    }
}

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn list_sessions_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = list_sessions_inner(&state).await;
    (status, Json(body))
}

pub async fn create_session_handler(
    State(state): State<Arc<HttpState>>,
    JsonBody(body): JsonBody,
) -> impl IntoResponse {
    let (status, body) = create_session_inner(&state, body).await;
    (status, Json(body))
}

pub async fn get_session_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<SessionId>,
) -> impl IntoResponse {
    let (status, body) = get_session_inner(&state, id).await;
    (status, Json(body))
}

pub async fn update_session_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<SessionId>,
    JsonBody(body): JsonBody,
) -> impl IntoResponse {
    let (status, body) = update_session_inner(&state, id, body).await;
    (status, Json(body))
}

pub async fn delete_session_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<SessionId>,
) -> impl IntoResponse {
    let (status, body) = delete_session_inner(&state, id).await;
    (status, Json(body))
}

pub async fn restart_session_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<SessionId>,
) -> impl IntoResponse {
    let (status, body) = restart_session_inner(&state, id).await;
    (status, Json(body))
}

pub async fn status_callback_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<SessionId>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    JsonBody(body): JsonBody,
) -> impl IntoResponse {
    let peer_ip = peer.map(|ConnectInfo(addr)| addr.ip());
    let token = headers
        .get(CALLBACK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let (status, body) =
        status_callback_inner(&state, id, peer_ip, token, body).await;
    (status, Json(body))
}

pub async fn command_handler(
    kind: CommandKind,
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<SessionId>,
    JsonBody(body): JsonBody,
) -> impl IntoResponse {
    let (status, body) = command_inner(&state, id, kind, body).await;
    (status, Json(body))
}

pub async fn process_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<SessionId>,
) -> impl IntoResponse {
    let (status, body) = process_inner(&state, id).await;
    (status, Json(body))
}

pub async fn subscribers_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<SessionId>,
    Query(query): Query<SubscribersQuery>,
) -> impl IntoResponse {
    let (status, body) = subscribers_inner(&state, id, query.event).await;
    (status, Json(body))
}

pub async fn list_webhooks_handler(
    State(state): State<Arc<HttpState>>,
    Query(query): Query<WebhookListQuery>,
) -> impl IntoResponse {
    let (status, body) = list_webhooks_inner(&state, query.session_id).await;
    (status, Json(body))
}

pub async fn create_webhook_handler(
    State(state): State<Arc<HttpState>>,
    JsonBody(body): JsonBody,
) -> impl IntoResponse {
    let (status, body) = create_webhook_inner(&state, body).await;
    (status, Json(body))
}

pub async fn get_webhook_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<WebhookId>,
) -> impl IntoResponse {
    let (status, body) = get_webhook_inner(&state, id).await;
    (status, Json(body))
}

pub async fn update_webhook_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<WebhookId>,
    JsonBody(body): JsonBody,
) -> impl IntoResponse {
    let (status, body) = update_webhook_inner(&state, id, body).await;
    (status, Json(body))
}

pub async fn delete_webhook_handler(
    State(state): State<Arc<HttpState>>,
    ApiPath(id): ApiPath<WebhookId>,
) -> impl IntoResponse {
    let (status, body) = delete_webhook_inner(&state, id).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> whatsflow_core::Result<T> {
    if !body.is_object() {
        return Err(WhatsflowError::Validation(
            "request body must be a JSON object".to_string(),
        ));
    }
    serde_json::from_value(body)
        .map_err(|e| WhatsflowError::Validation(format!("malformed request body: {}", e)))
}

fn respond<T: Serialize>(result: whatsflow_core::Result<T>, ok: StatusCode) -> (StatusCode, Value) {
    match result.and_then(|v| Ok(serde_json::to_value(v)?)) {
        Ok(body) => (ok, body),
        Err(e) => error_response(e),
    }
}

/// Map a domain error to its HTTP status and error body. Internal failures
/// are logged and reported generically; connector errors are relayed.
pub fn error_response(err: WhatsflowError) -> (StatusCode, Value) {
    if let WhatsflowError::Connector { status, body } = &err {
        let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = serde_json::from_str(body)
            .unwrap_or_else(|_| ErrorResponse::new(body.clone()).into_body());
        return (status, body);
    }

    if err.is_internal() {
        tracing::error!(error = %err, "Request failed");
    }
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, ErrorResponse::new(err.public_message()).into_body())
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use whatsflow_core::config::ConnectorConfig;
    use whatsflow_core::MemoryStore;

    const LOCAL: Option<IpAddr> = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

    fn test_state() -> Arc<HttpState> {
        let mut config = WhatsflowConfig::default();
        config.connector = ConnectorConfig {
            program: "/nonexistent/whatsflow-connector".to_string(),
            ..ConnectorConfig::default()
        };
        let (state, _exits) = HttpState::build(Arc::new(MemoryStore::new()), &config).unwrap();
        state
    }

    // ------------------------------------------------------------------------
    // TEST 1: version_inner is pure and returns correct fields
    // ------------------------------------------------------------------------
    #[test]
    fn test_version_inner_pure() {
        let v = version_inner();
        assert_eq!(v["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(v["protocol"], "whatsflow/1");
    }

    // ------------------------------------------------------------------------
    // TEST 2: error_response: status and body follow the error taxonomy
    // ------------------------------------------------------------------------
    #[test]
    fn test_error_response_taxonomy() {
        let (status, body) = error_response(WhatsflowError::NotConnected(7));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("not connected"));

        let (status, _) = error_response(WhatsflowError::Timeout(10));
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

        let (status, _) = error_response(WhatsflowError::AddressInUse("127.0.0.1:3001".into()));
        assert_eq!(status, StatusCode::CONFLICT);
    }

    // ------------------------------------------------------------------------
    // TEST 3: error_response: internal details never reach the client
    // ------------------------------------------------------------------------
    #[test]
    fn test_error_response_hides_internal_detail() {
        let (status, body) = error_response(WhatsflowError::Other("pg password=hunter2".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal error");
    }

    // ------------------------------------------------------------------------
    // TEST 4: error_response: connector JSON and text bodies are relayed
    // ------------------------------------------------------------------------
    #[test]
    fn test_error_response_relays_connector() {
        let (status, body) = error_response(WhatsflowError::Connector {
            status: 500,
            body: r#"{"success":false,"error":"Failed to send message"}"#.into(),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to send message");

        let (status, body) = error_response(WhatsflowError::Connector {
            status: 503,
            body: "Client not ready".into(),
        });
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Client not ready");
    }

    // ------------------------------------------------------------------------
    // TEST 5: create_session_inner: missing name returns 400
    // ------------------------------------------------------------------------
    #[tokio::test]
    async fn test_create_session_inner_requires_name() {
        let state = test_state();
        let (status, body) = create_session_inner(&state, json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Session name is required");

        let (status, _) = create_session_inner(&state, json!("acct1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // ------------------------------------------------------------------------
    // TEST 6: create_session_inner: 201 with a disconnected session
    // ------------------------------------------------------------------------
    #[tokio::test]
    async fn test_create_session_inner_created() {
        let state = test_state();
        let (status, body) = create_session_inner(&state, json!({"name": "acct1"})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "disconnected");
        assert!(body["qr_code"].is_null());
        assert!(body.get("session_data").is_none());
    }

    // ------------------------------------------------------------------------
    // TEST 7: status_callback_inner: remote peers are refused with 403
    // ------------------------------------------------------------------------
    #[tokio::test]
    async fn test_status_callback_inner_rejects_remote() {
        let state = test_state();
        create_session_inner(&state, json!({"name": "acct1"})).await;

        let remote = Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)));
        let (status, _) =
            status_callback_inner(&state, 1, remote, None, json!({"status": "connected"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) =
            status_callback_inner(&state, 1, LOCAL, None, json!({"status": "connected"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session"]["status"], "connected");
    }

    // ------------------------------------------------------------------------
    // TEST 8: command_inner: disconnected session returns 400
    // ------------------------------------------------------------------------
    #[tokio::test]
    async fn test_command_inner_requires_connected() {
        let state = test_state();
        create_session_inner(&state, json!({"name": "acct1"})).await;

        let (status, body) = command_inner(
            &state,
            1,
            CommandKind::Text,
            json!({"chatId": "1@c.us", "message": "hi"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Session 1 is not connected");
    }

    // ------------------------------------------------------------------------
    // TEST 9: process_inner: unknown session is 404, known one reports state
    // ------------------------------------------------------------------------
    #[tokio::test]
    async fn test_process_inner() {
        let state = test_state();
        let (status, _) = process_inner(&state, 9).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        create_session_inner(&state, json!({"name": "acct1"})).await;
        let (status, body) = process_inner(&state, 1).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_id"], 1);
        assert_eq!(body["running"], false);
    }

    // ------------------------------------------------------------------------
    // TEST 10: health_inner: memory store is always healthy
    // ------------------------------------------------------------------------
    #[tokio::test]
    async fn test_health_inner_memory() {
        let state = test_state();
        let (status, body) = health_inner(&state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"], "memory");
    }
}
