use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, Method},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::ADMIN_HISTORY_LIMIT;
use parley_shared::{BroadcastMessage, Username};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::router::ChatRouter;
use crate::session;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ChatRouter>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(router: Arc<ChatRouter>, config: ServerConfig) -> Self {
        Self {
            router,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/admin/status", get(admin_status))
        .route("/admin/users", get(admin_users))
        .route("/admin/broadcast", post(admin_broadcast))
        .route("/admin/history", get(admin_history))
        .route("/admin/blocks/:username", get(admin_blocks))
        .route("/admin/unread/:username", get(admin_unread))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online: usize,
    connections: usize,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    connections: usize,
    authenticated: usize,
    online_users: Vec<Username>,
    broadcast_messages: usize,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct AdminUsersResponse {
    count: usize,
    users: Vec<Username>,
}

#[derive(Deserialize)]
struct AdminBroadcastRequest {
    content: String,
}

#[derive(Serialize)]
struct AdminBroadcastResponse {
    delivered: usize,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct AdminBlocksResponse {
    username: Username,
    blocked: Vec<Username>,
}

#[derive(Serialize)]
struct AdminUnreadResponse {
    username: Username,
    unread: BTreeMap<Username, u64>,
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let router = state.router.clone();
    let queue = state.config.outbound_queue;
    ws.on_upgrade(move |socket| session::run_ws_session(socket, router, queue))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    let registry = state.router.registry();
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online: registry.bound_count().await,
        connections: registry.connection_count().await,
    })
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let registry = state.router.registry();
    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        connections: registry.connection_count().await,
        authenticated: registry.bound_count().await,
        online_users: registry.online_users().await,
        broadcast_messages: state.router.broadcasts().len().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

async fn admin_users(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminUsersResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let users = state.router.registry().online_users().await;
    Ok(Json(AdminUsersResponse {
        count: users.len(),
        users,
    }))
}

async fn admin_broadcast(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminBroadcastRequest>,
) -> Result<Json<AdminBroadcastResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let content = req.content.trim();
    if content.is_empty() {
        return Err(ServerError::BadRequest("Broadcast content is empty".into()));
    }

    let delivered = state.router.system_broadcast(content).await;
    info!(delivered, "Admin broadcast sent");
    Ok(Json(AdminBroadcastResponse { delivered }))
}

async fn admin_history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<BroadcastMessage>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let limit = query.limit.unwrap_or(ADMIN_HISTORY_LIMIT);
    Ok(Json(state.router.broadcasts().recent(limit).await))
}

async fn admin_blocks(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<AdminBlocksResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let username = Username::new(username);
    if username.is_empty() {
        return Err(ServerError::BadRequest("Username is empty".into()));
    }
    let blocked = state.router.moderation().blocked_by(&username).await;
    Ok(Json(AdminBlocksResponse { username, blocked }))
}

async fn admin_unread(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<AdminUnreadResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let username = Username::new(username);
    let unread = state.router.conversations().unread_counts(&username).await;
    Ok(Json(AdminUnreadResponse { username, unread }))
}

/// Serve the chat endpoint and HTTP API until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting chat server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
