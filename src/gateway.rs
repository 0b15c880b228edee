//! HTTP/WebSocket gateway: auth, routing, and error translation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::rejection::JsonRejection,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{DefaultBodyLimit, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::logs::LogRouter;
use crate::registry::SessionRegistry;
use crate::runner::SandboxRunner;
use crate::sync::{SyncJob, SyncOperation, SyncWorkerPool};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub runner: Arc<SandboxRunner>,
    pub sync_pool: Arc<SyncWorkerPool>,
    pub logs: Arc<LogRouter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(chrono::Duration::hours(
            config.session.ttl_hours as i64,
        )));
        let logs = Arc::new(LogRouter::new());
        let runner = Arc::new(SandboxRunner::new(config.runner.clone(), logs.clone()));
        let sync_pool = Arc::new(SyncWorkerPool::new(registry.clone(), &config.sync));
        Self {
            config,
            registry,
            runner,
            sync_pool,
            logs,
        }
    }
}

// Request/Response types
#[derive(Deserialize)]
struct SessionInitRequest {
    #[serde(default)]
    workspace_path: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct SessionSyncRequest {
    session_id: String,
    delta: Option<Map<String, Value>>,
    snapshot: Option<Map<String, Value>>,
    /// Present routes through the optimistic-concurrency path.
    expected_version: Option<u64>,
    /// True enqueues onto the sync worker pool instead of applying inline.
    #[serde(default)]
    queued: bool,
}

#[derive(Deserialize)]
struct SessionExecuteRequest {
    session_id: String,
    command: String,
    #[serde(default)]
    environment: Vec<String>,
}

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn success<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message.into()),
        }),
    )
        .into_response()
}

fn taxonomy_failure(err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    failure(status, err.to_string())
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/session/init", post(session_init))
        .route("/session/sync", post(session_sync))
        .route("/session/execute", post(session_execute))
        .route("/session/list", get(session_list))
        .route("/session/:id", get(session_get))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .nest("/api/v1", api)
        .route("/ws/logs/:session_id", get(log_stream))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(state.config.session.max_payload_mb * 1024 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives.
pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::new(config);
    state
        .registry
        .clone()
        .spawn_sweeper(Duration::from_secs(state.config.session.sweep_interval_secs));

    let addr = format!("{}:{}", state.config.api.host, state.config.api.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!(%addr, "starting gateway");

    let shutdown_state = state.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_state.sync_pool.shutdown().await;
        })
        .await
        .map_err(|e| Error::Runtime(format!("server error: {}", e)))
}

async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(state.config.auth.token_header.as_str())
        .and_then(|v| v.to_str().ok());
    match token {
        None => failure(StatusCode::UNAUTHORIZED, "Missing auth token"),
        Some(token) if token.len() < state.config.auth.token_length => {
            failure(StatusCode::UNAUTHORIZED, "Invalid auth token")
        }
        Some(_) => next.run(req).await,
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "running": state.runner.running_count().await,
        "sync": state.sync_pool.stats(),
    }))
}

async fn session_init(
    State(state): State<AppState>,
    body: std::result::Result<Json<SessionInitRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return failure(StatusCode::BAD_REQUEST, "Invalid request body");
    };

    let session = state.registry.create(req.workspace_path, req.metadata).await;
    success(json!({
        "session_id": session.id,
        "created_at": session.created_at,
        "expires_at": session.expires_at,
    }))
    .into_response()
}

async fn session_sync(
    State(state): State<AppState>,
    body: std::result::Result<Json<SessionSyncRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return failure(StatusCode::BAD_REQUEST, "Invalid request body");
    };

    if req.queued {
        let job = if let Some(snapshot) = req.snapshot {
            SyncJob::new(
                req.session_id.clone(),
                SyncOperation::SnapshotSync,
                Map::from_iter([("snapshot".to_string(), Value::Object(snapshot))]),
            )
        } else if let Some(delta) = req.delta {
            SyncJob::new(
                req.session_id.clone(),
                SyncOperation::DeltaSync,
                Map::from_iter([("delta".to_string(), Value::Object(delta))]),
            )
        } else {
            return failure(StatusCode::BAD_REQUEST, "Missing delta or snapshot");
        };
        state.sync_pool.enqueue(job);
        return success(json!({
            "status": "queued",
            "session_id": req.session_id,
        }))
        .into_response();
    }

    if let Some(expected_version) = req.expected_version {
        let Some(updates) = req.delta else {
            return failure(StatusCode::BAD_REQUEST, "Missing delta for versioned sync");
        };
        if let Err(err) = state
            .sync_pool
            .atomic_sync(&req.session_id, expected_version, updates)
            .await
        {
            return taxonomy_failure(&err);
        }
    } else if let Err(err) = state
        .registry
        .sync(&req.session_id, req.delta, req.snapshot)
        .await
    {
        return taxonomy_failure(&err);
    }

    success(json!({
        "status": "synced",
        "session_id": req.session_id,
    }))
    .into_response()
}

async fn session_execute(
    State(state): State<AppState>,
    body: std::result::Result<Json<SessionExecuteRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return failure(StatusCode::BAD_REQUEST, "Invalid request body");
    };

    let session = match state.registry.get(&req.session_id).await {
        Ok(session) => session,
        Err(err) => return taxonomy_failure(&err),
    };

    if let Err(err) = state
        .runner
        .execute(&session, &req.command, &req.environment)
        .await
    {
        return taxonomy_failure(&err);
    }

    success(json!({
        "status": "executing",
        "session_id": req.session_id,
    }))
    .into_response()
}

async fn session_list(State(state): State<AppState>) -> Response {
    let sessions = state.registry.list().await;
    success(json!({ "sessions": sessions })).into_response()
}

async fn session_get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id).await {
        Ok(session) => success(session).into_response(),
        Err(err) => taxonomy_failure(&err),
    }
}

async fn log_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_logs(socket, state, session_id))
}

/// Push log entries as JSON frames; ping after 30 idle seconds so
/// intermediaries do not reap the connection.
async fn stream_logs(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sink, mut source) = socket.split();
    let (subscriber_id, mut rx) = state.logs.subscribe(&session_id);
    info!(session_id = %session_id, subscriber_id, "log subscriber attached");

    let mut keepalive = tokio::time::interval(Duration::from_secs(30));
    keepalive.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            entry = rx.recv() => {
                let Some(entry) = entry else { break };
                let Ok(frame) = serde_json::to_string(&entry) else { continue };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
                keepalive.reset();
            }
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = source.next() => {
                // No client-to-server messages are expected; only watch for
                // the connection going away.
                match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.logs.unsubscribe(&session_id, subscriber_id);
    info!(session_id = %session_id, subscriber_id, "log subscriber detached");
}
