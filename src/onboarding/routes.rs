//! REST + WebSocket endpoints for tenant onboarding.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::autosave::Autosaver;
use super::manager::{OnboardingManager, TaskUpdate, Upload};
use super::model::{OnboardingEvent, TaskData};
use crate::error::{DatabaseError, Error};

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub manager: Arc<OnboardingManager>,
    pub autosaver: Arc<Autosaver>,
}

/// Build the onboarding REST and WebSocket routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tenants", post(provision_tenant))
        .route("/api/tenants/{id}", get(get_tenant).delete(delete_tenant))
        .route("/api/tenants/{id}/onboarding", get(get_onboarding))
        .route("/api/tenants/{id}/tasks/{key}", post(update_task))
        .route("/api/tenants/{id}/tasks/{key}/remove", post(remove_fields))
        .route("/api/tenants/{id}/tasks/{key}/files/{field}", put(upload_file))
        .route("/api/tenants/{id}/tasks/{key}/autosave", post(autosave))
        .route("/api/tenants/{id}/tasks/{key}/flush", post(flush))
        .route("/api/tenants/{id}/tasks/{key}/step-complete", post(step_complete))
        .route("/ws/tenants/{id}", get(ws_handler))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Database(DatabaseError::Conflict(_)) => StatusCode::CONFLICT,
        Error::Blob(_) => StatusCode::BAD_GATEWAY,
        Error::Database(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "Onboarding request failed");
    }
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

fn parse_tenant_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid tenant ID"})),
        )
            .into_response()
    })
}

fn update_response(update: TaskUpdate) -> Response {
    Json(serde_json::json!({
        "task": update.task,
        "view": update.view,
        "phase_transitioned": update.transition.fired(),
    }))
    .into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "onboarding-engine"
    }))
}

// ── Tenants ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ProvisionRequest {
    tenant_id: Option<Uuid>,
}

async fn provision_tenant(
    State(state): State<OnboardingRouteState>,
    body: Bytes,
) -> Response {
    // The body is optional; an empty one provisions a fresh tenant id.
    let request = if body.is_empty() {
        ProvisionRequest::default()
    } else {
        match serde_json::from_slice::<ProvisionRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": format!("Invalid request body: {e}")})),
                )
                    .into_response();
            }
        }
    };
    let id = request.tenant_id.unwrap_or_else(Uuid::new_v4);
    match state.manager.provision_tenant(id).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_tenant(State(state): State<OnboardingRouteState>, Path(id): Path<String>) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.get_tenant(id).await {
        Ok(tenant) => Json(tenant).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_tenant(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    state.autosaver.discard_tenant(id);
    match state.manager.delete_tenant(id).await {
        Ok(true) => Json(serde_json::json!({"status": "deleted"})).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Tenant not found"})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_onboarding(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.get_tasks(id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UpdateTaskRequest {
    #[serde(default)]
    data: TaskData,
    #[serde(default)]
    mark_completed: bool,
}

async fn update_task(
    State(state): State<OnboardingRouteState>,
    Path((id, key)): Path<(String, String)>,
    Json(body): Json<UpdateTaskRequest>,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state
        .manager
        .update_task(id, &key, body.data, body.mark_completed)
        .await
    {
        Ok(update) => update_response(update),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct RemoveFieldsRequest {
    #[serde(default)]
    merge: TaskData,
    remove: Vec<String>,
}

async fn remove_fields(
    State(state): State<OnboardingRouteState>,
    Path((id, key)): Path<(String, String)>,
    Json(body): Json<RemoveFieldsRequest>,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state
        .manager
        .remove_task_fields(id, &key, body.merge, body.remove)
        .await
    {
        Ok(update) => update_response(update),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    file_name: String,
}

async fn upload_file(
    State(state): State<OnboardingRouteState>,
    Path((id, key, field)): Path<(String, String, String)>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let upload = Upload {
        file_name: query.file_name,
        content_type,
        bytes: body.to_vec(),
    };
    match state.manager.upload_and_attach(id, &key, &field, upload).await {
        Ok(update) => update_response(update),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct AutosaveRequest {
    field: String,
    value: Value,
}

async fn autosave(
    State(state): State<OnboardingRouteState>,
    Path((id, key)): Path<(String, String)>,
    Json(body): Json<AutosaveRequest>,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.autosaver.queue(id, &key, &body.field, body.value) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "queued"})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn flush(
    State(state): State<OnboardingRouteState>,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let key = match state.manager.graph().parse(&key) {
        Ok(key) => key,
        Err(e) => return error_response(&Error::from(e)),
    };
    match state.autosaver.flush(id, key).await {
        Ok(Some(update)) => update_response(update),
        Ok(None) => Json(serde_json::json!({"status": "nothing_pending"})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn step_complete(
    State(state): State<OnboardingRouteState>,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.on_step_complete(id, &key).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "sequencing"})),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────

/// Messages a connected client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    StepComplete { task: String },
    Expand { task: Option<String> },
    Autosave { task: String, field: String, value: Value },
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<OnboardingRouteState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_tenant_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(e) = state.manager.get_tenant(id).await {
        return error_response(&e);
    }
    info!(tenant_id = %id, "WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

/// Send a full view of the tenant. Returns false once the client is gone.
async fn send_sync(socket: &mut WebSocket, manager: &OnboardingManager, tenant_id: Uuid) -> bool {
    let view = match manager.get_tasks(tenant_id).await {
        Ok(view) => view,
        Err(e) => {
            warn!(tenant_id = %tenant_id, error = %e, "Failed to build onboarding sync");
            return true;
        }
    };
    send_event(socket, &OnboardingEvent::OnboardingSync { view }).await
}

async fn send_event(socket: &mut WebSocket, event: &OnboardingEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize onboarding event");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: OnboardingRouteState, tenant_id: Uuid) {
    info!(tenant_id = %tenant_id, "WebSocket client connected");

    // Subscribe before the initial sync so nothing falls in between.
    let mut rx = state.manager.subscribe();

    if !send_sync(&mut socket, &state.manager, tenant_id).await {
        warn!(tenant_id = %tenant_id, "Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.tenant_id() != tenant_id {
                            continue;
                        }
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(tenant_id = %tenant_id, missed = n, "WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &state.manager, tenant_id).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &state, tenant_id).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(tenant_id = %tenant_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(tenant_id = %tenant_id, "WebSocket connection closed");
}

async fn handle_client_message(text: &str, state: &OnboardingRouteState, tenant_id: Uuid) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Invalid client message");
            return;
        }
    };

    let result = match msg {
        ClientMessage::StepComplete { task } => state.manager.on_step_complete(tenant_id, &task).await,
        ClientMessage::Expand { task } => {
            let key = match task.as_deref().map(|t| state.manager.graph().parse(t)).transpose() {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Invalid expand request");
                    return;
                }
            };
            state.manager.sequencer(tenant_id).expand(key);
            Ok(())
        }
        ClientMessage::Autosave { task, field, value } => {
            state.autosaver.queue(tenant_id, &task, &field, value)
        }
    };

    if let Err(e) = result {
        warn!(tenant_id = %tenant_id, error = %e, "Client message rejected");
    }
}
