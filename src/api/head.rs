//! Head HTTP surface: node status, enrollment, and task calls routed to nodes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use super::error::ApiJson;
use super::types::{
    AggregatedTasks, AssistRequest, ConfigDefaults, ContinueRequest, HeadKeyResponse,
    HeadTaskCreate, NodeListing, NodeQuery, ScheduleRequest,
};
use crate::error::Error;
use crate::proxy::HeadProxy;
use crate::tasks::TaskDetail;

#[derive(Clone)]
pub struct HeadState {
    pub proxy: Arc<HeadProxy>,
}

/// Build the head router.
pub fn head_router(proxy: Arc<HeadProxy>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/security/public-key", get(public_key))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{node_id}/install-head-key", post(install_head_key))
        .route("/api/config/defaults", get(config_defaults))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(task_detail).delete(delete_task))
        .route("/api/tasks/{id}/assist", post(submit_assistance))
        .route("/api/tasks/{id}/continue", post(continue_task))
        .route("/api/tasks/{id}/schedule", post(reschedule_task))
        .route("/api/tasks/{id}/run-now", post(run_now))
        .route("/api/tasks/{id}/close-browser", post(close_browser))
        .route("/api/tasks/{id}/open-browser", post(open_browser))
        .layer(TraceLayer::new_for_http())
        .with_state(HeadState { proxy })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "webai-head"
    }))
}

async fn public_key(State(state): State<HeadState>) -> impl IntoResponse {
    Json(serde_json::json!({ "public_key": state.proxy.public_key_pem() }))
}

async fn list_nodes(State(state): State<HeadState>) -> Json<NodeListing> {
    Json(state.proxy.list_nodes().await)
}

async fn install_head_key(
    State(state): State<HeadState>,
    Path(node_id): Path<String>,
) -> Result<Json<HeadKeyResponse>, Error> {
    Ok(Json(state.proxy.install_head_key(&node_id).await?))
}

async fn config_defaults(State(state): State<HeadState>) -> Result<Json<ConfigDefaults>, Error> {
    Ok(Json(state.proxy.config_defaults().await?))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn list_tasks(State(state): State<HeadState>) -> Json<AggregatedTasks> {
    Json(state.proxy.list_tasks().await)
}

async fn create_task(
    State(state): State<HeadState>,
    ApiJson(payload): ApiJson<HeadTaskCreate>,
) -> Result<(StatusCode, Json<TaskDetail>), Error> {
    let detail = state
        .proxy
        .create_task(payload.node_id.as_deref(), &payload.task)
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn task_detail(
    State(state): State<HeadState>,
    Path(id): Path<String>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state.proxy.get_task(query.node_id.as_deref(), &id).await?,
    ))
}

async fn delete_task(
    State(state): State<HeadState>,
    Path(id): Path<String>,
    Query(query): Query<NodeQuery>,
) -> Result<StatusCode, Error> {
    state
        .proxy
        .delete_task(query.node_id.as_deref(), &id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_assistance(
    State(state): State<HeadState>,
    Path(id): Path<String>,
    Query(query): Query<NodeQuery>,
    ApiJson(body): ApiJson<AssistRequest>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state
            .proxy
            .submit_assistance(query.node_id.as_deref(), &id, &body)
            .await?,
    ))
}

async fn continue_task(
    State(state): State<HeadState>,
    Path(id): Path<String>,
    Query(query): Query<NodeQuery>,
    ApiJson(body): ApiJson<ContinueRequest>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state
            .proxy
            .continue_task(query.node_id.as_deref(), &id, &body)
            .await?,
    ))
}

async fn reschedule_task(
    State(state): State<HeadState>,
    Path(id): Path<String>,
    Query(query): Query<NodeQuery>,
    ApiJson(body): ApiJson<ScheduleRequest>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state
            .proxy
            .reschedule(query.node_id.as_deref(), &id, body.scheduled_for)
            .await?,
    ))
}

async fn run_now(
    State(state): State<HeadState>,
    Path(id): Path<String>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state.proxy.run_now(query.node_id.as_deref(), &id).await?,
    ))
}

async fn close_browser(
    State(state): State<HeadState>,
    Path(id): Path<String>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state
            .proxy
            .close_browser(query.node_id.as_deref(), &id)
            .await?,
    ))
}

async fn open_browser(
    State(state): State<HeadState>,
    Path(id): Path<String>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<TaskDetail>, Error> {
    Ok(Json(
        state
            .proxy
            .open_browser(query.node_id.as_deref(), &id)
            .await?,
    ))
}
