use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use qm_core::types::{
    Attachment, ExecutionConfig, KanbanColumn, Task, Workflow, WorkflowFilter, WorkflowPatch,
    WorkflowStatus,
};
use qm_core::{QuorumError, WorkflowId};
use qm_engine::{EngineContext, KanbanEngine, KanbanEngineStatus, WorkflowEngine};

use crate::api_error::ApiError;
use crate::download;
use crate::sse;

// ---------------------------------------------------------------------------
// ApiState
// ---------------------------------------------------------------------------

/// Shared application state for all HTTP/SSE handlers.
pub struct ApiState {
    pub engine: WorkflowEngine,
    pub kanban: Arc<KanbanEngine>,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(engine: WorkflowEngine, kanban: Arc<KanbanEngine>) -> Self {
        Self {
            engine,
            kanban,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn ctx(&self) -> &EngineContext {
        self.engine.context()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the full API router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/health/deep", get(get_health_deep))
        .route("/api/v1/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/v1/workflows/{id}",
            get(get_workflow).patch(patch_workflow).delete(delete_workflow),
        )
        .route("/api/v1/workflows/{id}/start", post(start_workflow))
        .route("/api/v1/workflows/{id}/analyze", post(analyze_workflow))
        .route("/api/v1/workflows/{id}/plan", post(plan_workflow))
        .route("/api/v1/workflows/{id}/execute", post(execute_workflow))
        .route("/api/v1/workflows/{id}/pause", post(pause_workflow))
        .route("/api/v1/workflows/{id}/resume", post(resume_workflow))
        .route("/api/v1/workflows/{id}/stop", post(stop_workflow))
        .route("/api/v1/workflows/{id}/replan", post(replan_workflow))
        .route("/api/v1/workflows/{id}/tasks", get(list_tasks))
        .route("/api/v1/workflows/{id}/tasks/{tid}", get(get_task))
        .route(
            "/api/v1/workflows/{id}/attachments",
            get(list_attachments).post(upload_attachment),
        )
        .route(
            "/api/v1/workflows/{id}/attachments/{aid}",
            delete(delete_attachment),
        )
        .route(
            "/api/v1/workflows/{id}/attachments/{aid}/download",
            get(download_attachment),
        )
        .route("/api/v1/workflows/{id}/download", get(download::download_workflow))
        .route("/api/v1/kanban/board", get(kanban_board))
        .route("/api/v1/kanban/move", post(kanban_move))
        .route("/api/v1/kanban/engine", get(kanban_engine_status))
        .route("/api/v1/kanban/engine/enable", post(kanban_engine_enable))
        .route("/api/v1/kanban/engine/disable", post(kanban_engine_disable))
        .route("/api/v1/kanban/engine/reset", post(kanban_engine_reset))
        .route("/api/v1/sse/events", get(sse::sse_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub prompt: String,
    pub title: Option<String>,
    pub config: Option<ExecutionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct PatchWorkflowRequest {
    pub title: Option<String>,
    pub config: Option<ExecutionConfig>,
    pub kanban_column: Option<KanbanColumn>,
}

#[derive(Debug, Deserialize)]
pub struct ReplanRequest {
    pub context: String,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<WorkflowStatus>,
    pub kanban: Option<KanbanColumn>,
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KanbanMoveRequest {
    pub workflow_id: WorkflowId,
    pub column: KanbanColumn,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct DeepHealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    workflow_count: usize,
    agents: Vec<String>,
    kanban: KanbanEngineStatus,
}

#[derive(Debug, Serialize)]
struct BoardColumn {
    column: KanbanColumn,
    workflows: Vec<Workflow>,
}

#[derive(Debug, Serialize)]
struct BoardResponse {
    columns: Vec<BoardColumn>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn get_health_deep(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<DeepHealthResponse>, ApiError> {
    let ctx = state.ctx();
    let workflows = ctx
        .store
        .list_workflows(&WorkflowFilter::default())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(DeepHealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        workflow_count: workflows.len(),
        agents: ctx.registry.names().iter().map(|s| s.to_string()).collect(),
        kanban: state.kanban.status().await,
    }))
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

async fn list_workflows(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    let filter = WorkflowFilter {
        status: query.status,
        kanban_column: query.kanban,
        query: query.q,
    };
    let workflows = state
        .ctx()
        .store
        .list_workflows(&filter)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(workflows))
}

async fn create_workflow(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<Json<Workflow>, ApiError> {
    let wf = state
        .engine
        .create_workflow(req.prompt, req.title, req.config)
        .await?;
    Ok(Json(wf))
}

async fn get_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    let id = WorkflowId::from(id);
    let wf = state
        .ctx()
        .store
        .get_workflow(&id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("workflow {id}")))?;
    Ok(Json(wf))
}

async fn patch_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<PatchWorkflowRequest>,
) -> Result<Json<Workflow>, ApiError> {
    let id = WorkflowId::from(id);
    let patch = WorkflowPatch {
        title: req.title,
        config: req.config,
        kanban_column: req.kanban_column,
        ..WorkflowPatch::default()
    };
    let wf = state.engine.patch_workflow(&id, patch).await?;
    Ok(Json(wf))
}

async fn delete_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = WorkflowId::from(id);
    state.engine.delete_workflow(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ---------------------------------------------------------------------------
// Control operations
// ---------------------------------------------------------------------------

async fn start_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.engine.start(&WorkflowId::from(id)).await?))
}

async fn analyze_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.engine.analyze(&WorkflowId::from(id)).await?))
}

async fn plan_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.engine.plan(&WorkflowId::from(id)).await?))
}

async fn execute_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.engine.execute(&WorkflowId::from(id)).await?))
}

async fn pause_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.engine.pause(&WorkflowId::from(id)).await?))
}

async fn resume_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.engine.resume(&WorkflowId::from(id)).await?))
}

async fn stop_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(state.engine.stop(&WorkflowId::from(id)).await?))
}

async fn replan_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(req): Json<ReplanRequest>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(
        state
            .engine
            .replan(&WorkflowId::from(id), &req.context)
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let id = WorkflowId::from(id);
    let tasks = state
        .ctx()
        .store
        .list_tasks(&id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path((id, tid)): Path<(String, String)>,
) -> Result<Json<Task>, ApiError> {
    let id = WorkflowId::from(id);
    let tid = qm_core::TaskId::new(tid);
    let task = state
        .ctx()
        .store
        .get_task(&id, &tid)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("task {tid} in workflow {id}")))?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

async fn list_attachments(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Attachment>>, ApiError> {
    let id = WorkflowId::from(id);
    let attachments = state
        .ctx()
        .store
        .list_attachments(&id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(attachments))
}

/// Attachments may only change while the workflow is not running.
async fn require_not_running(
    state: &ApiState,
    id: &WorkflowId,
) -> Result<Workflow, ApiError> {
    let wf = state
        .ctx()
        .store
        .get_workflow(id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("workflow {id}")))?;
    if wf.status == WorkflowStatus::Running {
        return Err(QuorumError::conflict(format!(
            "attachments of workflow {id} cannot change while it is running"
        ))
        .into());
    }
    Ok(wf)
}

async fn upload_attachment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Attachment>, ApiError> {
    let id = WorkflowId::from(id);
    require_not_running(&state, &id).await?;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(e.to_string()))?
        .ok_or_else(|| ApiError::validation("multipart body must contain a file field"))?;
    let file_name = field
        .file_name()
        .map(sanitize_file_name)
        .unwrap_or_else(|| "attachment.bin".to_string());
    let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::validation(e.to_string()))?;

    let digest = Sha256::digest(&bytes);
    let sha256 = format!("{digest:x}");

    let attachment_id = Uuid::new_v4();
    let dir = state
        .ctx()
        .config
        .load()
        .data_dir()
        .join("attachments")
        .join(id.as_str());
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let path = dir.join(format!("{attachment_id}-{file_name}"));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let mut attachment = Attachment::new(
        id.clone(),
        file_name,
        bytes.len() as u64,
        sha256,
        path.to_string_lossy().into_owned(),
    );
    attachment.id = attachment_id;
    state
        .ctx()
        .store
        .add_attachment(&attachment)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    info!(workflow_id = %id, attachment_id = %attachment_id, "attachment uploaded");
    Ok(Json(attachment))
}

async fn delete_attachment(
    State(state): State<Arc<ApiState>>,
    Path((id, aid)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = WorkflowId::from(id);
    require_not_running(&state, &id).await?;

    let attachment = state
        .ctx()
        .store
        .get_attachment(aid)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("attachment {aid}")))?;
    let _ = tokio::fs::remove_file(&attachment.path).await;
    state
        .ctx()
        .store
        .delete_attachment(aid)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "deleted": aid })))
}

async fn download_attachment(
    State(state): State<Arc<ApiState>>,
    Path((_id, aid)): Path<(String, Uuid)>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let attachment = state
        .ctx()
        .store
        .get_attachment(aid)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("attachment {aid}")))?;
    let bytes = tokio::fs::read(&attachment.path)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let headers = [
        (
            axum::http::header::CONTENT_TYPE,
            "application/octet-stream".to_string(),
        ),
        (
            axum::http::header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", attachment.file_name),
        ),
    ];
    Ok((headers, bytes))
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Kanban
// ---------------------------------------------------------------------------

async fn kanban_board(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<BoardResponse>, ApiError> {
    let workflows = state
        .ctx()
        .store
        .list_workflows(&WorkflowFilter::default())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let columns = KanbanColumn::ordered()
        .iter()
        .map(|column| BoardColumn {
            column: *column,
            workflows: workflows
                .iter()
                .filter(|w| w.kanban_column == *column)
                .cloned()
                .collect(),
        })
        .collect();
    Ok(Json(BoardResponse { columns }))
}

async fn kanban_move(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<KanbanMoveRequest>,
) -> Result<Json<Workflow>, ApiError> {
    let wf = state
        .engine
        .move_to_column(&req.workflow_id, req.column)
        .await?;
    Ok(Json(wf))
}

async fn kanban_engine_status(
    State(state): State<Arc<ApiState>>,
) -> Json<KanbanEngineStatus> {
    Json(state.kanban.status().await)
}

async fn kanban_engine_enable(State(state): State<Arc<ApiState>>) -> Json<KanbanEngineStatus> {
    state.kanban.enable();
    Json(state.kanban.status().await)
}

async fn kanban_engine_disable(State(state): State<Arc<ApiState>>) -> Json<KanbanEngineStatus> {
    state.kanban.disable();
    Json(state.kanban.status().await)
}

async fn kanban_engine_reset(State(state): State<Arc<ApiState>>) -> Json<KanbanEngineStatus> {
    state.kanban.reset().await;
    Json(state.kanban.status().await)
}
