//! Artifact-tree tarball download.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use flate2::write::GzEncoder;
use flate2::Compression;

use qm_core::WorkflowId;

use crate::api_error::ApiError;
use crate::http_api::ApiState;

/// `GET /api/v1/workflows/{id}/download` — the workflow's artifact tree as
/// a gzipped tarball.
pub async fn download_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = WorkflowId::from(id);
    // 404 for workflows the store has never seen.
    state
        .ctx()
        .store
        .get_workflow(&id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("workflow {id}")))?;

    let run_dir = state.ctx().artifacts.run_dir(&id);
    let root_name = id.to_string();
    let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        if run_dir.is_dir() {
            builder.append_dir_all(&root_name, &run_dir)?;
        }
        builder.into_inner()?.finish()
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(|e| ApiError::internal(e.to_string()))?;

    let headers = [
        (header::CONTENT_TYPE, "application/gzip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{id}.tar.gz\""),
        ),
    ];
    Ok((headers, bytes))
}
