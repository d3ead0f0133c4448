//! HTTP API error mapping.
//!
//! Every failure crossing the API boundary is the structured
//! `{ kind, message, task_id?, phase? }` shape from the core taxonomy,
//! with the HTTP status derived from the kind.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use qm_core::{ErrorKind, QuorumError};

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ApiError(pub QuorumError);

impl From<QuorumError> for ApiError {
    fn from(err: QuorumError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self(QuorumError::validation(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self(QuorumError::not_found(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self(QuorumError::internal(message))
    }

    fn status(&self) -> StatusCode {
        match self.0.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self.0)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn conflict_maps_to_409_with_structured_body() {
        let err: ApiError = QuorumError::conflict("cannot pause a pending workflow").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let v = body_json(response).await;
        assert_eq!(v["kind"], "conflict");
        assert!(v["message"].as_str().unwrap().contains("pause"));
    }

    #[tokio::test]
    async fn validation_maps_to_400() {
        let response = ApiError::validation("prompt must not be empty").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agent_errors_map_to_500_and_keep_their_kind() {
        let err: ApiError = QuorumError::agent(
            qm_core::types::AgentFailureKind::RateLimited,
            "429 from upstream",
        )
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body_json(response).await;
        assert_eq!(v["kind"], "agent_error");
        assert_eq!(v["agent_kind"], "rate_limited");
    }
}
