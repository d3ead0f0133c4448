//! HTTP API and SSE fan-out over the workflow engine.

pub mod api_error;
pub mod download;
pub mod http_api;
pub mod sse;

pub use api_error::ApiError;
pub use http_api::{api_router, ApiState};
