//! HTTP API layer.
//!
//! Caller identity arrives as an `x-user-id` header set by the upstream auth
//! proxy; this service never sees credentials. All job routes live under
//! `/api/v1`, with health and metrics unversioned.

mod handlers;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::error::{CoreError, ErrorCode};
use crate::resume::ResumeCoordinator;
use crate::store::Store;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub resume: Arc<ResumeCoordinator>,
    pub prometheus: PrometheusHandle,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Unversioned endpoints
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        // V1 API
        .route("/api/v1/jobs", get(handlers::list_jobs))
        .route("/api/v1/jobs/:job_id/resume", post(handlers::resume_job))
        .route("/api/v1/jobs/resume-all", post(handlers::resume_all_jobs))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Standard API response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }
}

/// Caller identity extracted from the `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct RequesterId(pub Uuid);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequesterId {
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                CoreError::new(ErrorCode::Unauthorized, "Missing caller identity")
            })?;
        let user_id = Uuid::parse_str(header)
            .map_err(|_| CoreError::new(ErrorCode::Unauthorized, "Invalid caller identity"))?;
        Ok(RequesterId(user_id))
    }
}
