//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, CoreError>` so failures map
//! to HTTP status codes via the `IntoResponse` implementation on `CoreError`.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiResponse, AppState, RequesterId};
use crate::error::{CoreError, ErrorCode};
use crate::jobs::{JobId, JobRecord, JobStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.prometheus.render();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub job_type: String,
    pub status: String,
    pub project_id: Option<Uuid>,
    pub paper_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id.0,
            job_type: record.job_type.as_str().to_string(),
            status: record.status.as_str().to_string(),
            project_id: record.project_id,
            paper_id: record.paper_id,
            failure_reason: record.failure_reason,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    /// Comma-separated status filter.
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub pagination: Pagination,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    requester: RequesterId,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let statuses = parse_status_filter(query.status.as_deref())?;
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);

    let (records, total) = state
        .store
        .list_jobs(requester.0, &statuses, limit, offset)
        .await?;

    let response = JobListResponse {
        jobs: records.into_iter().map(JobView::from).collect(),
        pagination: Pagination {
            total,
            limit,
            offset,
            has_more: offset + limit < total,
        },
    };
    Ok(Json(ApiResponse::success(response)))
}

fn parse_status_filter(raw: Option<&str>) -> Result<Vec<JobStatus>, CoreError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            JobStatus::parse(s).ok_or_else(|| {
                CoreError::new(
                    ErrorCode::Validation,
                    format!("Unknown job status: {}", s),
                )
            })
        })
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub message: String,
}

pub async fn resume_job(
    State(state): State<AppState>,
    requester: RequesterId,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, CoreError> {
    state.resume.resume_one(JobId(job_id), requester.0).await?;
    Ok(Json(ApiResponse::success(ResumeResponse {
        message: "Job resumed successfully".to_string(),
    })))
}

pub async fn resume_all_jobs(
    State(state): State<AppState>,
    requester: RequesterId,
) -> Result<impl IntoResponse, CoreError> {
    let summary = state.resume.resume_all(requester.0).await?;
    Ok(Json(ApiResponse::success(summary)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_filter_parsing() {
        assert!(parse_status_filter(None).unwrap().is_empty());
        assert_eq!(
            parse_status_filter(Some("FAILED,FAILED_NO_CREDITS")).unwrap(),
            vec![JobStatus::Failed, JobStatus::FailedNoCredits]
        );
        assert!(parse_status_filter(Some("RUNNING")).is_err());
    }
}
