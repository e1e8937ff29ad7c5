//! Persistence seam.
//!
//! All durable state sits behind the [`Store`] trait so workers, the resume
//! coordinator, and the credit gate never hold a database handle directly.
//! [`PgStore`] is the production implementation; [`MemoryStore`] backs tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::{IntentFields, JobId, JobRecord, JobStatus};
use crate::pipeline::{PaperScore, QueryOutput, Stage};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// One append-only usage ledger row. Written in the same transaction as the
/// balance decrement it accounts for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub project_id: Option<Uuid>,
    pub paper_id: Option<Uuid>,
    pub stage: Stage,
    pub model_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Cost in the base currency (USD).
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

/// Pricing row for one model, in cents per million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model_name: String,
    pub provider: String,
    pub input_cents_per_million: f64,
    pub output_cents_per_million: f64,
}

/// Everything the scoring stage needs for one candidate paper.
#[derive(Debug, Clone)]
pub struct PaperInputs {
    pub project_id: Uuid,
    pub title: String,
    pub abstract_text: String,
    pub user_abstract: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable storage operations used by the orchestration core.
#[async_trait]
pub trait Store: Send + Sync {
    // ─── Job records ───────────────────────────────────────────────────────

    async fn insert_job(&self, record: &JobRecord) -> Result<()>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>>;

    /// Set status and failure reason. `None` clears a previous reason.
    async fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> Result<()>;

    /// Overwrite the broker task handle stored on the record.
    async fn set_task_ref(&self, job_id: JobId, task_ref: &str) -> Result<()>;

    /// Owner-scoped listing, newest first. Empty `statuses` means all.
    /// Returns the page plus the total match count.
    async fn list_jobs(
        &self,
        user_id: Uuid,
        statuses: &[JobStatus],
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<JobRecord>, i64)>;

    /// All FAILED / FAILED_NO_CREDITS jobs owned by the user.
    async fn failed_jobs(&self, user_id: Uuid) -> Result<Vec<JobRecord>>;

    // ─── Projects and papers ───────────────────────────────────────────────

    async fn project_exists(&self, project_id: Uuid) -> Result<bool>;

    /// The user's research abstract for a project.
    async fn project_abstract(&self, project_id: Uuid) -> Result<Option<String>>;

    /// Intent fields persisted by stage 1, if the stage has run.
    async fn project_intent(&self, project_id: Uuid) -> Result<Option<IntentFields>>;

    async fn save_intent_output(&self, project_id: Uuid, fields: &IntentFields) -> Result<()>;

    async fn save_query_output(&self, project_id: Uuid, output: &QueryOutput) -> Result<()>;

    async fn paper_inputs(&self, paper_id: Uuid) -> Result<Option<PaperInputs>>;

    /// Persist a paper score and mark the paper scored.
    async fn save_paper_score(&self, paper_id: Uuid, score: &PaperScore) -> Result<()>;

    /// Papers in the project still awaiting a score.
    async fn unscored_paper_count(&self, project_id: Uuid) -> Result<i64>;

    async fn user_email(&self, user_id: Uuid) -> Result<Option<String>>;

    // ─── Credits ───────────────────────────────────────────────────────────

    async fn balance(&self, user_id: Uuid) -> Result<f64>;

    /// Append the ledger entry and decrement the balance by `credits`, in one
    /// atomic unit. The only balance-mutating path in the system.
    async fn charge(&self, entry: &UsageLedgerEntry, credits: f64) -> Result<()>;

    async fn model_pricing(&self, model_name: &str) -> Result<Option<ModelPricing>>;

    /// Active currency→credit multiplier, read fresh on every charge.
    /// `None` when no multiplier has been configured.
    async fn credit_multiplier(&self) -> Result<Option<f64>>;
}
