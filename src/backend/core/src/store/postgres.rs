//! PostgreSQL store backed by sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::{IntentFields, JobId, JobRecord, JobStatus, JobType};
use crate::pipeline::{PaperScore, QueryOutput};

use super::{ModelPricing, PaperInputs, Store, UsageLedgerEntry};

/// Database connection and operations.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types (for sqlx queries)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    user_id: Uuid,
    project_id: Option<Uuid>,
    paper_id: Option<Uuid>,
    job_type: String,
    status: String,
    failure_reason: Option<String>,
    external_task_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord> {
        let job_type = JobType::parse(&self.job_type).ok_or_else(|| {
            CoreError::with_internal(
                ErrorCode::DatabaseError,
                "A database error occurred",
                format!("unknown job_type {:?} on job {}", self.job_type, self.id),
            )
        })?;
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            CoreError::with_internal(
                ErrorCode::DatabaseError,
                "A database error occurred",
                format!("unknown status {:?} on job {}", self.status, self.id),
            )
        })?;
        Ok(JobRecord {
            id: JobId(self.id),
            user_id: self.user_id,
            project_id: self.project_id,
            paper_id: self.paper_id,
            job_type,
            status,
            failure_reason: self.failure_reason,
            external_task_ref: self.external_task_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PricingRow {
    model_name: String,
    provider: String,
    input_cents_per_million: f64,
    output_cents_per_million: f64,
}

const JOB_COLUMNS: &str = "id, user_id, project_id, paper_id, job_type, status, \
                           failure_reason, external_task_ref, created_at, updated_at";

#[async_trait]
impl Store for PgStore {
    // ─── Job records ───────────────────────────────────────────────────────

    async fn insert_job(&self, record: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO background_jobs
                (id, user_id, project_id, paper_id, job_type, status,
                 failure_reason, external_task_ref, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id.0)
        .bind(record.user_id)
        .bind(record.project_id)
        .bind(record.paper_id)
        .bind(record.job_type.as_str())
        .bind(record.status.as_str())
        .bind(&record.failure_reason)
        .bind(&record.external_task_ref)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM background_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_record).transpose()
    }

    async fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE background_jobs
            SET status = $2, failure_reason = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .bind(status.as_str())
        .bind(failure_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_ref(&self, job_id: JobId, task_ref: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE background_jobs
            SET external_task_ref = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .bind(task_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_jobs(
        &self,
        user_id: Uuid,
        statuses: &[JobStatus],
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<JobRecord>, i64)> {
        let status_strings: Vec<String> =
            statuses.iter().map(|s| s.as_str().to_string()).collect();

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM background_jobs
            WHERE user_id = $1
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
            JOB_COLUMNS
        ))
        .bind(user_id)
        .bind(&status_strings)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM background_jobs
            WHERE user_id = $1
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            "#,
        )
        .bind(user_id)
        .bind(&status_strings)
        .fetch_one(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(JobRow::into_record)
            .collect::<Result<Vec<_>>>()?;
        Ok((records, total))
    }

    async fn failed_jobs(&self, user_id: Uuid) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM background_jobs
            WHERE user_id = $1 AND status IN ('FAILED', 'FAILED_NO_CREDITS')
            ORDER BY created_at ASC
            "#,
            JOB_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_record).collect()
    }

    // ─── Projects and papers ───────────────────────────────────────────────

    async fn project_exists(&self, project_id: Uuid) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM projects WHERE id = $1)")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn project_abstract(&self, project_id: Uuid) -> Result<Option<String>> {
        let abstract_text: Option<String> =
            sqlx::query_scalar("SELECT abstract_text FROM projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(abstract_text)
    }

    async fn project_intent(&self, project_id: Uuid) -> Result<Option<IntentFields>> {
        let intent: Option<Option<serde_json::Value>> =
            sqlx::query_scalar("SELECT intent FROM projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        match intent.flatten() {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save_intent_output(&self, project_id: Uuid, fields: &IntentFields) -> Result<()> {
        sqlx::query("UPDATE projects SET intent = $2, updated_at = NOW() WHERE id = $1")
            .bind(project_id)
            .bind(serde_json::to_value(fields)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_query_output(&self, project_id: Uuid, output: &QueryOutput) -> Result<()> {
        sqlx::query("UPDATE projects SET queries = $2, updated_at = NOW() WHERE id = $1")
            .bind(project_id)
            .bind(serde_json::to_value(output)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn paper_inputs(&self, paper_id: Uuid) -> Result<Option<PaperInputs>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            project_id: Uuid,
            title: String,
            abstract_text: String,
            user_abstract: String,
        }

        let row = sqlx::query_as::<_, Row>(
            r#"
            SELECT p.project_id, p.title, p.abstract_text,
                   pr.abstract_text AS user_abstract
            FROM papers p
            JOIN projects pr ON pr.id = p.project_id
            WHERE p.id = $1
            "#,
        )
        .bind(paper_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PaperInputs {
            project_id: r.project_id,
            title: r.title,
            abstract_text: r.abstract_text,
            user_abstract: r.user_abstract,
        }))
    }

    async fn save_paper_score(&self, paper_id: Uuid, score: &PaperScore) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE papers
            SET score = $2, scored = TRUE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(paper_id)
        .bind(serde_json::to_value(score)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unscored_paper_count(&self, project_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM papers WHERE project_id = $1 AND scored = FALSE",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn user_email(&self, user_id: Uuid) -> Result<Option<String>> {
        let email: Option<String> = sqlx::query_scalar("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(email)
    }

    // ─── Credits ───────────────────────────────────────────────────────────

    async fn balance(&self, user_id: Uuid) -> Result<f64> {
        let balance: Option<f64> =
            sqlx::query_scalar("SELECT credits_balance FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0.0))
    }

    async fn charge(&self, entry: &UsageLedgerEntry, credits: f64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO usage_ledger
                (id, user_id, project_id, paper_id, stage, model_name,
                 input_tokens, output_tokens, cost_usd, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.project_id)
        .bind(entry.paper_id)
        .bind(entry.stage.as_str())
        .bind(&entry.model_name)
        .bind(entry.input_tokens)
        .bind(entry.output_tokens)
        .bind(entry.cost_usd)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE users SET credits_balance = credits_balance - $2 WHERE id = $1",
        )
        .bind(entry.user_id)
        .bind(credits)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn model_pricing(&self, model_name: &str) -> Result<Option<ModelPricing>> {
        let row = sqlx::query_as::<_, PricingRow>(
            r#"
            SELECT model_name, provider, input_cents_per_million, output_cents_per_million
            FROM model_pricing
            WHERE model_name = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(model_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ModelPricing {
            model_name: r.model_name,
            provider: r.provider,
            input_cents_per_million: r.input_cents_per_million,
            output_cents_per_million: r.output_cents_per_million,
        }))
    }

    async fn credit_multiplier(&self) -> Result<Option<f64>> {
        let multiplier: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT multiplier FROM credit_multiplier_history
            WHERE is_active = TRUE
            ORDER BY effective_from DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(multiplier)
    }
}
