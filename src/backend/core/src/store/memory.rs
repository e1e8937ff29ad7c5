//! In-memory store for tests and development.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::{IntentFields, JobId, JobRecord, JobStatus};
use crate::pipeline::{PaperScore, QueryOutput};

use super::{ModelPricing, PaperInputs, Store, UsageLedgerEntry};

#[derive(Debug, Clone)]
struct UserRow {
    email: String,
    balance: f64,
}

#[derive(Debug, Clone)]
struct ProjectRow {
    user_id: Uuid,
    abstract_text: String,
    intent: Option<IntentFields>,
    queries: Option<QueryOutput>,
}

#[derive(Debug, Clone)]
struct PaperRow {
    project_id: Uuid,
    title: String,
    abstract_text: String,
    score: Option<PaperScore>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    users: HashMap<Uuid, UserRow>,
    projects: HashMap<Uuid, ProjectRow>,
    papers: HashMap<Uuid, PaperRow>,
    ledger: Vec<UsageLedgerEntry>,
    pricing: HashMap<String, ModelPricing>,
    multiplier: Option<f64>,
}

/// In-memory [`Store`] with seeding helpers for tests.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    // ─── Seeding helpers ─────────────────────────────────────────────────

    pub fn add_user(&self, email: &str, balance: f64) -> Uuid {
        let user_id = Uuid::new_v4();
        self.inner.lock().users.insert(
            user_id,
            UserRow { email: email.to_string(), balance },
        );
        user_id
    }

    pub fn set_balance(&self, user_id: Uuid, balance: f64) {
        if let Some(user) = self.inner.lock().users.get_mut(&user_id) {
            user.balance = balance;
        }
    }

    pub fn add_project(&self, user_id: Uuid, abstract_text: &str) -> Uuid {
        let project_id = Uuid::new_v4();
        self.inner.lock().projects.insert(
            project_id,
            ProjectRow {
                user_id,
                abstract_text: abstract_text.to_string(),
                intent: None,
                queries: None,
            },
        );
        project_id
    }

    /// Delete a project row, orphaning any jobs that point at it.
    pub fn remove_project(&self, project_id: Uuid) {
        self.inner.lock().projects.remove(&project_id);
    }

    pub fn add_paper(&self, project_id: Uuid, title: &str, abstract_text: &str) -> Uuid {
        let paper_id = Uuid::new_v4();
        self.inner.lock().papers.insert(
            paper_id,
            PaperRow {
                project_id,
                title: title.to_string(),
                abstract_text: abstract_text.to_string(),
                score: None,
            },
        );
        paper_id
    }

    pub fn set_pricing(&self, pricing: ModelPricing) {
        self.inner.lock().pricing.insert(pricing.model_name.clone(), pricing);
    }

    pub fn set_multiplier(&self, multiplier: f64) {
        self.inner.lock().multiplier = Some(multiplier);
    }

    // ─── Inspection helpers ──────────────────────────────────────────────

    pub fn ledger_snapshot(&self) -> Vec<UsageLedgerEntry> {
        self.inner.lock().ledger.clone()
    }

    pub fn project_intent_snapshot(&self, project_id: Uuid) -> Option<IntentFields> {
        self.inner.lock().projects.get(&project_id).and_then(|p| p.intent.clone())
    }

    pub fn project_queries_snapshot(&self, project_id: Uuid) -> Option<QueryOutput> {
        self.inner.lock().projects.get(&project_id).and_then(|p| p.queries.clone())
    }

    pub fn paper_score_snapshot(&self, paper_id: Uuid) -> Option<PaperScore> {
        self.inner.lock().papers.get(&paper_id).and_then(|p| p.score.clone())
    }

    fn missing_job(job_id: JobId) -> CoreError {
        CoreError::with_internal(
            ErrorCode::DatabaseError,
            "A database error occurred",
            format!("update of unknown job {}", job_id),
        )
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<()> {
        self.inner.lock().jobs.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.inner.lock().jobs.get(&job_id).cloned())
    }

    async fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or_else(|| Self::missing_job(job_id))?;
        job.status = status;
        job.failure_reason = failure_reason.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_task_ref(&self, job_id: JobId, task_ref: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&job_id).ok_or_else(|| Self::missing_job(job_id))?;
        job.external_task_ref = Some(task_ref.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list_jobs(
        &self,
        user_id: Uuid,
        statuses: &[JobStatus],
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<JobRecord>, i64)> {
        let inner = self.inner.lock();
        let mut matched: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .filter(|j| statuses.is_empty() || statuses.contains(&j.status))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len() as i64;
        let page = matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn failed_jobs(&self, user_id: Uuid) -> Result<Vec<JobRecord>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|j| j.user_id == user_id && j.status.is_resumable())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn project_exists(&self, project_id: Uuid) -> Result<bool> {
        Ok(self.inner.lock().projects.contains_key(&project_id))
    }

    async fn project_abstract(&self, project_id: Uuid) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .projects
            .get(&project_id)
            .map(|p| p.abstract_text.clone()))
    }

    async fn project_intent(&self, project_id: Uuid) -> Result<Option<IntentFields>> {
        Ok(self.inner.lock().projects.get(&project_id).and_then(|p| p.intent.clone()))
    }

    async fn save_intent_output(&self, project_id: Uuid, fields: &IntentFields) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(project) = inner.projects.get_mut(&project_id) {
            project.intent = Some(fields.clone());
        }
        Ok(())
    }

    async fn save_query_output(&self, project_id: Uuid, output: &QueryOutput) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(project) = inner.projects.get_mut(&project_id) {
            project.queries = Some(output.clone());
        }
        Ok(())
    }

    async fn paper_inputs(&self, paper_id: Uuid) -> Result<Option<PaperInputs>> {
        let inner = self.inner.lock();
        let Some(paper) = inner.papers.get(&paper_id) else {
            return Ok(None);
        };
        let Some(project) = inner.projects.get(&paper.project_id) else {
            return Ok(None);
        };
        Ok(Some(PaperInputs {
            project_id: paper.project_id,
            title: paper.title.clone(),
            abstract_text: paper.abstract_text.clone(),
            user_abstract: project.abstract_text.clone(),
        }))
    }

    async fn save_paper_score(&self, paper_id: Uuid, score: &PaperScore) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(paper) = inner.papers.get_mut(&paper_id) {
            paper.score = Some(score.clone());
        }
        Ok(())
    }

    async fn unscored_paper_count(&self, project_id: Uuid) -> Result<i64> {
        let inner = self.inner.lock();
        Ok(inner
            .papers
            .values()
            .filter(|p| p.project_id == project_id && p.score.is_none())
            .count() as i64)
    }

    async fn user_email(&self, user_id: Uuid) -> Result<Option<String>> {
        Ok(self.inner.lock().users.get(&user_id).map(|u| u.email.clone()))
    }

    async fn balance(&self, user_id: Uuid) -> Result<f64> {
        Ok(self.inner.lock().users.get(&user_id).map(|u| u.balance).unwrap_or(0.0))
    }

    async fn charge(&self, entry: &UsageLedgerEntry, credits: f64) -> Result<()> {
        // Single lock covers both writes, mirroring the SQL transaction.
        let mut inner = self.inner.lock();
        inner.ledger.push(entry.clone());
        if let Some(user) = inner.users.get_mut(&entry.user_id) {
            user.balance -= credits;
        }
        Ok(())
    }

    async fn model_pricing(&self, model_name: &str) -> Result<Option<ModelPricing>> {
        Ok(self.inner.lock().pricing.get(model_name).cloned())
    }

    async fn credit_multiplier(&self) -> Result<Option<f64>> {
        Ok(self.inner.lock().multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobType;
    use crate::pipeline::Stage;

    #[tokio::test]
    async fn test_status_update_clears_reason() {
        let store = MemoryStore::new();
        let user_id = store.add_user("a@example.com", 10.0);
        let record = JobRecord::new(user_id, JobType::InitIntent);
        store.insert_job(&record).await.unwrap();

        store
            .update_job_status(record.id, JobStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let job = store.get_job(record.id).await.unwrap().unwrap();
        assert_eq!(job.failure_reason.as_deref(), Some("boom"));

        store.update_job_status(record.id, JobStatus::Pending, None).await.unwrap();
        let job = store.get_job(record.id).await.unwrap().unwrap();
        assert!(job.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_charge_is_single_locked_unit() {
        let store = MemoryStore::new();
        let user_id = store.add_user("a@example.com", 100.0);
        let entry = UsageLedgerEntry {
            id: Uuid::new_v4(),
            user_id,
            project_id: None,
            paper_id: None,
            stage: Stage::Intent,
            model_name: "test-model".into(),
            input_tokens: 1000,
            output_tokens: 500,
            cost_usd: 0.02,
            created_at: Utc::now(),
        };
        store.charge(&entry, 2.0).await.unwrap();
        assert_eq!(store.balance(user_id).await.unwrap(), 98.0);
        assert_eq!(store.ledger_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_list_jobs_filters_and_paginates() {
        let store = MemoryStore::new();
        let user_id = store.add_user("a@example.com", 0.0);
        let other = store.add_user("b@example.com", 0.0);
        for _ in 0..3 {
            store.insert_job(&JobRecord::new(user_id, JobType::PaperScoring)).await.unwrap();
        }
        store.insert_job(&JobRecord::new(other, JobType::PaperScoring)).await.unwrap();

        let (page, total) = store.list_jobs(user_id, &[], 2, 0).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);

        let (page, total) = store
            .list_jobs(user_id, &[JobStatus::Failed], 10, 0)
            .await
            .unwrap();
        assert_eq!(total, 0);
        assert!(page.is_empty());
    }
}
