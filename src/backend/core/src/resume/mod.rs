//! Resume coordinator: user-initiated recovery of failed jobs.
//!
//! The checks run in a fixed order so every failure mode maps to one stable
//! outcome: existence → ownership → resumable state → orphan trap → credit
//! check → reset to PENDING → broker task recovery. Recovery prefers retrying
//! the original broker task; when that task is gone the payload is rebuilt
//! from the durable record, which only works for stages whose inputs are
//! durably stored.

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::{JobId, JobRecord, JobStatus, TaskPayload};
use crate::queue::{Dispatcher, QueueBroker, TaskRef};
use crate::store::Store;

/// Outcome of a batch resume.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSummary {
    pub resumed_count: u64,
    pub total_failed_found: u64,
}

/// Coordinates job recovery against the store and the broker.
pub struct ResumeCoordinator {
    store: Arc<dyn Store>,
    broker: Arc<dyn QueueBroker>,
    dispatcher: Arc<Dispatcher>,
}

impl ResumeCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn QueueBroker>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self { store, broker, dispatcher }
    }

    /// Resume a single failed job for `requester`.
    pub async fn resume_one(&self, job_id: JobId, requester: Uuid) -> Result<()> {
        let record = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::new(ErrorCode::JobNotFound, "Job not found"))?;

        if record.user_id != requester {
            return Err(CoreError::new(
                ErrorCode::NotOwned,
                "Not authorized to resume this job",
            ));
        }

        if !record.status.is_resumable() {
            return Err(CoreError::with_internal(
                ErrorCode::InvalidJobState,
                "Only failed jobs can be resumed",
                format!("job {} is {}", record.id, record.status),
            ));
        }

        self.check_orphan(&record).await?;
        self.check_credits(&record).await?;
        let plan = self.recovery_plan(&record).await?;

        // PENDING goes in before the task is live: a worker that leases the
        // recovered task immediately writes its own terminal status, and that
        // write must land after this one, never under it.
        self.store
            .update_job_status(record.id, JobStatus::Pending, None)
            .await?;
        self.execute_plan(&record, plan).await?;

        tracing::info!(job_id = %record.id, job_type = %record.job_type, "Job resumed");
        metrics::counter!("litrev_jobs_resumed_total").increment(1);
        Ok(())
    }

    /// Resume every failed job the user owns. Per-job failures are skipped,
    /// never aborting the batch.
    pub async fn resume_all(&self, requester: Uuid) -> Result<ResumeSummary> {
        let balance = self.store.balance(requester).await?;
        if balance <= 0.0 {
            return Err(CoreError::new(
                ErrorCode::InsufficientCredits,
                "Cannot resume jobs. Balance is zero or negative.",
            ));
        }

        let failed = self.store.failed_jobs(requester).await?;
        let total_failed_found = failed.len() as u64;
        let mut resumed_count = 0;

        for record in failed {
            match self.resume_one(record.id, requester).await {
                Ok(()) => resumed_count += 1,
                Err(e) => {
                    tracing::warn!(job_id = %record.id, error = %e, "Skipping job in batch resume");
                }
            }
        }

        Ok(ResumeSummary { resumed_count, total_failed_found })
    }

    /// A job whose parent project is gone can never run again. The record is
    /// stamped with a permanent failure; repeating the resume re-arrives here
    /// with the same outcome and no further state change.
    async fn check_orphan(&self, record: &JobRecord) -> Result<()> {
        let Some(project_id) = record.project_id else {
            return Ok(());
        };
        if self.store.project_exists(project_id).await? {
            return Ok(());
        }
        self.store
            .update_job_status(
                record.id,
                JobStatus::Failed,
                Some("Project no longer exists (job orphaned)"),
            )
            .await?;
        Err(CoreError::new(
            ErrorCode::OrphanedParent,
            "Parent project no longer exists. Job cannot be resumed.",
        ))
    }

    async fn check_credits(&self, record: &JobRecord) -> Result<()> {
        let balance = self.store.balance(record.user_id).await?;
        if balance > 0.0 {
            return Ok(());
        }
        self.store
            .update_job_status(
                record.id,
                JobStatus::FailedNoCredits,
                Some("Insufficient credits to resume"),
            )
            .await?;
        Err(CoreError::new(
            ErrorCode::InsufficientCredits,
            "Please recharge credits to resume this job",
        ))
    }

    /// Decide how the broker task comes back, without mutating anything.
    /// Retrying the original task is preferred; when it is gone the payload
    /// is rebuilt from the durable record.
    async fn recovery_plan(&self, record: &JobRecord) -> Result<RecoveryPlan> {
        let queue = record.job_type.queue();

        if let Some(task_ref) = record.external_task_ref.as_deref().and_then(TaskRef::parse) {
            if self.broker.lookup(queue, &task_ref).await?.is_some() {
                return Ok(RecoveryPlan::Retry(task_ref));
            }
        }

        match TaskPayload::reconstruct(record) {
            Some(payload) => Ok(RecoveryPlan::Redispatch(payload)),
            // No broker task and no durable inputs; the record stays failed
            // and untouched.
            None => Err(CoreError::new(
                ErrorCode::JobDataLost,
                "Job data expired and could not be reconstructed.",
            )),
        }
    }

    async fn execute_plan(&self, record: &JobRecord, plan: RecoveryPlan) -> Result<()> {
        let queue = record.job_type.queue();
        match plan {
            RecoveryPlan::Retry(task_ref) => {
                if let Err(e) = self.broker.retry(queue, &task_ref).await {
                    // The record was already flipped to PENDING; roll it back
                    // so the job stays resumable.
                    if let Err(update_err) = self
                        .store
                        .update_job_status(record.id, JobStatus::Failed, Some(e.user_message()))
                        .await
                    {
                        tracing::error!(job_id = %record.id, error = %update_err, "Failed to roll back resume");
                    }
                    return Err(e);
                }
                Ok(())
            }
            // Dispatch failure stamps FAILED on the record itself.
            RecoveryPlan::Redispatch(payload) => self
                .dispatcher
                .dispatch(record.id, record.job_type, payload)
                .await
                .map(|_| ()),
        }
    }
}

/// How a resumed job's broker task gets back in flight.
enum RecoveryPlan {
    /// The original broker task survived; re-submit it.
    Retry(TaskRef),
    /// The task is gone; enqueue a rebuilt payload.
    Redispatch(TaskPayload),
}
