//! Queue consumers.
//!
//! One worker per queue. Each leased task runs through a fixed sequence:
//! resolve the durable record, mark it PROCESSING, run the stage, persist
//! output, charge credits, chain follow-up jobs. Whatever happens, the final
//! step writes a terminal status back to the record before the task is acked
//! or nacked, so the durable state never silently diverges from the broker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::credits::{CreditGate, StageUsage};
use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::{
    JobRecord, JobStatus, JobType, NotificationKind, StageData, TaskPayload,
};
use crate::pipeline::{
    IntentStage, LlmProvider, QueryStage, ScoringStage, Stage,
};
use crate::queue::{BrokerTask, Dispatcher, QueueBroker, QueueName};
use crate::store::Store;

pub mod notifier;

pub use notifier::{LogNotifier, Notification, Notifier};

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Plumbing
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a queue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name used in logs.
    pub name: String,
    /// Sleep between polls when the queue is empty (milliseconds).
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    pub fn for_queue(queue: QueueName) -> Self {
        Self {
            name: format!("litrev-worker-{}", queue),
            poll_interval_ms: 500,
        }
    }
}

/// Statistics for a queue worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: tokio::sync::watch::Sender<bool>,
    stats: WorkerStats,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// A consumer loop for one queue.
pub struct Worker {
    queue: QueueName,
    broker: Arc<dyn QueueBroker>,
    store: Arc<dyn Store>,
    gate: Arc<CreditGate>,
    provider: Arc<dyn LlmProvider>,
    notifier: Arc<dyn Notifier>,
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: QueueName,
        broker: Arc<dyn QueueBroker>,
        store: Arc<dyn Store>,
        gate: Arc<CreditGate>,
        provider: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
        dispatcher: Arc<Dispatcher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            broker,
            store,
            gate,
            provider,
            notifier,
            dispatcher,
            config,
            stats: WorkerStats::default(),
        }
    }

    /// Start the consumer loop, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let stats = self.stats.clone();
        let name = self.config.name.clone();
        let poll_interval =
            tokio::time::Duration::from_millis(self.config.poll_interval_ms);

        tokio::spawn(async move {
            tracing::info!(worker = %name, queue = %self.queue, "Worker started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!(worker = %name, "Worker shutting down");
                            break;
                        }
                    }
                    processed = self.process_one() => {
                        match processed {
                            Ok(true) => {}
                            Ok(false) => tokio::time::sleep(poll_interval).await,
                            Err(e) => {
                                tracing::error!(worker = %name, error = %e, "Dequeue failed");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    }
                }
            }
            tracing::info!(worker = %name, "Worker stopped");
        });

        WorkerHandle { shutdown: shutdown_tx, stats }
    }

    /// Lease and process a single task. Returns `Ok(false)` when the queue
    /// had nothing ready.
    pub async fn process_one(&self) -> Result<bool> {
        let Some(task) = self.broker.dequeue(self.queue).await? else {
            if let Ok(depth) = self.broker.depth(self.queue).await {
                metrics::gauge!("litrev_queue_depth", "queue" => self.queue.as_str())
                    .set(depth as f64);
            }
            return Ok(false);
        };
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.handle_task(task).await;
        Ok(true)
    }

    async fn handle_task(&self, task: BrokerTask) {
        let job_id = task.payload.background_job_id;
        let record = match self.store.get_job(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Task outlived its record; nothing durable to update.
                tracing::warn!(queue = %self.queue, job_id = %job_id, "Task without a job record, dropping");
                let _ = self.broker.ack(self.queue, &task.task_ref).await;
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load job record");
                let _ = self.broker.nack(self.queue, &task.task_ref, &e.to_string()).await;
                return;
            }
        };

        if let Err(e) = self.mark_processing(&record, &task).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job processing");
            let _ = self.broker.nack(self.queue, &task.task_ref, &e.to_string()).await;
            return;
        }

        let outcome = self.execute(&record, &task).await;
        self.finish(&record, &task, outcome).await;
    }

    async fn mark_processing(&self, record: &JobRecord, task: &BrokerTask) -> Result<()> {
        self.store
            .update_job_status(record.id, JobStatus::Processing, None)
            .await?;
        self.store
            .set_task_ref(record.id, &task.task_ref.to_string())
            .await?;
        Ok(())
    }

    /// Write the terminal status, then settle the broker task. The status
    /// write comes first: a worker crash after it leaves a resumable record.
    async fn finish(&self, record: &JobRecord, task: &BrokerTask, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                if let Err(e) = self
                    .store
                    .update_job_status(record.id, JobStatus::Completed, None)
                    .await
                {
                    tracing::error!(job_id = %record.id, error = %e, "Failed to mark job completed");
                }
                if let Err(e) = self.broker.ack(self.queue, &task.task_ref).await {
                    tracing::error!(job_id = %record.id, error = %e, "Failed to ack task");
                }
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("litrev_jobs_completed_total", "queue" => self.queue.as_str())
                    .increment(1);
                tracing::info!(job_id = %record.id, job_type = %record.job_type, "Job completed");
            }
            Err(e) => {
                let status = if e.code() == ErrorCode::InsufficientCredits {
                    JobStatus::FailedNoCredits
                } else {
                    JobStatus::Failed
                };
                let reason = e.user_message().to_string();
                if let Err(update_err) = self
                    .store
                    .update_job_status(record.id, status, Some(&reason))
                    .await
                {
                    tracing::error!(job_id = %record.id, error = %update_err, "Failed to mark job failed");
                }

                // Terminal errors are consumed; retryable ones go back to the
                // broker for its backoff schedule.
                let settle = if e.is_retryable() {
                    self.broker.nack(self.queue, &task.task_ref, &reason).await
                } else {
                    self.broker.ack(self.queue, &task.task_ref).await
                };
                if let Err(settle_err) = settle {
                    tracing::error!(job_id = %record.id, error = %settle_err, "Failed to settle task");
                }

                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("litrev_jobs_failed_total", "queue" => self.queue.as_str())
                    .increment(1);
                e.log();
            }
        }
    }

    // ─── Stage execution ─────────────────────────────────────────────────

    async fn execute(&self, record: &JobRecord, task: &BrokerTask) -> Result<()> {
        match record.job_type {
            JobType::InitIntent => self.run_intent(record, task).await,
            JobType::InitQuery => self.run_query(record, task).await,
            JobType::PaperScoring => self.run_scoring(record, task).await,
            JobType::SendEmail => self.run_email(record, task).await,
        }
    }

    async fn run_intent(&self, record: &JobRecord, task: &BrokerTask) -> Result<()> {
        let project_id = require_project(record)?;
        self.gate.preflight(record.user_id).await?;

        let abstract_text = match &task.payload.stage_data {
            Some(StageData::Intent { abstract_text }) => abstract_text.clone(),
            Some(_) => return Err(stage_data_mismatch(record)),
            None => self.load_project_abstract(project_id).await?,
        };

        let request = IntentStage::build_request(&abstract_text);
        let completion = self.provider.complete(request).await?;
        let fields = IntentStage::parse_output(&completion.content)?;
        self.store.save_intent_output(project_id, &fields).await?;

        self.gate
            .charge(StageUsage {
                user_id: record.user_id,
                project_id: Some(project_id),
                paper_id: None,
                stage: Stage::Intent,
                model_name: completion.model_name,
                input_tokens: completion.input_tokens,
                output_tokens: completion.output_tokens,
            })
            .await?;

        // Chain stage 2. Enqueue happens only after the intent output is
        // durable, so the query job can always rebuild its input.
        let next = JobRecord::new(record.user_id, JobType::InitQuery).for_project(project_id);
        self.store.insert_job(&next).await?;
        let payload = TaskPayload::new(&next, StageData::Query(fields));
        self.dispatcher.dispatch(next.id, next.job_type, payload).await?;
        Ok(())
    }

    async fn run_query(&self, record: &JobRecord, task: &BrokerTask) -> Result<()> {
        let project_id = require_project(record)?;
        self.gate.preflight(record.user_id).await?;

        let fields = match &task.payload.stage_data {
            Some(StageData::Query(fields)) => fields.clone(),
            Some(_) => return Err(stage_data_mismatch(record)),
            None => {
                self.ensure_project_alive(project_id).await?;
                self.store.project_intent(project_id).await?.ok_or_else(|| {
                    CoreError::with_internal(
                        ErrorCode::StageExecutionError,
                        "Query generation is missing its intent input",
                        format!("project {} has no persisted intent fields", project_id),
                    )
                })?
            }
        };

        let request = QueryStage::build_request(&fields);
        let completion = self.provider.complete(request).await?;
        let output = QueryStage::parse_output(&completion.content)?;
        self.store.save_query_output(project_id, &output).await?;

        self.gate
            .charge(StageUsage {
                user_id: record.user_id,
                project_id: Some(project_id),
                paper_id: None,
                stage: Stage::Queries,
                model_name: completion.model_name,
                input_tokens: completion.input_tokens,
                output_tokens: completion.output_tokens,
            })
            .await?;

        self.dispatch_notification(record, project_id, NotificationKind::ProjectInitComplete)
            .await;
        Ok(())
    }

    async fn run_scoring(&self, record: &JobRecord, task: &BrokerTask) -> Result<()> {
        let project_id = require_project(record)?;
        let paper_id = record.paper_id.ok_or_else(|| {
            CoreError::with_internal(
                ErrorCode::StageExecutionError,
                "Scoring job is missing its paper",
                format!("job {} has no paper_id", record.id),
            )
        })?;
        self.gate.preflight(record.user_id).await?;

        let (user_abstract, title, candidate_abstract) = match &task.payload.stage_data {
            Some(StageData::Scoring { user_abstract, candidate_abstract, candidate_title }) => (
                user_abstract.clone(),
                candidate_title.clone(),
                candidate_abstract.clone(),
            ),
            Some(_) => return Err(stage_data_mismatch(record)),
            None => {
                self.ensure_project_alive(project_id).await?;
                let inputs = self.store.paper_inputs(paper_id).await?.ok_or_else(|| {
                    CoreError::with_internal(
                        ErrorCode::StageExecutionError,
                        "Scoring job's paper no longer exists",
                        format!("paper {} not found", paper_id),
                    )
                })?;
                (inputs.user_abstract, inputs.title, inputs.abstract_text)
            }
        };

        let request = ScoringStage::build_request(&user_abstract, &title, &candidate_abstract);
        let completion = self.provider.complete(request).await?;
        let score = ScoringStage::parse_output(&completion.content)?;
        self.store.save_paper_score(paper_id, &score).await?;

        self.gate
            .charge(StageUsage {
                user_id: record.user_id,
                project_id: Some(project_id),
                paper_id: Some(paper_id),
                stage: Stage::Score,
                model_name: completion.model_name,
                input_tokens: completion.input_tokens,
                output_tokens: completion.output_tokens,
            })
            .await?;

        // Re-evaluated per completion. Racing completions may both see zero
        // and both announce; delivery is duplicate-tolerant by design.
        let remaining = self.store.unscored_paper_count(project_id).await?;
        if remaining == 0 {
            self.dispatch_notification(
                record,
                project_id,
                NotificationKind::ProjectScoringComplete,
            )
            .await;
        }
        Ok(())
    }

    async fn run_email(&self, record: &JobRecord, task: &BrokerTask) -> Result<()> {
        let kind = match &task.payload.stage_data {
            Some(StageData::Email { kind }) => *kind,
            Some(_) => return Err(stage_data_mismatch(record)),
            // Email payloads are never reconstructed; a bare payload means
            // the announcement content is unrecoverable.
            None => {
                return Err(CoreError::with_internal(
                    ErrorCode::JobDataLost,
                    "Notification content is no longer available",
                    format!("email job {} has no inline payload", record.id),
                ))
            }
        };

        let recipient_email = self.store.user_email(record.user_id).await?;
        self.notifier
            .notify(Notification {
                user_id: record.user_id,
                recipient_email,
                project_id: record.project_id,
                kind,
            })
            .await
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    async fn load_project_abstract(&self, project_id: Uuid) -> Result<String> {
        self.store.project_abstract(project_id).await?.ok_or_else(|| orphaned(project_id))
    }

    async fn ensure_project_alive(&self, project_id: Uuid) -> Result<()> {
        if self.store.project_exists(project_id).await? {
            Ok(())
        } else {
            Err(orphaned(project_id))
        }
    }

    /// Best-effort follow-up: a lost notification never fails the stage that
    /// produced durable output.
    async fn dispatch_notification(
        &self,
        record: &JobRecord,
        project_id: Uuid,
        kind: NotificationKind,
    ) {
        let job = JobRecord::new(record.user_id, JobType::SendEmail).for_project(project_id);
        let insert = self.store.insert_job(&job).await;
        if let Err(e) = insert {
            tracing::warn!(project_id = %project_id, error = %e, "Failed to create notification job");
            return;
        }
        let payload = TaskPayload::new(&job, StageData::Email { kind });
        if let Err(e) = self.dispatcher.dispatch(job.id, job.job_type, payload).await {
            tracing::warn!(project_id = %project_id, error = %e, "Failed to dispatch notification job");
        }
    }
}

fn require_project(record: &JobRecord) -> Result<Uuid> {
    record.project_id.ok_or_else(|| {
        CoreError::with_internal(
            ErrorCode::StageExecutionError,
            "Job is missing its project",
            format!("job {} has no project_id", record.id),
        )
    })
}

fn stage_data_mismatch(record: &JobRecord) -> CoreError {
    CoreError::with_internal(
        ErrorCode::StageExecutionError,
        "Job payload does not match its job type",
        format!("job {} ({}) carried foreign stage data", record.id, record.job_type),
    )
}

fn orphaned(project_id: Uuid) -> CoreError {
    CoreError::with_internal(
        ErrorCode::OrphanedParent,
        "Project no longer exists (job orphaned)",
        format!("project {} not found", project_id),
    )
}
