//! Queue broker abstraction.
//!
//! Three named queues carry the pipeline's work, each with its own retry
//! budget and backoff schedule. Delivery is at-least-once: a dequeued task is
//! leased to exactly one worker until it is acked or nacked. Nacked tasks are
//! re-delivered after backoff until the attempt limit, then parked in a
//! failed state where `lookup`/`retry` can still reach them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::{JobId, JobStatus, JobType, TaskPayload};
use crate::store::Store;

pub mod memory;
pub mod redis;

pub use memory::InMemoryBroker;
pub use redis::RedisBroker;

// ═══════════════════════════════════════════════════════════════════════════════
// Queues
// ═══════════════════════════════════════════════════════════════════════════════

/// The named queues served by the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    ProjectInit,
    PaperScoring,
    Email,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [Self::ProjectInit, Self::PaperScoring, Self::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectInit => "project-init",
            Self::PaperScoring => "paper-scoring",
            Self::Email => "email",
        }
    }

    /// Retry budget and backoff schedule for this queue.
    pub fn spec(&self) -> QueueSpec {
        match self {
            Self::ProjectInit => QueueSpec {
                max_attempts: 3,
                backoff: BackoffStrategy::Exponential { base_ms: 1_000 },
            },
            Self::PaperScoring => QueueSpec {
                max_attempts: 3,
                backoff: BackoffStrategy::Exponential { base_ms: 2_000 },
            },
            Self::Email => QueueSpec {
                max_attempts: 5,
                backoff: BackoffStrategy::Exponential { base_ms: 5_000 },
            },
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-queue retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

/// Backoff schedule between delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64 },
}

impl BackoffStrategy {
    /// Delay before re-delivering after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential { base_ms } => {
                base_ms.saturating_mul(1u64 << (attempts_made.saturating_sub(1)).min(16))
            }
        };
        Duration::from_millis(ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tasks
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque handle to a broker task, stored on the JobRecord for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef(pub Uuid);

impl TaskRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TaskRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a broker task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Ready for delivery.
    Waiting,
    /// Waiting out a backoff delay.
    Delayed,
    /// Leased to a worker.
    Active,
    /// Attempt limit exhausted; retained for lookup/retry.
    Failed,
}

/// A task as stored by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTask {
    pub task_ref: TaskRef,
    pub queue: QueueName,
    pub task_type: JobType,
    pub payload: TaskPayload,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub state: TaskState,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl BrokerTask {
    pub fn new(queue: QueueName, task_type: JobType, payload: TaskPayload) -> Self {
        Self {
            task_ref: TaskRef::new(),
            queue,
            task_type,
            payload,
            attempts_made: 0,
            max_attempts: queue.spec().max_attempts,
            state: TaskState::Waiting,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for queue broker backends.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Submit a new task; returns the handle to store on the JobRecord.
    async fn enqueue(
        &self,
        queue: QueueName,
        task_type: JobType,
        payload: TaskPayload,
    ) -> Result<TaskRef>;

    /// Lease the next ready task, promoting any delayed tasks that are due.
    /// Increments the attempt counter. Returns `None` when nothing is ready.
    async fn dequeue(&self, queue: QueueName) -> Result<Option<BrokerTask>>;

    /// Complete a leased task; the task body is dropped.
    async fn ack(&self, queue: QueueName, task_ref: &TaskRef) -> Result<()>;

    /// Fail a leased task. Re-schedules after the queue's backoff, or parks
    /// the task in [`TaskState::Failed`] once attempts are exhausted.
    async fn nack(&self, queue: QueueName, task_ref: &TaskRef, error: &str) -> Result<()>;

    /// Find a task by handle, in any state.
    async fn lookup(&self, queue: QueueName, task_ref: &TaskRef) -> Result<Option<BrokerTask>>;

    /// Re-submit a parked or delayed task preserving its original payload.
    /// Resets the attempt counter.
    async fn retry(&self, queue: QueueName, task_ref: &TaskRef) -> Result<()>;

    /// Number of tasks ready for delivery.
    async fn depth(&self, queue: QueueName) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Time-bounded enqueue used by HTTP-facing code paths.
///
/// Broker unavailability must not hang request handlers: enqueue is wrapped
/// in a timeout, and on failure the affected JobRecord is flipped to FAILED
/// so the resume protocol can recover it once the broker is back.
pub struct Dispatcher {
    broker: Arc<dyn QueueBroker>,
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn QueueBroker>, store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { broker, store, timeout }
    }

    /// Enqueue the task for `job_id` and record the task ref on the job.
    pub async fn dispatch(
        &self,
        job_id: JobId,
        job_type: JobType,
        payload: TaskPayload,
    ) -> Result<TaskRef> {
        let queue = job_type.queue();
        let enqueue = self.broker.enqueue(queue, job_type, payload);
        let outcome = tokio::time::timeout(self.timeout, enqueue).await;

        let task_ref = match outcome {
            Ok(Ok(task_ref)) => task_ref,
            Ok(Err(e)) => {
                self.mark_dispatch_failed(job_id, &e.to_string()).await;
                return Err(CoreError::with_internal(
                    ErrorCode::DispatchFailure,
                    "Failed to dispatch job to the task queue",
                    e.to_string(),
                ));
            }
            Err(_) => {
                self.mark_dispatch_failed(job_id, "broker enqueue timed out").await;
                return Err(CoreError::with_internal(
                    ErrorCode::DispatchFailure,
                    "Failed to dispatch job to the task queue",
                    format!("enqueue exceeded {:?}", self.timeout),
                ));
            }
        };

        self.store.set_task_ref(job_id, &task_ref.to_string()).await?;
        tracing::debug!(job_id = %job_id, queue = %queue, task_ref = %task_ref, "Job dispatched");
        Ok(task_ref)
    }

    async fn mark_dispatch_failed(&self, job_id: JobId, reason: &str) {
        let reason = format!("Dispatch failure: {}", reason);
        if let Err(e) = self
            .store
            .update_job_status(job_id, JobStatus::Failed, Some(&reason))
            .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record dispatch failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_specs() {
        assert_eq!(QueueName::ProjectInit.spec().max_attempts, 3);
        assert_eq!(QueueName::PaperScoring.spec().max_attempts, 3);
        assert_eq!(QueueName::Email.spec().max_attempts, 5);
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = QueueName::ProjectInit.spec().backoff;
        assert_eq!(backoff.delay_after(1), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(2_000));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(4_000));

        let email = QueueName::Email.spec().backoff;
        assert_eq!(email.delay_after(1), Duration::from_millis(5_000));
        assert_eq!(email.delay_after(4), Duration::from_millis(40_000));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffStrategy::Fixed { delay_ms: 250 };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(250));
        assert_eq!(backoff.delay_after(7), Duration::from_millis(250));
    }

    #[test]
    fn test_task_ref_round_trip() {
        let task_ref = TaskRef::new();
        let parsed = TaskRef::parse(&task_ref.to_string()).unwrap();
        assert_eq!(parsed, task_ref);
        assert!(TaskRef::parse("not-a-uuid").is_none());
    }
}
