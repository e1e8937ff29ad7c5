//! In-memory broker for tests and development.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::{JobType, TaskPayload};

use super::{BrokerTask, QueueBroker, QueueName, TaskRef, TaskState};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskRef>,
    /// (due, task); scanned on every dequeue.
    delayed: Vec<(DateTime<Utc>, TaskRef)>,
    tasks: HashMap<TaskRef, BrokerTask>,
}

impl QueueState {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut remaining = Vec::with_capacity(self.delayed.len());
        for (due, task_ref) in self.delayed.drain(..) {
            if due <= now {
                if let Some(task) = self.tasks.get_mut(&task_ref) {
                    task.state = TaskState::Waiting;
                }
                self.ready.push_back(task_ref);
            } else {
                remaining.push((due, task_ref));
            }
        }
        self.delayed = remaining;
    }
}

/// In-memory queue broker.
pub struct InMemoryBroker {
    queues: Mutex<HashMap<QueueName, QueueState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        for queue in QueueName::ALL {
            queues.insert(queue, QueueState::default());
        }
        Self { queues: Mutex::new(queues) }
    }

    /// Promote every delayed task regardless of its due time. Lets tests step
    /// through retry schedules without sleeping them out.
    pub fn promote_all_delayed(&self, queue: QueueName) {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(&queue) {
            state.promote_due(DateTime::<Utc>::MAX_UTC);
        }
    }

    /// Drop a task entirely, simulating broker storage loss.
    pub fn evict(&self, queue: QueueName, task_ref: &TaskRef) {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(&queue) {
            state.tasks.remove(task_ref);
            state.ready.retain(|r| r != task_ref);
            state.delayed.retain(|(_, r)| r != task_ref);
        }
    }

    fn unknown_queue() -> CoreError {
        CoreError::with_internal(ErrorCode::QueueError, "A queue error occurred", "unknown queue")
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        task_type: JobType,
        payload: TaskPayload,
    ) -> Result<TaskRef> {
        let task = BrokerTask::new(queue, task_type, payload);
        let task_ref = task.task_ref;
        let mut queues = self.queues.lock();
        let state = queues.get_mut(&queue).ok_or_else(Self::unknown_queue)?;
        state.tasks.insert(task_ref, task);
        state.ready.push_back(task_ref);
        Ok(task_ref)
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<BrokerTask>> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(&queue).ok_or_else(Self::unknown_queue)?;
        state.promote_due(Utc::now());

        while let Some(task_ref) = state.ready.pop_front() {
            // Evicted refs may linger in the ready list; skip them.
            if let Some(task) = state.tasks.get_mut(&task_ref) {
                task.state = TaskState::Active;
                task.attempts_made += 1;
                return Ok(Some(task.clone()));
            }
        }
        Ok(None)
    }

    async fn ack(&self, queue: QueueName, task_ref: &TaskRef) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(&queue).ok_or_else(Self::unknown_queue)?;
        state.tasks.remove(task_ref);
        Ok(())
    }

    async fn nack(&self, queue: QueueName, task_ref: &TaskRef, error: &str) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(&queue).ok_or_else(Self::unknown_queue)?;
        let Some(task) = state.tasks.get_mut(task_ref) else {
            return Ok(());
        };
        task.last_error = Some(error.to_string());
        if task.attempts_exhausted() {
            task.state = TaskState::Failed;
        } else {
            task.state = TaskState::Delayed;
            let delay = queue.spec().backoff.delay_after(task.attempts_made);
            let due = Utc::now()
                + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
            state.delayed.push((due, *task_ref));
        }
        Ok(())
    }

    async fn lookup(&self, queue: QueueName, task_ref: &TaskRef) -> Result<Option<BrokerTask>> {
        let queues = self.queues.lock();
        let state = queues.get(&queue).ok_or_else(Self::unknown_queue)?;
        Ok(state.tasks.get(task_ref).cloned())
    }

    async fn retry(&self, queue: QueueName, task_ref: &TaskRef) -> Result<()> {
        let mut queues = self.queues.lock();
        let state = queues.get_mut(&queue).ok_or_else(Self::unknown_queue)?;
        let Some(task) = state.tasks.get_mut(task_ref) else {
            return Err(CoreError::with_internal(
                ErrorCode::QueueError,
                "A queue error occurred",
                format!("retry of unknown task {}", task_ref),
            ));
        };
        task.attempts_made = 0;
        task.state = TaskState::Waiting;
        task.last_error = None;
        state.delayed.retain(|(_, r)| r != task_ref);
        if !state.ready.contains(task_ref) {
            state.ready.push_back(*task_ref);
        }
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<usize> {
        let queues = self.queues.lock();
        let state = queues.get(&queue).ok_or_else(Self::unknown_queue)?;
        Ok(state.ready.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, StageData};
    use uuid::Uuid;

    fn payload() -> TaskPayload {
        TaskPayload {
            background_job_id: JobId::new(),
            user_id: Uuid::new_v4(),
            project_id: Some(Uuid::new_v4()),
            paper_id: None,
            stage_data: Some(StageData::Intent { abstract_text: "idea".into() }),
        }
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        let broker = InMemoryBroker::new();
        let task_ref = broker
            .enqueue(QueueName::ProjectInit, JobType::InitIntent, payload())
            .await
            .unwrap();

        let task = broker.dequeue(QueueName::ProjectInit).await.unwrap().unwrap();
        assert_eq!(task.task_ref, task_ref);
        assert_eq!(task.attempts_made, 1);
        assert_eq!(task.state, TaskState::Active);

        broker.ack(QueueName::ProjectInit, &task_ref).await.unwrap();
        assert!(broker.lookup(QueueName::ProjectInit, &task_ref).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nack_schedules_backoff_until_limit() {
        let broker = InMemoryBroker::new();
        let task_ref = broker
            .enqueue(QueueName::ProjectInit, JobType::InitIntent, payload())
            .await
            .unwrap();

        for attempt in 1..=3 {
            broker.promote_all_delayed(QueueName::ProjectInit);
            let task = broker.dequeue(QueueName::ProjectInit).await.unwrap().unwrap();
            assert_eq!(task.attempts_made, attempt);
            broker.nack(QueueName::ProjectInit, &task_ref, "boom").await.unwrap();
        }

        // Attempt limit reached: parked, not re-delivered.
        let task = broker.lookup(QueueName::ProjectInit, &task_ref).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.last_error.as_deref(), Some("boom"));
        broker.promote_all_delayed(QueueName::ProjectInit);
        assert!(broker.dequeue(QueueName::ProjectInit).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_preserves_payload_and_resets_attempts() {
        let broker = InMemoryBroker::new();
        let original = payload();
        let task_ref = broker
            .enqueue(QueueName::Email, JobType::SendEmail, original.clone())
            .await
            .unwrap();

        for _ in 0..5 {
            broker.promote_all_delayed(QueueName::Email);
            broker.dequeue(QueueName::Email).await.unwrap().unwrap();
            broker.nack(QueueName::Email, &task_ref, "smtp down").await.unwrap();
        }

        broker.retry(QueueName::Email, &task_ref).await.unwrap();
        let task = broker.dequeue(QueueName::Email).await.unwrap().unwrap();
        assert_eq!(task.attempts_made, 1);
        assert_eq!(
            task.payload.background_job_id,
            original.background_job_id
        );
    }

    #[tokio::test]
    async fn test_evicted_task_is_gone() {
        let broker = InMemoryBroker::new();
        let task_ref = broker
            .enqueue(QueueName::PaperScoring, JobType::PaperScoring, payload())
            .await
            .unwrap();
        broker.evict(QueueName::PaperScoring, &task_ref);
        assert!(broker.lookup(QueueName::PaperScoring, &task_ref).await.unwrap().is_none());
        assert!(broker.dequeue(QueueName::PaperScoring).await.unwrap().is_none());
    }
}
