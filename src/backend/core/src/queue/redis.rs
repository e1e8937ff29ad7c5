//! Redis-backed broker for production use.
//!
//! Layout per queue:
//! - `litrev:tasks:<queue>`   hash  task_ref → serialized [`BrokerTask`]
//! - `litrev:ready:<queue>`   list  task refs ready for delivery
//! - `litrev:delayed:<queue>` zset  task refs scored by due time (epoch ms)
//!
//! Dequeue first promotes due delayed refs, then blocks briefly on the ready
//! list. Task bodies live only in the hash, so ack is a single HDEL.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{CoreError, ErrorCode, Result};
use crate::jobs::{JobType, TaskPayload};

use super::{BrokerTask, QueueBroker, QueueName, TaskRef, TaskState};

/// Redis queue broker.
pub struct RedisBroker {
    client: redis::Client,
    key_prefix: String,
}

impl RedisBroker {
    /// Create a new Redis broker.
    ///
    /// # Arguments
    /// * `client` - A connected Redis client
    /// * `key_prefix` - Namespace for all keys (e.g. `"litrev"`)
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self { client, key_prefix: key_prefix.into() }
    }

    fn tasks_key(&self, queue: QueueName) -> String {
        format!("{}:tasks:{}", self.key_prefix, queue)
    }

    fn ready_key(&self, queue: QueueName) -> String {
        format!("{}:ready:{}", self.key_prefix, queue)
    }

    fn delayed_key(&self, queue: QueueName) -> String {
        format!("{}:delayed:{}", self.key_prefix, queue)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await.map_err(|e| {
            CoreError::with_internal(
                ErrorCode::QueueError,
                "Failed to connect to the task broker",
                e.to_string(),
            )
        })
    }

    async fn load_task(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queue: QueueName,
        task_ref: &TaskRef,
    ) -> Result<Option<BrokerTask>> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.tasks_key(queue))
            .arg(task_ref.to_string())
            .query_async(conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to read task from the broker",
                    e.to_string(),
                )
            })?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_task(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        task: &BrokerTask,
    ) -> Result<()> {
        let serialized = serde_json::to_string(task)?;
        redis::cmd("HSET")
            .arg(self.tasks_key(task.queue))
            .arg(task.task_ref.to_string())
            .arg(&serialized)
            .query_async::<_, i64>(conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to write task to the broker",
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    /// Move delayed refs whose due time has passed onto the ready list.
    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queue: QueueName,
    ) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key(queue))
            .arg("-inf")
            .arg(now_ms)
            .query_async(conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to promote delayed tasks",
                    e.to_string(),
                )
            })?;

        for raw_ref in due {
            // ZREM is the claim: concurrent promoters all read the same due
            // refs, but only the caller that removes the member may requeue
            // it, otherwise the ready list would lease the task twice.
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.delayed_key(queue))
                .arg(&raw_ref)
                .query_async(&mut *conn)
                .await
                .map_err(|e| {
                    CoreError::with_internal(
                        ErrorCode::QueueError,
                        "Failed to promote delayed tasks",
                        e.to_string(),
                    )
                })?;
            if removed == 0 {
                continue;
            }
            if let Some(task_ref) = TaskRef::parse(&raw_ref) {
                if let Some(mut task) = self.load_task(conn, queue, &task_ref).await? {
                    task.state = TaskState::Waiting;
                    self.save_task(conn, &task).await?;
                }
            }
            redis::cmd("RPUSH")
                .arg(self.ready_key(queue))
                .arg(&raw_ref)
                .query_async::<_, i64>(&mut *conn)
                .await
                .map_err(|e| {
                    CoreError::with_internal(
                        ErrorCode::QueueError,
                        "Failed to promote delayed tasks",
                        e.to_string(),
                    )
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBroker for RedisBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        task_type: JobType,
        payload: TaskPayload,
    ) -> Result<TaskRef> {
        let task = BrokerTask::new(queue, task_type, payload);
        let task_ref = task.task_ref;

        let mut conn = self.get_conn().await?;
        self.save_task(&mut conn, &task).await?;
        redis::cmd("RPUSH")
            .arg(self.ready_key(queue))
            .arg(task_ref.to_string())
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to enqueue task to the broker",
                    e.to_string(),
                )
            })?;

        tracing::debug!(queue = %queue, task_ref = %task_ref, "Task enqueued");
        Ok(task_ref)
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<BrokerTask>> {
        let mut conn = self.get_conn().await?;
        self.promote_due(&mut conn, queue).await?;

        // BLPOP with a 5-second timeout so worker loops can observe shutdown
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(self.ready_key(queue))
            .arg(5_u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to dequeue task from the broker",
                    e.to_string(),
                )
            })?;

        let Some((_key, raw_ref)) = popped else {
            return Ok(None);
        };
        let Some(task_ref) = TaskRef::parse(&raw_ref) else {
            tracing::warn!(queue = %queue, raw = %raw_ref, "Dropping malformed task ref");
            return Ok(None);
        };
        // Body may have been evicted while the ref sat on the list.
        let Some(mut task) = self.load_task(&mut conn, queue, &task_ref).await? else {
            return Ok(None);
        };
        task.state = TaskState::Active;
        task.attempts_made += 1;
        self.save_task(&mut conn, &task).await?;

        tracing::debug!(queue = %queue, task_ref = %task_ref, attempt = task.attempts_made, "Task leased");
        Ok(Some(task))
    }

    async fn ack(&self, queue: QueueName, task_ref: &TaskRef) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("HDEL")
            .arg(self.tasks_key(queue))
            .arg(task_ref.to_string())
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to ack task",
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    async fn nack(&self, queue: QueueName, task_ref: &TaskRef, error: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let Some(mut task) = self.load_task(&mut conn, queue, task_ref).await? else {
            return Ok(());
        };
        task.last_error = Some(error.to_string());
        if task.attempts_exhausted() {
            task.state = TaskState::Failed;
            self.save_task(&mut conn, &task).await?;
            tracing::warn!(queue = %queue, task_ref = %task_ref, "Task parked after final attempt");
            return Ok(());
        }

        task.state = TaskState::Delayed;
        self.save_task(&mut conn, &task).await?;
        let delay = queue.spec().backoff.delay_after(task.attempts_made);
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        redis::cmd("ZADD")
            .arg(self.delayed_key(queue))
            .arg(due_ms)
            .arg(task_ref.to_string())
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to schedule task retry",
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    async fn lookup(&self, queue: QueueName, task_ref: &TaskRef) -> Result<Option<BrokerTask>> {
        let mut conn = self.get_conn().await?;
        self.load_task(&mut conn, queue, task_ref).await
    }

    async fn retry(&self, queue: QueueName, task_ref: &TaskRef) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let Some(mut task) = self.load_task(&mut conn, queue, task_ref).await? else {
            return Err(CoreError::with_internal(
                ErrorCode::QueueError,
                "A queue error occurred",
                format!("retry of unknown task {}", task_ref),
            ));
        };
        task.attempts_made = 0;
        task.state = TaskState::Waiting;
        task.last_error = None;
        self.save_task(&mut conn, &task).await?;

        redis::cmd("ZREM")
            .arg(self.delayed_key(queue))
            .arg(task_ref.to_string())
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to retry task",
                    e.to_string(),
                )
            })?;
        redis::cmd("RPUSH")
            .arg(self.ready_key(queue))
            .arg(task_ref.to_string())
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to retry task",
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let length: usize = redis::cmd("LLEN")
            .arg(self.ready_key(queue))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                CoreError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to get queue depth",
                    e.to_string(),
                )
            })?;
        Ok(length)
    }
}
