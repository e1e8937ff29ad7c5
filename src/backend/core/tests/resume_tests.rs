//! Resume protocol: ordering of checks, recovery paths, and batch behavior.

mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use litrev_core::jobs::{JobId, JobRecord, JobStatus, JobType, StageData, TaskPayload};
use litrev_core::queue::{
    BrokerTask, Dispatcher, InMemoryBroker, QueueBroker, QueueName, TaskRef, TaskState,
};
use litrev_core::resume::ResumeCoordinator;
use litrev_core::store::{MemoryStore, Store};
use litrev_core::{ErrorCode, Result};
use uuid::Uuid;

use common::{intent_json, score_json, TestEnv};

/// Seed a dispatched scoring job, then fail it so it becomes resumable.
async fn seed_failed_scoring_job(env: &TestEnv, balance: f64) -> (Uuid, Uuid, JobRecord) {
    let user_id = env.store.add_user("researcher@example.com", balance);
    let project_id = env.store.add_project(user_id, "User abstract.");
    let paper_id = env.store.add_paper(project_id, "Paper", "Candidate abstract.");

    let record = JobRecord::new(user_id, JobType::PaperScoring)
        .for_project(project_id)
        .for_paper(paper_id);
    env.store.insert_job(&record).await.unwrap();
    let payload = TaskPayload::reconstruct(&record).unwrap();
    env.dispatcher.dispatch(record.id, record.job_type, payload).await.unwrap();

    env.store
        .update_job_status(record.id, JobStatus::Failed, Some("scripted failure"))
        .await
        .unwrap();
    let record = env.store.get_job(record.id).await.unwrap().unwrap();
    (user_id, project_id, record)
}

#[tokio::test]
async fn resume_unknown_job_is_not_found() {
    let env = TestEnv::new();
    let user_id = env.store.add_user("a@example.com", 10.0);
    let err = env.resume.resume_one(JobId::new(), user_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotFound);
}

#[tokio::test]
async fn resume_foreign_job_is_forbidden() {
    let env = TestEnv::new();
    let (_, _, record) = seed_failed_scoring_job(&env, 10.0).await;
    let stranger = env.store.add_user("stranger@example.com", 10.0);

    let err = env.resume.resume_one(record.id, stranger).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotOwned);

    // Ownership failure never mutates the record.
    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("scripted failure"));
}

#[tokio::test]
async fn resume_rejects_non_resumable_states() {
    let env = TestEnv::new();
    let user_id = env.store.add_user("a@example.com", 10.0);
    let project_id = env.store.add_project(user_id, "Abstract.");

    for status in [JobStatus::Pending, JobStatus::Processing, JobStatus::Completed] {
        let record = JobRecord::new(user_id, JobType::InitIntent).for_project(project_id);
        env.store.insert_job(&record).await.unwrap();
        env.store.update_job_status(record.id, JobStatus::Processing, None).await.unwrap();
        env.store.update_job_status(record.id, status, None).await.unwrap();

        let err = env.resume.resume_one(record.id, user_id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidJobState);
        let job = env.store.get_job(record.id).await.unwrap().unwrap();
        assert_eq!(job.status, status);
    }
}

#[tokio::test]
async fn resume_retries_surviving_broker_task() {
    let env = TestEnv::new();
    let (user_id, _, record) = seed_failed_scoring_job(&env, 10.0).await;
    let original_ref = record.external_task_ref.clone().unwrap();

    env.resume.resume_one(record.id, user_id).await.unwrap();

    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.failure_reason.is_none());
    // Same task, attempts reset.
    assert_eq!(job.external_task_ref.as_deref(), Some(original_ref.as_str()));
    let task_ref = TaskRef::parse(&original_ref).unwrap();
    let task = env.broker.lookup(QueueName::PaperScoring, &task_ref).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Waiting);
    assert_eq!(task.attempts_made, 0);

    // The resumed job runs to completion.
    env.provider.push_ok(score_json());
    env.drain(QueueName::PaperScoring).await;
    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn resume_reconstructs_when_broker_task_is_lost() {
    let env = TestEnv::new();
    let (user_id, _, record) = seed_failed_scoring_job(&env, 10.0).await;
    let original_ref = TaskRef::parse(record.external_task_ref.as_deref().unwrap()).unwrap();
    env.broker.evict(QueueName::PaperScoring, &original_ref);

    env.resume.resume_one(record.id, user_id).await.unwrap();

    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    // A brand-new task replaced the lost one.
    let new_ref = TaskRef::parse(job.external_task_ref.as_deref().unwrap()).unwrap();
    assert_ne!(new_ref, original_ref);
    let task = env.broker.lookup(QueueName::PaperScoring, &new_ref).await.unwrap().unwrap();
    assert!(task.payload.stage_data.is_none());
    assert_eq!(task.payload.background_job_id, record.id);
    assert_eq!(task.payload.paper_id, record.paper_id);
}

#[tokio::test]
async fn lost_email_job_is_gone_and_unchanged() {
    let env = TestEnv::new();
    let user_id = env.store.add_user("a@example.com", 10.0);
    let project_id = env.store.add_project(user_id, "Abstract.");

    let record = JobRecord::new(user_id, JobType::SendEmail).for_project(project_id);
    env.store.insert_job(&record).await.unwrap();
    let payload = TaskPayload::new(
        &record,
        StageData::Email { kind: litrev_core::jobs::NotificationKind::ProjectInitComplete },
    );
    env.dispatcher.dispatch(record.id, record.job_type, payload).await.unwrap();
    env.store
        .update_job_status(record.id, JobStatus::Failed, Some("smtp down"))
        .await
        .unwrap();

    let task_ref = {
        let job = env.store.get_job(record.id).await.unwrap().unwrap();
        TaskRef::parse(job.external_task_ref.as_deref().unwrap()).unwrap()
    };
    env.broker.evict(QueueName::Email, &task_ref);

    let err = env.resume.resume_one(record.id, user_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobDataLost);

    // 410 never mutates the record.
    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("smtp down"));
}

#[tokio::test]
async fn orphaned_job_resume_is_a_permanent_idempotent_trap() {
    let env = TestEnv::new();
    let (user_id, project_id, record) = seed_failed_scoring_job(&env, 10.0).await;
    env.store.remove_project(project_id);

    for _ in 0..2 {
        let err = env.resume.resume_one(record.id, user_id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::OrphanedParent);
        let job = env.store.get_job(record.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.failure_reason.as_deref(),
            Some("Project no longer exists (job orphaned)")
        );
    }
}

#[tokio::test]
async fn credit_exhaustion_resume_cycle() {
    let env = TestEnv::new();
    let (user_id, _, record) = seed_failed_scoring_job(&env, 10.0).await;

    // Broke user: resume demotes to FAILED_NO_CREDITS and returns 402.
    env.store.set_balance(user_id, 0.0);
    let err = env.resume.resume_one(record.id, user_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientCredits);
    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::FailedNoCredits);
    assert_eq!(job.failure_reason.as_deref(), Some("Insufficient credits to resume"));

    // After a recharge the same job resumes and completes.
    env.store.set_balance(user_id, 50.0);
    env.resume.resume_one(record.id, user_id).await.unwrap();
    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    env.provider.push_ok(score_json());
    env.drain(QueueName::PaperScoring).await;
    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn resume_all_skips_broken_jobs_and_reports_counts() {
    let env = TestEnv::new();
    let user_id = env.store.add_user("researcher@example.com", 50.0);

    // Job 1: healthy failed intent job with a live broker task.
    let project_a = env.store.add_project(user_id, "Abstract A.");
    let healthy = JobRecord::new(user_id, JobType::InitIntent).for_project(project_a);
    env.store.insert_job(&healthy).await.unwrap();
    let payload = TaskPayload::reconstruct(&healthy).unwrap();
    env.dispatcher.dispatch(healthy.id, healthy.job_type, payload).await.unwrap();
    env.store
        .update_job_status(healthy.id, JobStatus::Failed, Some("boom"))
        .await
        .unwrap();

    // Job 2: orphaned (project deleted), must be skipped.
    let project_b = env.store.add_project(user_id, "Abstract B.");
    let orphan = JobRecord::new(user_id, JobType::InitIntent).for_project(project_b);
    env.store.insert_job(&orphan).await.unwrap();
    env.store
        .update_job_status(orphan.id, JobStatus::Failed, Some("boom"))
        .await
        .unwrap();
    env.store.remove_project(project_b);

    let summary = env.resume.resume_all(user_id).await.unwrap();
    assert_eq!(summary.total_failed_found, 2);
    assert_eq!(summary.resumed_count, 1);

    let job = env.store.get_job(healthy.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    let job = env.store.get_job(orphan.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    env.provider.push_ok(intent_json());
    env.provider.push_ok(common::query_json());
    env.drain(QueueName::ProjectInit).await;
    let job = env.store.get_job(healthy.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn resume_all_requires_positive_balance() {
    let env = TestEnv::new();
    let user_id = env.store.add_user("broke@example.com", 0.0);
    let err = env.resume.resume_all(user_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientCredits);
}

/// Broker whose retried task is serviced immediately: a worker leases it,
/// completes the job, and acks before control returns to the coordinator.
struct InstantWorkerBroker {
    inner: Arc<InMemoryBroker>,
    store: Arc<MemoryStore>,
}

#[async_trait]
impl QueueBroker for InstantWorkerBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        task_type: JobType,
        payload: TaskPayload,
    ) -> Result<TaskRef> {
        self.inner.enqueue(queue, task_type, payload).await
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<BrokerTask>> {
        self.inner.dequeue(queue).await
    }

    async fn ack(&self, queue: QueueName, task_ref: &TaskRef) -> Result<()> {
        self.inner.ack(queue, task_ref).await
    }

    async fn nack(&self, queue: QueueName, task_ref: &TaskRef, error: &str) -> Result<()> {
        self.inner.nack(queue, task_ref, error).await
    }

    async fn lookup(&self, queue: QueueName, task_ref: &TaskRef) -> Result<Option<BrokerTask>> {
        self.inner.lookup(queue, task_ref).await
    }

    async fn retry(&self, queue: QueueName, task_ref: &TaskRef) -> Result<()> {
        self.inner.retry(queue, task_ref).await?;
        let task = self.inner.dequeue(queue).await?.expect("retried task is ready");
        self.store
            .update_job_status(task.payload.background_job_id, JobStatus::Completed, None)
            .await?;
        self.inner.ack(queue, &task.task_ref).await
    }

    async fn depth(&self, queue: QueueName) -> Result<usize> {
        self.inner.depth(queue).await
    }
}

#[tokio::test]
async fn resume_never_overwrites_a_racing_completion() {
    let env = TestEnv::new();
    let (user_id, _, record) = seed_failed_scoring_job(&env, 10.0).await;

    let broker: Arc<dyn QueueBroker> = Arc::new(InstantWorkerBroker {
        inner: env.broker.clone(),
        store: env.store.clone(),
    });
    let store: Arc<dyn Store> = env.store.clone();
    let dispatcher = Arc::new(Dispatcher::new(
        broker.clone(),
        store.clone(),
        Duration::from_secs(5),
    ));
    let resume = ResumeCoordinator::new(store, broker, dispatcher);

    resume.resume_one(record.id, user_id).await.unwrap();

    // The worker finished while resume was still in flight; its terminal
    // status must survive the coordinator's PENDING write.
    let job = env.store.get_job(record.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}
