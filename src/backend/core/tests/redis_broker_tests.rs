//! Redis broker behavior against a live instance.
//!
//! These tests need a reachable Redis at `REDIS_URL` (default
//! `redis://localhost:6379`) and are ignored by default; run them with
//! `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use litrev_core::jobs::{JobId, JobType, StageData, TaskPayload};
use litrev_core::queue::{QueueBroker, QueueName, RedisBroker};
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

fn live_broker() -> RedisBroker {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let client = redis::Client::open(url.as_str()).unwrap();
    // Unique prefix per run keeps test data apart.
    RedisBroker::new(client, format!("litrev-test-{}", Uuid::new_v4()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn concurrent_promotion_leases_a_due_task_once() {
    let broker = Arc::new(live_broker());
    let task_ref = broker
        .enqueue(QueueName::ProjectInit, JobType::InitIntent, payload())
        .await
        .unwrap();

    // Park the task on the delayed schedule (1s backoff for this queue),
    // then wait out the backoff so both pollers see it as due.
    let task = broker.dequeue(QueueName::ProjectInit).await.unwrap().unwrap();
    assert_eq!(task.task_ref, task_ref);
    broker.nack(QueueName::ProjectInit, &task_ref, "boom").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    // Two workers race to promote and lease the same due task. The loser
    // must come back empty, not holding a second lease on the same ref.
    let first = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.dequeue(QueueName::ProjectInit).await.unwrap() })
    };
    let second = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.dequeue(QueueName::ProjectInit).await.unwrap() })
    };

    let outcomes = [first.await.unwrap(), second.await.unwrap()];
    let leased: Vec<_> = outcomes.iter().flatten().collect();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].task_ref, task_ref);
}
