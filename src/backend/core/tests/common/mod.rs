//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use litrev_core::credits::CreditGate;
use litrev_core::error::{CoreError, ErrorCode, Result};
use litrev_core::jobs::{JobType, TaskPayload};
use litrev_core::pipeline::{Completion, CompletionRequest, LlmProvider};
use litrev_core::queue::{
    BrokerTask, Dispatcher, InMemoryBroker, QueueBroker, QueueName, TaskRef,
};
use litrev_core::resume::ResumeCoordinator;
use litrev_core::store::{MemoryStore, ModelPricing, Store};
use litrev_core::workers::{Notification, Notifier, Worker, WorkerConfig};

/// LLM provider that replays a scripted sequence of outcomes.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Completion>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self { script: Mutex::new(VecDeque::new()) }
    }

    pub fn push_ok(&self, content: &str) {
        self.script.lock().push_back(Ok(Completion {
            content: content.to_string(),
            model_name: "test-model".to_string(),
            input_tokens: 1_000,
            output_tokens: 500,
        }));
    }

    pub fn push_err(&self) {
        self.script.lock().push_back(Err(CoreError::with_internal(
            ErrorCode::LlmApiError,
            "The language model service is unavailable",
            "scripted failure",
        )));
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion> {
        self.script.lock().pop_front().unwrap_or_else(|| {
            Err(CoreError::with_internal(
                ErrorCode::LlmApiError,
                "The language model service is unavailable",
                "script exhausted",
            ))
        })
    }
}

/// Notifier that records every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    pub delivered: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.delivered.lock().push(notification);
        Ok(())
    }
}

/// Everything a worker-level test needs, wired against in-memory fakes.
pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<InMemoryBroker>,
    pub provider: Arc<ScriptedProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub dispatcher: Arc<Dispatcher>,
    pub resume: Arc<ResumeCoordinator>,
}

impl TestEnv {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let provider = Arc::new(ScriptedProvider::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let store_dyn: Arc<dyn Store> = store.clone();
        let broker_dyn: Arc<dyn QueueBroker> = broker.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            broker_dyn.clone(),
            store_dyn.clone(),
            Duration::from_secs(5),
        ));
        let resume = Arc::new(ResumeCoordinator::new(
            store_dyn,
            broker_dyn,
            dispatcher.clone(),
        ));

        let env = Self { store, broker, provider, notifier, dispatcher, resume };
        env.store.set_pricing(ModelPricing {
            model_name: "test-model".to_string(),
            provider: "openai".to_string(),
            input_cents_per_million: 1_000.0,
            output_cents_per_million: 2_000.0,
        });
        env
    }

    pub fn worker(&self, queue: QueueName) -> Worker {
        let store: Arc<dyn Store> = self.store.clone();
        Worker::new(
            queue,
            self.broker.clone(),
            store.clone(),
            Arc::new(CreditGate::new(store, 100.0)),
            self.provider.clone(),
            self.notifier.clone(),
            self.dispatcher.clone(),
            WorkerConfig::for_queue(queue),
        )
    }

    /// Drain one queue: promote delayed tasks and process everything ready.
    pub async fn drain(&self, queue: QueueName) {
        let worker = self.worker(queue);
        loop {
            self.broker.promote_all_delayed(queue);
            match worker.process_one().await {
                Ok(true) => {}
                _ => break,
            }
        }
    }
}

/// Canned stage outputs the scripted provider can return.
pub fn intent_json() -> &'static str {
    r#"{
        "problem": "slow literature triage",
        "methodologies": ["LLM-assisted screening"],
        "applicationDomains": ["research tooling"],
        "constraints": ["cost"],
        "contributionTypes": ["system"],
        "keywordsSeed": ["literature review", "screening"]
    }"#
}

pub fn query_json() -> &'static str {
    r#"{
        "booleanQuery": "(literature review) AND (screening)",
        "expandedKeywords": ["paper triage", "relevance ranking"],
        "engineQueries": {"arxiv": "literature screening", "semanticScholar": "paper triage"}
    }"#
}

pub fn score_json() -> &'static str {
    r#"{
        "semanticSimilarity": 0.8,
        "problemOverlap": "high",
        "methodOverlap": "medium",
        "domainOverlap": "high",
        "constraintOverlap": "low",
        "c1Score": 7.0,
        "c1Justification": "same problem space",
        "c2Score": 5.0,
        "c2Justification": "reusable dataset",
        "researchGaps": ["no cost analysis"],
        "userNovelty": "adds credit-aware orchestration"
    }"#
}

/// Broker whose enqueue never completes, for dispatch-timeout tests.
pub struct StalledBroker;

#[async_trait]
impl QueueBroker for StalledBroker {
    async fn enqueue(
        &self,
        _queue: QueueName,
        _task_type: JobType,
        _payload: TaskPayload,
    ) -> Result<TaskRef> {
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn dequeue(&self, _queue: QueueName) -> Result<Option<BrokerTask>> {
        Ok(None)
    }

    async fn ack(&self, _queue: QueueName, _task_ref: &TaskRef) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _queue: QueueName, _task_ref: &TaskRef, _error: &str) -> Result<()> {
        Ok(())
    }

    async fn lookup(&self, _queue: QueueName, _task_ref: &TaskRef) -> Result<Option<BrokerTask>> {
        Ok(None)
    }

    async fn retry(&self, _queue: QueueName, _task_ref: &TaskRef) -> Result<()> {
        Ok(())
    }

    async fn depth(&self, _queue: QueueName) -> Result<usize> {
        Ok(0)
    }
}
