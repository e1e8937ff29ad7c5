//! # Litrev Core
//!
//! Durable job orchestration for a literature-review pipeline.
//!
//! ## Architecture
//!
//! - **Jobs**: Durable job records with a strict status state machine
//! - **Queue**: Broker abstraction (Redis / in-memory) with per-queue retry budgets
//! - **Workers**: One consumer loop per queue running the pipeline stages
//! - **Credits**: Atomic usage accounting around every LLM call
//! - **Resume**: User-initiated recovery of failed jobs, with payload reconstruction
//! - **API**: Axum surface exposing job listing and the resume protocol

pub mod api;
pub mod config;
pub mod credits;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod resume;
pub mod store;
pub mod workers;

pub use error::{CoreError, ErrorCode, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::credits::{CreditGate, StageUsage};
    pub use crate::error::{CoreError, ErrorCode, Result};
    pub use crate::jobs::{JobId, JobRecord, JobStatus, JobType, StageData, TaskPayload};
    pub use crate::pipeline::LlmProvider;
    pub use crate::queue::{Dispatcher, InMemoryBroker, QueueBroker, QueueName, RedisBroker, TaskRef};
    pub use crate::resume::ResumeCoordinator;
    pub use crate::store::{MemoryStore, PgStore, Store};
    pub use crate::workers::{Notifier, Worker, WorkerConfig, WorkerHandle};
}
