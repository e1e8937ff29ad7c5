//! Pipeline stages and the LLM provider seam.
//!
//! Each stage builds a completion request, calls the injected provider, and
//! parses the model's JSON into a validated structured output. A parse or
//! validation failure is a hard stage failure handled by the worker's retry
//! policy, never a silent default.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod intent;
pub mod llm;
pub mod query;
pub mod scoring;

pub use intent::IntentStage;
pub use llm::OpenAiProvider;
pub use query::{EngineQueries, QueryOutput, QueryStage};
pub use scoring::{OverlapLevel, PaperScore, ScoringStage};

/// Pipeline stage labels used in the usage ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intent,
    Queries,
    Score,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Queries => "queries",
            Self::Score => "score",
        }
    }
}

/// A chat-style completion request.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

/// A completion plus the usage accounting the credit gate charges for.
#[derive(Debug, Clone, Deserialize)]
pub struct Completion {
    pub content: String,
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}
