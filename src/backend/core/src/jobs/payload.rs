//! Task payloads carried through the broker.
//!
//! Payloads are plain JSON so the broker never needs to understand the
//! pipeline. `stageData` is optional: a payload reconstructed from a durable
//! [`JobRecord`] only carries identifying fields and the worker rebuilds the
//! stage input from storage.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{JobId, JobRecord, JobType};

/// Wire payload for one broker task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub background_job_id: JobId,
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paper_id: Option<Uuid>,
    /// Inline stage input. Absent after reconstruction; workers fall back to
    /// reading the durable project/paper rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_data: Option<StageData>,
}

/// Inline input for a pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "camelCase")]
pub enum StageData {
    /// Intent decomposition input: the user's research idea.
    Intent { abstract_text: String },
    /// Query generation input: the intent fields produced by stage 1.
    Query(IntentFields),
    /// Paper scoring input: the idea and one candidate paper.
    Scoring {
        user_abstract: String,
        candidate_abstract: String,
        candidate_title: String,
    },
    /// Notification kind for the email queue.
    Email { kind: NotificationKind },
}

/// Structured intent fields produced by the first pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentFields {
    pub problem: String,
    pub methodologies: Vec<String>,
    pub application_domains: Vec<String>,
    pub constraints: Vec<String>,
    pub contribution_types: Vec<String>,
    pub keywords_seed: Vec<String>,
}

/// What a SEND_EMAIL job announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    ProjectInitComplete,
    ProjectScoringComplete,
}

impl TaskPayload {
    /// Build a payload carrying inline stage data.
    pub fn new(record: &JobRecord, stage_data: StageData) -> Self {
        Self {
            background_job_id: record.id,
            user_id: record.user_id,
            project_id: record.project_id,
            paper_id: record.paper_id,
            stage_data: Some(stage_data),
        }
    }

    /// Rebuild a payload from the durable record alone.
    ///
    /// Returns `None` for job types whose inputs are not durably stored
    /// (SEND_EMAIL): those jobs cannot be recovered once the broker task is
    /// gone. For the rest, the payload identifies the work and the worker
    /// reloads stage input from storage.
    pub fn reconstruct(record: &JobRecord) -> Option<Self> {
        if !record.job_type.is_reconstructable() {
            return None;
        }
        // INIT_* and PAPER_SCORING always target a project; a record missing
        // it cannot name its stage input.
        record.project_id?;
        if record.job_type == JobType::PaperScoring && record.paper_id.is_none() {
            return None;
        }
        Some(Self {
            background_job_id: record.id,
            user_id: record.user_id,
            project_id: record.project_id,
            paper_id: record.paper_id,
            stage_data: None,
        })
    }
}
