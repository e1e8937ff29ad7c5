//! Durable job records and their state machine.
//!
//! A [`JobRecord`] is the unit of durable background work. It outlives the
//! broker's own task representation: when broker storage is lost, the record
//! carries enough identity to reconstruct the task (see `jobs::payload`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::queue::QueueName;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The pipeline stage a job executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Stage 1 of project init: decompose the user's idea into intent fields.
    InitIntent,
    /// Stage 2 of project init: generate search queries from intent fields.
    InitQuery,
    /// Score one candidate paper against the user's idea.
    PaperScoring,
    /// Deliver a completion notification.
    SendEmail,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitIntent => "INIT_INTENT",
            Self::InitQuery => "INIT_QUERY",
            Self::PaperScoring => "PAPER_SCORING",
            Self::SendEmail => "SEND_EMAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INIT_INTENT" => Some(Self::InitIntent),
            "INIT_QUERY" => Some(Self::InitQuery),
            "PAPER_SCORING" => Some(Self::PaperScoring),
            "SEND_EMAIL" => Some(Self::SendEmail),
            _ => None,
        }
    }

    /// The queue that services this job type.
    ///
    /// This is the single registry mapping job types to queues: adding a job
    /// type means adding a row here, nothing else.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::InitIntent | Self::InitQuery => QueueName::ProjectInit,
            Self::PaperScoring => QueueName::PaperScoring,
            Self::SendEmail => QueueName::Email,
        }
    }

    /// Whether a lost broker task for this job type can be rebuilt from the
    /// durable record alone. SEND_EMAIL payloads are not durably stored.
    pub fn is_reconstructable(&self) -> bool {
        !matches!(self, Self::SendEmail)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job record.
///
/// Legal transitions:
/// PENDING → PROCESSING → {COMPLETED, FAILED, FAILED_NO_CREDITS};
/// {FAILED, FAILED_NO_CREDITS} → PENDING (resume only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued (or re-queued by resume), not yet picked up.
    Pending,
    /// A worker owns the job.
    Processing,
    /// Terminal success.
    Completed,
    /// Terminal-but-resumable generic failure.
    Failed,
    /// Terminal-but-resumable credit exhaustion.
    FailedNoCredits,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::FailedNoCredits => "FAILED_NO_CREDITS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "FAILED_NO_CREDITS" => Some(Self::FailedNoCredits),
            _ => None,
        }
    }

    /// Check if the job is in a state that resume may target.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Failed | Self::FailedNoCredits)
    }

    /// Check if the status is terminal (no worker will touch it again
    /// without an explicit resume).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::FailedNoCredits)
    }

    /// Check whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::FailedNoCredits)
                | (Self::Failed, Self::Pending)
                | (Self::FailedNoCredits, Self::Pending)
                // resume may demote FAILED → FAILED_NO_CREDITS (credit check)
                // and re-stamp the orphan trap (FAILED → FAILED)
                | (Self::Failed, Self::FailedNoCredits)
                | (Self::Failed, Self::Failed)
                | (Self::FailedNoCredits, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A durable row representing one unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    /// Owner; immutable, checked on every resume.
    pub user_id: Uuid,
    pub project_id: Option<Uuid>,
    pub paper_id: Option<Uuid>,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Diagnostic reason for the last failure; cleared on successful resume.
    pub failure_reason: Option<String>,
    /// Reference to the live broker task, if any. At most one at a time;
    /// reconstruction overwrites it.
    pub external_task_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a new PENDING record.
    pub fn new(user_id: Uuid, job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            user_id,
            project_id: None,
            paper_id: None,
            job_type,
            status: JobStatus::Pending,
            failure_reason: None,
            external_task_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Scope the job to a project.
    pub fn for_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Scope the job to a paper (paper-scoring jobs carry both ids).
    pub fn for_paper(mut self, paper_id: Uuid) -> Self {
        self.paper_id = Some(paper_id);
        self
    }
}
