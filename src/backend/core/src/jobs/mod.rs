//! Durable job records and broker task payloads.

pub mod payload;
pub mod record;

pub use payload::{IntentFields, NotificationKind, StageData, TaskPayload};
pub use record::{JobId, JobRecord, JobStatus, JobType};
