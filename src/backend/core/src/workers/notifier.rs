//! Notification delivery seam for the email queue.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::jobs::NotificationKind;

/// One outbound notification. Carries the project id so downstream delivery
/// can deduplicate repeats of the same announcement.
#[derive(Debug, Clone)]
pub struct Notification {
    pub user_id: Uuid,
    pub recipient_email: Option<String>,
    pub project_id: Option<Uuid>,
    pub kind: NotificationKind,
}

/// Trait for notification backends.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Notifier that only logs. Used when no mail transport is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        tracing::info!(
            user_id = %notification.user_id,
            recipient = ?notification.recipient_email,
            project_id = ?notification.project_id,
            kind = ?notification.kind,
            "Notification delivered (log only)"
        );
        Ok(())
    }
}
