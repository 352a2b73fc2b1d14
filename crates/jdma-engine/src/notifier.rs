//! Completion and failure notifications.

use std::sync::Mutex;

use jdma_types::RequestId;
use tracing::info;

use crate::error::NotifyError;

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Delivers a message to a user when one of their requests finishes.
///
/// Called from a detached task; an error is logged and never affects the
/// request.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        address: &str,
        request_id: RequestId,
        outcome: Outcome,
        detail: &str,
    ) -> Result<(), NotifyError>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        address: &str,
        request_id: RequestId,
        outcome: Outcome,
        detail: &str,
    ) -> Result<(), NotifyError> {
        info!(to = address, %request_id, %outcome, detail, "notification");
        Ok(())
    }
}

/// A delivered notification, as captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub address: String,
    pub request_id: RequestId,
    pub outcome: Outcome,
    pub detail: String,
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, oldest first.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        address: &str,
        request_id: RequestId,
        outcome: Outcome,
        detail: &str,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .expect("notifier lock poisoned")
            .push(Notification {
                address: address.to_string(),
                request_id,
                outcome,
                detail: detail.to_string(),
            });
        Ok(())
    }
}
