//! Batch and request orchestration for JDMA.
//!
//! The [`Orchestrator`] owns the metadata store, the backend registry and
//! the quota ledger, and exposes the inbound API (register batches, submit,
//! inspect and cancel requests). [`Orchestrator::advance`] is the state
//! machine step the scheduler drives.

pub mod error;
pub mod locks;
mod machine;
pub mod notifier;
pub mod orchestrator;
pub mod quota;

pub use error::{EngineError, NotifyError};
pub use locks::{BatchLocks, Inflight};
pub use machine::{Advance, StallOutcome};
pub use notifier::{LogNotifier, Notification, Notifier, Outcome, RecordingNotifier};
pub use orchestrator::{BackendInfo, NewBatch, Orchestrator, RequestFilter};
pub use quota::QuotaLedger;
