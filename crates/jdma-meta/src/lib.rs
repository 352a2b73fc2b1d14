//! Persistent orchestrator store wrapping Fjall.
//!
//! [`MetaStore`] is the single source of truth for orchestrator state. It
//! provides typed accessors over eight keyspaces:
//!
//! - `batches`: [`BatchId`](jdma_types::BatchId) → [`Batch`](jdma_types::Batch)
//! - `requests`: [`RequestId`](jdma_types::RequestId) → [`Request`](jdma_types::Request)
//! - `request_index`: state code (2 bytes BE) ++ request id → `()`, scanned by the scheduler
//! - `batch_active`: batch id → id of its non-terminal request
//! - `parts`: batch id ++ part index (4 bytes BE) → [`ArchivePart`](jdma_types::ArchivePart)
//! - `quota`: workspace length (4 bytes BE) ++ workspace ++ backend → [`QuotaRecord`](jdma_types::QuotaRecord)
//! - `users`: user name → [`User`](jdma_types::User)
//! - `counters`: counter name → next id
//!
//! `request_index` and `batch_active` are derived from `requests` and are
//! rebuilt every time the store is opened.

mod error;
mod store;

pub use error::MetaError;
pub use store::MetaStore;
