//! Storage backend adapters for archive parts.
//!
//! This crate defines the [`StorageBackend`] trait through which the
//! orchestrator moves packed parts to and from tiered storage, along with
//! three concrete backends:
//!
//! - [`ObjectStoreBackend`]: in-process object bucket (`RwLock<HashMap>`).
//! - [`DiskBackend`]: fan-out directory layout on local disk.
//! - [`TapeBackend`]: file-backed volume with recall latency and a bounded
//!   number of drives.
//!
//! Wrappers compose on top of any backend: [`RetryingBackend`] applies a
//! [`RetryPolicy`] to transient errors, while [`SlowBackend`] and
//! [`FaultyBackend`] inject latency and scripted faults for testing.
//! [`BackendRegistry`] maps stored backend identifiers to adapters.

mod backend;
mod disk;
mod error;
mod faulty;
mod object_store;
mod registry;
mod retry;
mod slow;
mod tape;

pub use backend::{PartKey, StorageBackend};
pub use disk::DiskBackend;
pub use error::StoreError;
pub use faulty::{Fault, FaultyBackend, Op};
pub use object_store::ObjectStoreBackend;
pub use registry::{BackendEntry, BackendRegistry};
pub use retry::{ExponentialBackoff, RetryPolicy, RetryingBackend};
pub use slow::SlowBackend;
pub use tape::TapeBackend;
