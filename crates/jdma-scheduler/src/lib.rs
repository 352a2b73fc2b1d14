//! Request scheduling for JDMA.
//!
//! [`Scheduler`] polls the orchestrator's state index, claims runnable
//! requests and advances each one a single step on a worker pool sized per
//! backend. Requests that overrun the staleness window are handed to
//! [`Orchestrator::handle_stall`](jdma_engine::Orchestrator::handle_stall).

pub mod error;
pub mod scheduler;

pub use error::SchedulerError;
pub use scheduler::{Scheduler, SchedulerStats, TickReport};
