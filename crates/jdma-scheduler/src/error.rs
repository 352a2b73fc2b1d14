//! Error types for the scheduler.

/// Errors that stop a scheduler tick.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Failed to read the state index.
    #[error("metadata error: {0}")]
    Meta(#[from] jdma_meta::MetaError),

    /// The orchestrator rejected a claim or stall update.
    #[error("engine error: {0}")]
    Engine(#[from] jdma_engine::EngineError),
}
