//! Error types for the communication layer.

/// Errors raised by workers, slots and signals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComError {
    #[error("Slot has no worker")]
    NoWorker,

    #[error("Worker '{0}' is stopped")]
    WorkerStopped(String),

    #[error("Task was dropped before completion")]
    TaskAborted,

    #[error("Bad slot: {0}")]
    BadSlot(String),

    #[error("Slot already connected")]
    AlreadyConnected,

    #[error("Bad run: slot expects {expected}")]
    BadRun { expected: &'static str },

    #[error("Slot owner has been dropped")]
    OwnerDropped,

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}

/// Result type for communication operations
pub type ComResult<T> = Result<T, ComError>;
