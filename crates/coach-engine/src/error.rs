//! Error types surfaced to callers of the evaluation API

/// Errors returned to callers of the evaluation API.
///
/// None of them takes the session down: the failing `evaluate` / `initialize`
/// call ends with `Err` and the driver keeps accepting requests.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Called before `initialize` completed, or after `destroy`
    #[error("engine session is not initialized")]
    NotInitialized,

    /// Transport level failure (write error, engine exit, closed pipe)
    #[error("engine channel error: {0}")]
    EngineChannel(String),

    /// Deadline exceeded before the engine completed the search
    #[error("evaluation timed out")]
    Timeout,

    /// A newer request displaced this one before the engine produced any output for it
    #[error("evaluation superseded by a newer request")]
    Superseded,

    /// Explicit stop / destroy
    #[error("evaluation stopped")]
    Stopped,

    /// Launch or handshake failure
    #[error("engine initialization failed: {0}")]
    Initialization(String),

    /// Position descriptor rejected before reaching the engine
    #[error("invalid position: {0}")]
    InvalidPosition(String),
}

/// Result type for session operations
pub type EngineResult<T> = Result<T, EngineError>;
