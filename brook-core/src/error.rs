//! Typed engine errors.
//!
//! Most call sites propagate through `anyhow::Result`; these variants exist so
//! the scheduler and job layer can tell the outcomes apart with
//! `downcast_ref` (cancellation vs failure, fatal decode vs retryable worker
//! error).

/// Errors raised while building or running a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A stage was registered twice.
    #[error("duplicate stage: {0}")]
    DuplicateStage(String),

    /// A stage id or name does not resolve.
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    /// An instruction id does not name an in-flight bundle.
    #[error("unknown bundle: {0}")]
    UnknownBundle(String),

    /// A PCollection id does not resolve.
    #[error("unknown pcollection: {0}")]
    UnknownPCollection(String),

    /// A coder id does not resolve.
    #[error("unknown coder: {0}")]
    UnknownCoder(String),

    /// A transform is bound to an environment nothing can execute.
    #[error("unknown environment: {0:?}")]
    UnknownEnvironment(String),

    /// Trigger variant the engine does not implement.
    #[error("unsupported trigger: {0}")]
    UnsupportedTrigger(String),

    /// Window function the engine does not implement.
    #[error("unsupported window function: {0}")]
    UnsupportedWindowFn(String),

    /// A payload or graph reference is structurally invalid.
    #[error("malformed pipeline: {0}")]
    Malformed(String),

    /// Bytes do not match the declared coder.
    #[error("decode error: {0}")]
    Decode(String),

    /// A stage kept failing past its retry budget.
    #[error("bundle {instruction} for stage {stage} failed after {attempts} attempts: {cause}")]
    BundleFailed {
        stage: String,
        instruction: String,
        attempts: usize,
        cause: String,
    },

    /// No work can make progress but the pipeline has not finished.
    #[error("pipeline is stuck: {0}")]
    Stuck(String),

    /// The run was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An engine task died.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        EngineError::Decode(msg.into())
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        EngineError::Malformed(msg.into())
    }

    /// Whether a bundle that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::Decode(_)
                | EngineError::Cancelled(_)
                | EngineError::Malformed(_)
                | EngineError::Internal(_)
        )
    }
}
