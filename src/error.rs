use crate::cancel::CancelReason;
use thiserror::Error;

/// Boxed error returned by user transforms
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for stage pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while building or running a stage
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The transform rejected a message; fatal for the rest of the run
    #[error("[{stage}]: {source}")]
    Transform {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// A worker observed the cancellation signal before finishing its work
    #[error("[{stage}]: {reason}")]
    Cancelled { stage: String, reason: CancelReason },

    /// Every receiver of the output stream was dropped
    #[error("[{stage}]: output stream closed by consumer")]
    OutputClosed { stage: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Completion was not signalled in time
    #[error("[{stage}]: timed out waiting for completion")]
    Timeout { stage: String },
}

impl PipelineError {
    /// Whether this error came from a cancellation signal rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }

    /// Name of the stage that produced the error, if any
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::Transform { stage, .. }
            | PipelineError::Cancelled { stage, .. }
            | PipelineError::OutputClosed { stage }
            | PipelineError::Timeout { stage } => Some(stage),
            PipelineError::ConfigError(_) | PipelineError::ThreadError(_) => None,
        }
    }
}
