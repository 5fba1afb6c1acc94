//! Error types surfaced by sources and the pipeline.
//!
//! Runtime failures (stream drops, sink errors, inference errors) are
//! reported through status events rather than `Err` returns; the types here
//! cover the cases a caller can actually act on: connecting, validating
//! configuration and issuing control operations.

use thiserror::Error;

use crate::source::VideoSourceState;

/// Errors raised by [`crate::source::VideoSource`] control operations.
#[derive(Debug, Error)]
pub enum VideoSourceError {
    /// Initial connection to the source failed. Emitted by `start()`;
    /// mid-stream connection loss is handled by the reconnect loop instead.
    #[error("could not connect to '{reference}' after {attempts} attempt(s): {reason}")]
    SourceConnection {
        reference: String,
        attempts: u32,
        reason: String,
    },

    /// The requested operation is not a legal transition from the current
    /// state, e.g. `pause()` on a source that was never started.
    #[error("operation '{operation}' is not permitted in state {state:?}")]
    OperationNotPermitted {
        operation: &'static str,
        state: VideoSourceState,
    },
}

/// Errors raised when building or starting an
/// [`crate::pipeline::InferencePipeline`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration for '{field}': {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("pipeline has already been started")]
    AlreadyStarted,

    #[error(transparent)]
    Source(#[from] VideoSourceError),
}

impl PipelineError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}
