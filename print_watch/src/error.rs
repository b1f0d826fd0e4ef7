// THEORY:
// Each failure concern gets its own enum: scoring, stage halts, setup, frame
// sources, storage, encoding and listeners. A scoring failure that ends a
// session travels inside `StageError::Halted` together with the defect event it
// produced, so the controller can persist the outcome before stopping.

use crate::core_modules::stage::LifecycleEvent;
use thiserror::Error;

/// Failures while scoring a frame against the reference image.
#[derive(Debug, Error)]
pub enum ScoringError {
    /// The match set is degenerate: a reference descriptor could not be paired
    /// with two neighbours in the current frame.
    #[error("not enough matches: reference descriptor {query_index} has fewer than two neighbours")]
    InsufficientNeighbours { query_index: usize },
}

/// Failures raised by a stage while processing one frame.
#[derive(Debug, Error)]
pub enum StageError {
    /// Scoring failed. The failure has already been reported as the carried
    /// defect event; the session must stop pulling frames.
    #[error("session halted: {source}")]
    Halted {
        event: Box<LifecycleEvent>,
        #[source]
        source: ScoringError,
    },
}

/// Failures that prevent a session from starting.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("reference image unavailable: {0}")]
    ReferenceUnavailable(String),

    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a session is already active")]
    SessionActive,
}

/// A frame source could not deliver the next frame.
#[derive(Debug, Error)]
#[error("frame source failed: {message}")]
pub struct SourceError {
    pub message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A print record could not be persisted.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage rejected record: {0}")]
    Rejected(String),
}

/// A frame could not be encoded for storage or transport.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("cannot encode an empty frame")]
    EmptyFrame,
}

/// A notification listener failed to handle a message.
#[derive(Debug, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);
