//! Typed errors for the prediction pipeline boundaries.

use thiserror::Error;

use crate::command::Sequence;

/// Errors raised by the command outbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    /// A command was pushed whose sequence does not follow the last one.
    #[error("command sequence {got} does not follow {last}")]
    NonMonotonicSequence { last: Sequence, got: Sequence },
    /// Sends kept failing; pending commands are still held.
    #[error("send failed {attempts} times in a row")]
    RetriesExhausted { attempts: u32 },
}

/// Errors raised by the client prediction pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredictionError {
    /// No locally controlled entity is attached yet.
    #[error("no controlled entity attached")]
    NoControlledEntity,
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

pub type PredictionResult<T> = std::result::Result<T, PredictionError>;
