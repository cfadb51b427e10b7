use std::io;

use thiserror::Error;

use crate::accelerator::AccelError;

use super::{expression::EvalError, processor::task::TaskState};

/// Errors surfaced to the scan consumer. Every variant is fatal for the scan;
/// recoverable accelerator failures never leave the task lifecycle.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Accelerator error: {0}")]
    Accelerator(#[from] AccelError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvalError),

    #[error("Columnar cache error: {0}")]
    Cache(String),

    #[error("Chunk too small: {0}")]
    ChunkTooSmall(String),

    #[error("Invalid task transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;
