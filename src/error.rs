//! Error types shared by every part of the crate.

use std::io;

use thiserror::Error;

/// Errors returned by model construction, inference, serialization and training.
///
/// Caller bugs such as out-of-range component indices or assignments of the
/// wrong arity are not represented here: they panic, the same way slice
/// indexing does.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure while reading or writing a stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stream did not contain what its reader expected
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A parameter was rejected by its setter, or a model carries an
    /// observed value or training label outside its variable's domain
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Two factors disagree on the domain size of the same variable
    #[error("variable {variable} has conflicting sizes {first} and {second}")]
    StructuralInconsistency {
        variable: usize,
        first: usize,
        second: usize,
    },

    /// A variable is neither determined by the model nor labeled for training
    #[error("variable {variable} has no deterministic marginal and no training label")]
    MissingLabel { variable: usize },

    /// A training worker thread panicked
    #[error("training worker panicked")]
    WorkerPanicked,
}

/// Convenient alias for results carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}
