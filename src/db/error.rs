//! Error handling for the [`super::ModelStore`].
use displaydoc::Display;
use thiserror::Error;

/// Errors raised while reading or writing the persisted model/round tree.
#[derive(Debug, Display, Error)]
pub enum StoreError {
    /// Blob {0} was not found in the store.
    NotFound(String),
    /// Round {0} cannot be purged because it is not in a terminal state.
    NotTerminal(String),
    /// I/O error while accessing the store: {0}.
    Io(String),
    /// Stored round record is malformed: {0}.
    Corrupt(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
