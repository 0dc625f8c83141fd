//! Error handling for [`super::ClientRegistry`].
use displaydoc::Display;
use thiserror::Error;

/// Errors raised by client registry operations.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum RegistryError {
    /// No client registered with id {0}.
    NotFound(String),
}
