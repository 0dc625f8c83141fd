//! Error handling for [`super::manager::RoundManager`].
use displaydoc::Display;
use thiserror::Error;

use crate::{
    core::aggregator::error::AggregatorError, crypto::error::CryptoError,
    registry::error::RegistryError,
};

/// Errors raised by round state-machine operations.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum RoundError {
    /// Round {0} already exists for this model and round number.
    Conflict(String),
    /// Invalid round configuration: {0}.
    InvalidConfig(String),
    /// No completed predecessor round exists for round number {0}.
    NoPredecessor(u64),
    /// Precondition failed: {0}.
    PreconditionFailed(String),
    /// Client {0} is not eligible for this operation.
    NotEligible(String),
    /// Selection cannot satisfy the round's minimum client count.
    InsufficientCandidates,
    /// Uploaded blobs disagree on their parameter key set.
    SchemaMismatch,
    /// Upload signature does not verify.
    SignatureInvalid,
    /// No round found with id {0}.
    NotFound(String),
    /// Underlying storage or crypto failure: {0}.
    Internal(String),
}

impl From<AggregatorError> for RoundError {
    fn from(e: AggregatorError) -> Self {
        match e {
            AggregatorError::SchemaMismatch => RoundError::SchemaMismatch,
            other => RoundError::Internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for RoundError {
    fn from(e: CryptoError) -> Self {
        RoundError::Internal(e.to_string())
    }
}

impl From<crate::db::error::StoreError> for RoundError {
    fn from(e: crate::db::error::StoreError) -> Self {
        RoundError::Internal(e.to_string())
    }
}

impl From<RegistryError> for RoundError {
    fn from(e: RegistryError) -> Self {
        RoundError::Internal(e.to_string())
    }
}
