//! The crate-wide error-kind taxonomy (spec §7), independent of any single
//! component's internal error type. `CoordinatorAPI` maps this onto an
//! HTTP status class; `RoundManager` maps failures in the finalization job
//! onto the round's terminal `failed` state.
use displaydoc::Display;
use thiserror::Error;

use crate::{
    core::aggregator::error::AggregatorError, crypto::error::CryptoError, db::error::StoreError,
    registry::error::RegistryError, round::error::RoundError,
};

/// The error-kind taxonomy shared across the coordinator's components.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum CoordinatorError {
    /// Malformed input: {0}.
    Validation(String),
    /// Not found: {0}.
    NotFound(String),
    /// Conflict: {0}.
    Conflict(String),
    /// Precondition failed: {0}.
    PreconditionFailed(String),
    /// Caller does not hold the required participation slot: {0}.
    NotEligible(String),
    /// Signature verification failed.
    SignatureInvalid,
    /// Security keys are not initialized.
    NotInitialized,
    /// Unauthorized: {0}.
    Unauthorized(String),
    /// Client blobs disagree on their parameter key set.
    SchemaMismatch,
    /// Selection cannot satisfy the round's minimum client count.
    InsufficientCandidates,
    /// Transient error, safe to retry: {0}.
    Transient(String),
    /// Unrecoverable error: {0}.
    Fatal(String),
}

impl CoordinatorError {
    /// The HTTP status class this error kind maps to, per spec §7.
    pub fn status_code(&self) -> u16 {
        match self {
            CoordinatorError::Validation(_) => 400,
            CoordinatorError::NotFound(_) => 404,
            CoordinatorError::Conflict(_) => 409,
            CoordinatorError::PreconditionFailed(_) => 412,
            CoordinatorError::NotEligible(_) => 403,
            CoordinatorError::SignatureInvalid => 401,
            CoordinatorError::NotInitialized => 503,
            CoordinatorError::Unauthorized(_) => 401,
            CoordinatorError::SchemaMismatch => 409,
            CoordinatorError::InsufficientCandidates => 412,
            CoordinatorError::Transient(_) => 503,
            CoordinatorError::Fatal(_) => 500,
        }
    }
}

impl From<CryptoError> for CoordinatorError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::NotInitialized => CoordinatorError::NotInitialized,
            CryptoError::TokenExpired | CryptoError::TokenTampered => {
                CoordinatorError::Unauthorized(e.to_string())
            }
            other => CoordinatorError::Fatal(other.to_string()),
        }
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(r) => CoordinatorError::NotFound(r),
            StoreError::NotTerminal(r) => CoordinatorError::PreconditionFailed(r),
            other => CoordinatorError::Transient(other.to_string()),
        }
    }
}

impl From<AggregatorError> for CoordinatorError {
    fn from(e: AggregatorError) -> Self {
        match e {
            AggregatorError::SchemaMismatch => CoordinatorError::SchemaMismatch,
            other => CoordinatorError::Fatal(other.to_string()),
        }
    }
}

impl From<RegistryError> for CoordinatorError {
    fn from(e: RegistryError) -> Self {
        CoordinatorError::NotFound(e.to_string())
    }
}

impl From<RoundError> for CoordinatorError {
    fn from(e: RoundError) -> Self {
        match e {
            RoundError::Conflict(m) => CoordinatorError::Conflict(m),
            RoundError::InvalidConfig(m) => CoordinatorError::Validation(m),
            RoundError::NoPredecessor(n) => {
                CoordinatorError::PreconditionFailed(format!("no predecessor for round {n}"))
            }
            RoundError::PreconditionFailed(m) => CoordinatorError::PreconditionFailed(m),
            RoundError::NotEligible(m) => CoordinatorError::NotEligible(m),
            RoundError::InsufficientCandidates => CoordinatorError::InsufficientCandidates,
            RoundError::SchemaMismatch => CoordinatorError::SchemaMismatch,
            RoundError::SignatureInvalid => CoordinatorError::SignatureInvalid,
            RoundError::NotFound(m) => CoordinatorError::NotFound(m),
            RoundError::Internal(m) => CoordinatorError::Fatal(m),
        }
    }
}
