//! Error handling for [`super::combine`].
use displaydoc::Display;
use thiserror::Error;

/// Errors raised while aggregating client contributions into one global blob.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum AggregatorError {
    /// No contributions were supplied for aggregation.
    EmptyInput,
    /// Client blobs disagree on their parameter key set.
    SchemaMismatch,
    /// Parameter {0} has mismatched tensor shapes across contributions.
    ShapeMismatch(String),
}
