//! Domain types and algorithms shared by `RoundManager`: the model
//! representation and the aggregation strategies.
pub mod aggregator;
pub mod model;
