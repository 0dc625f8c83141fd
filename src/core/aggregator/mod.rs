//! Aggregation module: deterministic weighted combination of N client
//! model blobs into one global blob, with a pluggable strategy.
pub mod error;
pub mod registry;

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::{
    aggregator::error::AggregatorError,
    model::{ModelBlob, Tensor},
};

/// Which rule combines client blobs into a new global blob.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum AggregationStrategy {
    UniformMean,
    SizeWeightedMean,
    /// Drop the outer `k` fraction at each tail per parameter scalar before
    /// averaging the middle.
    TrimmedMean { k: f64 },
}

/// One client's contribution to an aggregation round: its uploaded blob
/// and (for `sizeWeightedMean`) its declared weight.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub client_id: String,
    pub blob: ModelBlob,
    /// `metrics.dataSize`, defaulting to 1.0 if absent.
    pub weight: f64,
}

/// Combines `contributions` (already given in a stable, deterministic
/// order — callers sort by `client_id`) into one aggregated [`ModelBlob`].
///
/// Deterministic given the same ordered inputs and strategy: parameters
/// are combined key-by-key in sorted lexicographic order.
pub fn combine(
    contributions: &[Contribution],
    strategy: &AggregationStrategy,
) -> Result<ModelBlob, AggregatorError> {
    if contributions.is_empty() {
        return Err(AggregatorError::EmptyInput);
    }

    let first = &contributions[0].blob;
    let key_set = first.key_set();
    for c in &contributions[1..] {
        if c.blob.key_set() != key_set {
            return Err(AggregatorError::SchemaMismatch);
        }
    }

    let statistics_only = &first.statistics_only_keys;

    let mut parameters = BTreeMap::new();
    for key in first.parameters.keys() {
        let tensor = if statistics_only.contains(key) {
            first.parameters[key].clone()
        } else {
            match strategy {
                AggregationStrategy::UniformMean => weighted_average(contributions, key, None)?,
                AggregationStrategy::SizeWeightedMean => {
                    weighted_average(contributions, key, Some(()))?
                }
                AggregationStrategy::TrimmedMean { k } => trimmed_mean(contributions, key, *k)?,
            }
        };
        parameters.insert(key.clone(), tensor);
    }

    Ok(ModelBlob {
        model_kind: first.model_kind.clone(),
        parameters,
        statistics_only_keys: first.statistics_only_keys.clone(),
    })
}

fn tensor_for<'a>(
    contributions: &'a [Contribution],
    key: &str,
) -> Result<Vec<&'a Tensor>, AggregatorError> {
    let tensors: Vec<&Tensor> = contributions
        .iter()
        .map(|c| &c.blob.parameters[key])
        .collect();
    let shape = &tensors[0].shape;
    if tensors.iter().any(|t| &t.shape != shape) {
        return Err(AggregatorError::ShapeMismatch(key.to_string()));
    }
    Ok(tensors)
}

/// `uniformMean` (weight 1 each) or `sizeWeightedMean` (weight =
/// `metrics.dataSize`), normalized to sum to 1.
fn weighted_average(
    contributions: &[Contribution],
    key: &str,
    size_weighted: Option<()>,
) -> Result<Tensor, AggregatorError> {
    let tensors = tensor_for(contributions, key)?;
    let raw_weights: Vec<f64> = if size_weighted.is_some() {
        contributions.iter().map(|c| c.weight).collect()
    } else {
        vec![1.0; contributions.len()]
    };
    let total: f64 = raw_weights.iter().sum();
    let weights: Vec<f64> = raw_weights.iter().map(|w| w / total).collect();

    let len = tensors[0].values.len();
    let values: Vec<f64> = (0..len)
        .into_par_iter()
        .map(|i| {
            tensors
                .iter()
                .zip(&weights)
                .map(|(t, w)| t.values[i] * w)
                .sum()
        })
        .collect();

    Ok(Tensor {
        shape: tensors[0].shape.clone(),
        dtype: tensors[0].dtype,
        values,
    })
}

/// Sorts contributions per scalar, drops the outer `k` fraction at each
/// tail, averages the middle.
fn trimmed_mean(contributions: &[Contribution], key: &str, k: f64) -> Result<Tensor, AggregatorError> {
    let tensors = tensor_for(contributions, key)?;
    let n = tensors.len();
    let trim = ((n as f64) * k).floor() as usize;
    let len = tensors[0].values.len();

    let values: Vec<f64> = (0..len)
        .into_par_iter()
        .map(|i| {
            let mut scalars: Vec<f64> = tensors.iter().map(|t| t.values[i]).collect();
            scalars.sort_by(|a, b| a.partial_cmp(b).expect("aggregation input must not be NaN"));
            let low = trim.min(n);
            let high = n.saturating_sub(trim).max(low);
            let kept = &scalars[low..high];
            if kept.is_empty() {
                scalars.iter().sum::<f64>() / n as f64
            } else {
                kept.iter().sum::<f64>() / kept.len() as f64
            }
        })
        .collect();

    Ok(Tensor {
        shape: tensors[0].shape.clone(),
        dtype: tensors[0].dtype,
        values,
    })
}
