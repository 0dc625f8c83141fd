//! The model representation the coordinator passes between `ModelStore`,
//! `Aggregator` and the wire: a named-tensor parameter dictionary plus a
//! model-kind tag, matching spec §6's "Model blob format".
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Element type of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F64,
}

/// One named tensor: its shape, dtype and flattened values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub values: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Self {
        Self {
            shape,
            dtype: DataType::F32,
            values,
        }
    }

    pub fn vector(values: Vec<f64>) -> Self {
        let len = values.len();
        Self::new(vec![len], values)
    }
}

/// An opaque model-parameter container: a parameter dictionary keyed by
/// layer name (iterated in sorted, lexicographic order so that encoding
/// and aggregation are deterministic), a statistics-only key list, and a
/// model-kind tag. The coordinator never interprets tensor values beyond
/// combining or passing them through per the aggregation strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelBlob {
    pub model_kind: String,
    pub parameters: BTreeMap<String, Tensor>,
    pub statistics_only_keys: BTreeSet<String>,
}

impl ModelBlob {
    pub fn empty(model_kind: impl Into<String>) -> Self {
        Self {
            model_kind: model_kind.into(),
            parameters: BTreeMap::new(),
            statistics_only_keys: BTreeSet::new(),
        }
    }

    /// The parameter key set, used for schema-agreement checks across
    /// client uploads.
    pub fn key_set(&self) -> BTreeSet<&str> {
        self.parameters.keys().map(String::as_str).collect()
    }

    /// Serializes to the opaque byte form stored by `ModelStore`.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ModelBlob serialization is infallible")
    }

    /// Deserializes a blob previously produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let mut blob = ModelBlob::empty("pneumonia");
        blob.parameters
            .insert("layer1.weight".to_string(), Tensor::vector(vec![1.0, 2.0]));
        let bytes = blob.to_bytes();
        let decoded = ModelBlob::from_bytes(&bytes).unwrap();
        assert_eq!(blob, decoded);
    }
}
