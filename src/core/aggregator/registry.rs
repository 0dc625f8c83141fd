//! Static registry of model-kind specific behaviour: the empty-model
//! factory, the statistics-only key set, and the optional evaluator.
//!
//! Grounded in design note: "Dynamic discovery of model families ... loads
//! per-kind modules at runtime. Re-architect as an explicit registry" — the
//! source's `importlib.import_module(f"federated_learning.models.{kind}")`
//! becomes this static table populated at startup.
use std::collections::{BTreeSet, HashMap};

use crate::core::model::ModelBlob;

/// Evaluation metrics produced by a model-kind's evaluator, or all-`None`
/// fields when no held-out test set is configured.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EvalMetrics {
    pub loss: Option<f64>,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

/// Per-model-kind behaviour: how to build an empty model, which keys are
/// statistics-only (never averaged, passed through from the first client),
/// and how to evaluate an aggregated model.
#[derive(Clone)]
pub struct ModelKindSpec {
    pub statistics_only_keys: BTreeSet<String>,
    empty_model_factory: fn(&str) -> ModelBlob,
    evaluator: Option<fn(&ModelBlob) -> EvalMetrics>,
}

impl ModelKindSpec {
    pub fn new(statistics_only_keys: BTreeSet<String>) -> Self {
        Self {
            statistics_only_keys,
            empty_model_factory: default_empty_model,
            evaluator: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: fn(&ModelBlob) -> EvalMetrics) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn empty_model(&self, model_kind: &str) -> ModelBlob {
        let mut model = (self.empty_model_factory)(model_kind);
        model.statistics_only_keys = self.statistics_only_keys.clone();
        model
    }

    pub fn evaluate(&self, blob: &ModelBlob) -> EvalMetrics {
        self.evaluator.map(|f| f(blob)).unwrap_or_default()
    }
}

fn default_empty_model(model_kind: &str) -> ModelBlob {
    ModelBlob::empty(model_kind)
}

/// The default batch-norm-style statistics-only keys, grounded in the
/// original aggregator's skip list for `running_mean` / `running_var` /
/// `num_batches_tracked`.
pub fn default_statistics_only_keys() -> BTreeSet<String> {
    ["running_mean", "running_var", "num_batches_tracked"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// The process-wide table mapping a model kind to its behaviour.
#[derive(Clone)]
pub struct ModelKindRegistry {
    specs: HashMap<String, ModelKindSpec>,
}

impl ModelKindRegistry {
    pub fn new() -> Self {
        Self {
            specs: HashMap::new(),
        }
    }

    /// A registry pre-populated with a permissive default spec for any
    /// model kind not explicitly registered.
    pub fn with_default_fallback() -> Self {
        Self::new()
    }

    pub fn register(&mut self, model_kind: impl Into<String>, spec: ModelKindSpec) {
        self.specs.insert(model_kind.into(), spec);
    }

    /// Looks up a model kind's spec, falling back to a spec built from the
    /// default statistics-only keys when the kind was never explicitly
    /// registered (keeps round 1 usable for any `modelKind` string a
    /// client declares).
    pub fn get(&self, model_kind: &str) -> ModelKindSpec {
        self.specs
            .get(model_kind)
            .cloned()
            .unwrap_or_else(|| ModelKindSpec::new(default_statistics_only_keys()))
    }
}

impl Default for ModelKindRegistry {
    fn default() -> Self {
        Self::with_default_fallback()
    }
}
