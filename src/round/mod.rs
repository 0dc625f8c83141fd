//! `RoundManager` and the round/participant data model: the round state
//! machine (`created → inProgress → aggregating → completed|failed`) and
//! the participant substate machine
//! (`invited → joined → completed`, terminal: `completed|timedOut|declined`).
pub mod error;
pub mod manager;
pub mod selection;

use std::{collections::BTreeMap, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::core::aggregator::{registry::EvalMetrics, AggregationStrategy};

/// The rule used to choose which clients are invited into a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionStrategy {
    Random,
    ResourceWeighted,
    LeastParticipation,
}

/// A round's position in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundStatus {
    Created,
    InProgress,
    Aggregating,
    Completed,
    Failed,
}

impl RoundStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundStatus::Completed | RoundStatus::Failed)
    }
}

/// A client's position in a round's participant substate machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParticipantStatus {
    Invited,
    Joined,
    Completed,
    TimedOut,
    Declined,
}

impl ParticipantStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ParticipantStatus::Completed | ParticipantStatus::TimedOut | ParticipantStatus::Declined
        )
    }
}

/// A client's role within one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub client_id: String,
    pub status: ParticipantStatus,
    pub invited_at: SystemTime,
    pub joined_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub uploaded_blob_ref: Option<String>,
    pub training_metrics: Option<serde_json::Value>,
}

impl Participant {
    fn invited_now(client_id: String) -> Self {
        Self {
            client_id,
            status: ParticipantStatus::Invited,
            invited_at: SystemTime::now(),
            joined_at: None,
            completed_at: None,
            uploaded_blob_ref: None,
            training_metrics: None,
        }
    }
}

/// Caller-supplied configuration for a new round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundConfig {
    pub min_clients: u32,
    pub max_clients: u32,
    pub timeout_seconds: u64,
    pub aggregation_strategy: AggregationStrategy,
    pub selection_strategy: SelectionStrategy,
    #[serde(default)]
    pub hyperparameters: serde_json::Map<String, serde_json::Value>,
}

/// Evaluation/aggregation metrics recorded once a round finalizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResults {
    pub eval: EvalMetrics,
    pub contributing_clients: Vec<String>,
}

/// One cycle of distributing a global model, local training, and
/// aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: String,
    pub model_id: String,
    pub model_kind: String,
    pub round_number: u64,
    pub status: RoundStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub config: RoundConfig,
    /// Per-round seed for the `random` selection strategy, fixed at
    /// creation so selection is reproducible.
    pub selection_seed: u64,
    pub participants: BTreeMap<String, Participant>,
    pub global_blob_ref: String,
    pub aggregated_blob_ref: Option<String>,
    pub results: Option<RoundResults>,
}

impl Round {
    pub fn invited_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Invited)
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.participants.values().all(|p| p.status.is_terminal())
    }

    pub fn completed_client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Completed)
            .map(|p| p.client_id.clone())
            .collect();
        ids.sort();
        ids
    }
}
