//! `RoundManager`: the round state machine. Owns the in-memory round table,
//! drives `createRound`/`selectClients`/`startRound`/`join`/`uploadModel`,
//! the timeout handler, and the finalization job.
//!
//! Per-round exclusivity (spec §5) is a `tokio::sync::Mutex` held for the
//! duration of each mutating operation on that round; different rounds
//! progress independently since each has its own lock.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, SystemTime},
};

use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    core::{
        aggregator::{combine, registry::ModelKindRegistry, Contribution},
        model::ModelBlob,
    },
    crypto::CryptoKit,
    db::ModelStore,
    metrics::{MetricSink, RoundEvent, RoundOutcome},
    registry::{ClientFilter, ClientRegistry, ClientStatus},
    round::{
        error::RoundError, selection::select_clients, Participant, ParticipantStatus, Round,
        RoundConfig, RoundResults, RoundStatus,
    },
};

#[derive(Default)]
struct RoundIndex {
    by_id: HashMap<String, Arc<Mutex<Round>>>,
    by_model_round: HashMap<(String, u64), String>,
}

/// Orchestrates the full round lifecycle described in spec §4.3.
pub struct RoundManager {
    store: ModelStore,
    registry: Arc<ClientRegistry>,
    crypto: Arc<CryptoKit>,
    model_registry: ModelKindRegistry,
    metric_sink: Arc<MetricSink>,
    index: RwLock<RoundIndex>,
}

impl RoundManager {
    pub fn new(
        store: ModelStore,
        registry: Arc<ClientRegistry>,
        crypto: Arc<CryptoKit>,
        model_registry: ModelKindRegistry,
        metric_sink: Arc<MetricSink>,
    ) -> Self {
        Self {
            store,
            registry,
            crypto,
            model_registry,
            metric_sink,
            index: RwLock::new(RoundIndex::default()),
        }
    }

    async fn round_arc(&self, round_id: &str) -> Result<Arc<Mutex<Round>>, RoundError> {
        self.index
            .read()
            .await
            .by_id
            .get(round_id)
            .cloned()
            .ok_or_else(|| RoundError::NotFound(round_id.to_string()))
    }

    /// `createRound(modelId, modelKind, roundNumber, config) → roundId`.
    pub async fn create_round(
        &self,
        model_id: &str,
        model_kind: &str,
        round_number: u64,
        config: RoundConfig,
    ) -> Result<String, RoundError> {
        if config.min_clients < 1 {
            return Err(RoundError::InvalidConfig("minClients must be >= 1".into()));
        }
        if config.max_clients < config.min_clients {
            return Err(RoundError::InvalidConfig(
                "maxClients must be >= minClients".into(),
            ));
        }

        let key = (model_id.to_string(), round_number);

        // Conflict check and predecessor lookup only need a read lock, and are
        // re-validated under the write lock below; holding the write lock
        // across the store I/O and the predecessor's own mutex wait would
        // stall every other in-flight round in the process.
        let predecessor_id = {
            let index = self.index.read().await;
            if index.by_model_round.contains_key(&key) {
                return Err(RoundError::Conflict(format!(
                    "round {round_number} of model {model_id} already exists"
                )));
            }
            if round_number > 1 {
                let predecessor_key = (model_id.to_string(), round_number - 1);
                Some(
                    index
                        .by_model_round
                        .get(&predecessor_key)
                        .cloned()
                        .ok_or(RoundError::NoPredecessor(round_number))?,
                )
            } else {
                None
            }
        };

        let global_bytes = if let Some(predecessor_id) = predecessor_id {
            let predecessor_arc = {
                let index = self.index.read().await;
                index
                    .by_id
                    .get(&predecessor_id)
                    .cloned()
                    .ok_or(RoundError::NoPredecessor(round_number))?
            };
            let predecessor = predecessor_arc.lock().await;
            if predecessor.status != RoundStatus::Completed {
                return Err(RoundError::NoPredecessor(round_number));
            }
            let aggregated_ref = predecessor
                .aggregated_blob_ref
                .clone()
                .ok_or(RoundError::NoPredecessor(round_number))?;
            drop(predecessor);
            self.store.get_blob(&aggregated_ref).await?
        } else {
            self.model_registry
                .get(model_kind)
                .empty_model(model_kind)
                .to_bytes()
        };

        let round_id = Uuid::new_v4().to_string();
        let scope = self.store.open_round_scope(&round_id).await?;
        let global_blob_ref = scope.write_global_model(&global_bytes).await?;

        let round = Round {
            id: round_id.clone(),
            model_id: model_id.to_string(),
            model_kind: model_kind.to_string(),
            round_number,
            status: RoundStatus::Created,
            created_at: SystemTime::now(),
            started_at: None,
            ended_at: None,
            config,
            selection_seed: rand::thread_rng().gen(),
            participants: BTreeMap::new(),
            global_blob_ref,
            aggregated_blob_ref: None,
            results: None,
        };
        self.store.snapshot_round(&round_id, &round).await?;

        let mut index = self.index.write().await;
        if index.by_model_round.contains_key(&key) {
            return Err(RoundError::Conflict(format!(
                "round {round_number} of model {model_id} already exists"
            )));
        }
        index.by_id.insert(round_id.clone(), Arc::new(Mutex::new(round)));
        index.by_model_round.insert(key, round_id.clone());
        drop(index);
        info!(round_id = %round_id, model_id, round_number, "round created");
        Ok(round_id)
    }

    /// `selectClients(roundId)`: invites up to `maxClients` eligible clients.
    pub async fn select_clients(&self, round_id: &str) -> Result<(), RoundError> {
        let round_arc = self.round_arc(round_id).await?;
        let mut round = round_arc.lock().await;
        if round.status != RoundStatus::Created {
            return Err(RoundError::PreconditionFailed(
                "round is not in the created state".into(),
            ));
        }

        let filter = ClientFilter {
            model_kind: Some(round.model_kind.clone()),
            status: Some(ClientStatus::Active),
        };
        let candidates = self.registry.list(&filter).await;
        let selected = select_clients(
            candidates,
            round.config.selection_strategy,
            round.config.max_clients as usize,
            round.selection_seed,
        );
        if selected.len() < round.config.min_clients as usize {
            return Err(RoundError::InsufficientCandidates);
        }

        for client_id in &selected {
            round
                .participants
                .insert(client_id.clone(), Participant::invited_now(client_id.clone()));
        }
        self.store.snapshot_round(round_id, &*round).await?;
        info!(round_id, selected = selected.len(), "clients selected");
        Ok(())
    }

    /// `startRound(roundId)`: transitions to `inProgress` and schedules the
    /// timeout handler.
    pub async fn start_round(self: &Arc<Self>, round_id: &str) -> Result<(), RoundError> {
        let round_arc = self.round_arc(round_id).await?;
        let timeout_seconds = {
            let mut round = round_arc.lock().await;
            if round.status != RoundStatus::Created {
                return Err(RoundError::PreconditionFailed(
                    "round is not in the created state".into(),
                ));
            }
            if round.invited_count() < round.config.min_clients as usize {
                return Err(RoundError::PreconditionFailed(
                    "fewer than minClients have been invited".into(),
                ));
            }
            round.status = RoundStatus::InProgress;
            round.started_at = Some(SystemTime::now());
            self.store.snapshot_round(round_id, &*round).await?;
            round.config.timeout_seconds
        };

        let manager = Arc::clone(self);
        let timeout_round_id = round_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_seconds)).await;
            if let Err(err) = manager.handle_timeout(&timeout_round_id).await {
                warn!(round_id = %timeout_round_id, %err, "timeout handler failed");
            }
        });
        info!(round_id, "round started");
        Ok(())
    }

    /// `join(roundId, clientId) → globalBlobRef`. Idempotent once joined.
    pub async fn join(&self, round_id: &str, client_id: &str) -> Result<String, RoundError> {
        let round_arc = self.round_arc(round_id).await?;
        let mut round = round_arc.lock().await;
        if round.status != RoundStatus::InProgress {
            return Err(RoundError::NotEligible("round is not in progress".into()));
        }
        let global_blob_ref = round.global_blob_ref.clone();
        let participant = round
            .participants
            .get_mut(client_id)
            .ok_or_else(|| RoundError::NotEligible(client_id.to_string()))?;

        match participant.status {
            ParticipantStatus::Invited => {
                participant.status = ParticipantStatus::Joined;
                participant.joined_at = Some(SystemTime::now());
                self.store.snapshot_round(round_id, &*round).await?;
                Ok(global_blob_ref)
            }
            ParticipantStatus::Joined => Ok(global_blob_ref),
            _ => Err(RoundError::Conflict(format!(
                "client {client_id} is no longer eligible to join"
            ))),
        }
    }

    /// `decline(roundId, clientId)`: an invited client turns down its
    /// invitation. `minClients` accounting is untouched — the round already
    /// passed its invited-count precondition at `startRound` (or will check
    /// it fresh if declines happen before `startRound`); declining only
    /// removes the client from the pool that can later `join`/`uploadModel`.
    pub async fn decline(self: &Arc<Self>, round_id: &str, client_id: &str) -> Result<(), RoundError> {
        let round_arc = self.round_arc(round_id).await?;
        let finalize_needed = {
            let mut round = round_arc.lock().await;
            if round.status.is_terminal() {
                return Err(RoundError::NotEligible("round has already finished".into()));
            }
            let participant = round
                .participants
                .get_mut(client_id)
                .ok_or_else(|| RoundError::NotEligible(client_id.to_string()))?;
            match participant.status {
                ParticipantStatus::Invited => {
                    participant.status = ParticipantStatus::Declined;
                    participant.completed_at = Some(SystemTime::now());
                    self.store.snapshot_round(round_id, &*round).await?;
                    round.status == RoundStatus::InProgress && round.all_terminal()
                }
                _ => {
                    return Err(RoundError::Conflict(format!(
                        "client {client_id} can no longer decline"
                    )))
                }
            }
        };

        if finalize_needed {
            let manager = Arc::clone(self);
            let round_id = round_id.to_string();
            tokio::spawn(async move { manager.finalize(&round_id).await });
        }
        info!(round_id, client_id, "client declined invitation");
        Ok(())
    }

    /// `uploadModel(roundId, clientId, blob, signature, metrics)`.
    ///
    /// `client_public_key` is `Some` when the client registered its own
    /// signing key, in which case `signature` is verified against it. A
    /// real client cannot produce a signature the coordinator's own public
    /// key would verify (that would require the coordinator's private
    /// key), so when no client key is registered the upload is trusted on
    /// the strength of the per-request bearer-token authentication already
    /// enforced at the `CoordinatorAPI` boundary instead — the
    /// server-keyed policy from spec.md's open question, see DESIGN.md.
    pub async fn upload_model(
        self: &Arc<Self>,
        round_id: &str,
        client_id: &str,
        blob: ModelBlob,
        signature: &[u8],
        metrics: Option<serde_json::Value>,
        client_public_key: Option<&rsa::RsaPublicKey>,
    ) -> Result<(), RoundError> {
        let round_arc = self.round_arc(round_id).await?;
        let bytes = blob.to_bytes();
        if let Some(key) = client_public_key {
            if !CryptoKit::verify_with_key(key, &bytes, signature)? {
                return Err(RoundError::SignatureInvalid);
            }
        }

        let finalize_needed = {
            let mut round = round_arc.lock().await;
            if round.status != RoundStatus::InProgress {
                return Err(RoundError::NotEligible("round is not in progress".into()));
            }
            let participant = round
                .participants
                .get_mut(client_id)
                .ok_or_else(|| RoundError::NotEligible(client_id.to_string()))?;
            if participant.status != ParticipantStatus::Joined {
                return Err(RoundError::NotEligible(format!(
                    "client {client_id} has not joined this round"
                )));
            }

            let ciphertext = self.crypto.encrypt_deterministic(&bytes)?;
            let scope = self.store.open_round_scope(round_id).await?;
            let blob_ref = scope.write_client_upload(client_id, &ciphertext).await?;
            participant.uploaded_blob_ref = Some(blob_ref);
            participant.status = ParticipantStatus::Completed;
            participant.completed_at = Some(SystemTime::now());
            participant.training_metrics = metrics;
            self.store.snapshot_round(round_id, &*round).await?;
            round.all_terminal()
        };

        self.registry.record_participation(client_id).await?;

        if finalize_needed {
            let manager = Arc::clone(self);
            let round_id = round_id.to_string();
            tokio::spawn(async move { manager.finalize(&round_id).await });
        }
        Ok(())
    }

    /// Timeout handler: fires at `startedAt + timeoutSeconds`.
    async fn handle_timeout(self: &Arc<Self>, round_id: &str) -> Result<(), RoundError> {
        let round_arc = self.round_arc(round_id).await?;
        {
            let mut round = round_arc.lock().await;
            if round.status != RoundStatus::InProgress {
                return Ok(());
            }
            for participant in round.participants.values_mut() {
                if !participant.status.is_terminal() {
                    participant.status = ParticipantStatus::TimedOut;
                }
            }
            self.store.snapshot_round(round_id, &*round).await?;
        }
        self.finalize(round_id).await;
        Ok(())
    }

    /// The finalization job. Runs at most once per round: it only acts if
    /// the round is still `inProgress` under its own lock, so a timeout and
    /// a last-upload racing each other never both finalize.
    async fn finalize(self: &Arc<Self>, round_id: &str) {
        if let Err(err) = self.finalize_inner(round_id).await {
            warn!(round_id, %err, "finalization job failed");
        }
    }

    async fn finalize_inner(&self, round_id: &str) -> Result<(), RoundError> {
        let round_arc = self.round_arc(round_id).await?;
        let mut round = round_arc.lock().await;
        if round.status != RoundStatus::InProgress {
            return Ok(());
        }
        round.status = RoundStatus::Aggregating;
        self.store.snapshot_round(round_id, &*round).await?;

        let completed_ids = round.completed_client_ids();
        if completed_ids.len() < round.config.min_clients as usize {
            return self.fail_round(&mut round, round_id).await;
        }

        let mut contributions = Vec::with_capacity(completed_ids.len());
        for client_id in &completed_ids {
            let participant = &round.participants[client_id];
            let blob_ref = participant
                .uploaded_blob_ref
                .clone()
                .expect("a completed participant always has an uploaded blob");
            let ciphertext = self.store.get_blob(&blob_ref).await?;
            let bytes = self.crypto.decrypt(&ciphertext)?;
            let blob = ModelBlob::from_bytes(&bytes).map_err(|e| RoundError::Internal(e.to_string()))?;
            let weight = participant
                .training_metrics
                .as_ref()
                .and_then(|m| m.get("dataSize"))
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            contributions.push(Contribution {
                client_id: client_id.clone(),
                blob,
                weight,
            });
        }

        let aggregated = match combine(&contributions, &round.config.aggregation_strategy) {
            Ok(blob) => blob,
            Err(_) => return self.fail_round(&mut round, round_id).await,
        };

        let eval = self.model_registry.get(&round.model_kind).evaluate(&aggregated);
        let aggregated_bytes = aggregated.to_bytes();
        let scope = self.store.open_round_scope(round_id).await?;
        let aggregated_ref = scope.write_aggregated_model(&aggregated_bytes).await?;
        self.store
            .publish_global_model(&round.model_kind, round.round_number as u32, &aggregated_bytes)
            .await?;

        let results = RoundResults {
            eval,
            contributing_clients: completed_ids,
        };
        self.store.write_metrics(round_id, &results).await?;

        round.aggregated_blob_ref = Some(aggregated_ref);
        round.status = RoundStatus::Completed;
        round.ended_at = Some(SystemTime::now());
        round.results = Some(results.clone());
        self.store.snapshot_round(round_id, &*round).await?;

        self.metric_sink
            .emit(RoundEvent {
                round_id: round_id.to_string(),
                model_id: round.model_id.clone(),
                round_number: round.round_number,
                outcome: RoundOutcome::Completed,
                metrics: serde_json::to_value(&results).unwrap_or_default(),
            })
            .await;
        info!(round_id, "round completed");
        Ok(())
    }

    /// Ids of all rounds not yet in a terminal status.
    async fn non_terminal_round_ids(&self) -> Vec<String> {
        let index = self.index.read().await;
        let mut ids = Vec::new();
        for (id, round_arc) in &index.by_id {
            if !round_arc.lock().await.status.is_terminal() {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Waits up to `grace_period` for every in-flight round to reach a
    /// terminal status on its own, then force-fails whatever is still
    /// running. Called once, from the process shutdown path.
    pub async fn shutdown(self: &Arc<Self>, grace_period: Duration) {
        let deadline = tokio::time::Instant::now() + grace_period;
        loop {
            let pending = self.non_terminal_round_ids().await;
            if pending.is_empty() {
                info!("all rounds reached a terminal status before the shutdown deadline");
                return;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(pending = pending.len(), "aborting in-flight rounds at the shutdown deadline");
                for round_id in pending {
                    let Ok(round_arc) = self.round_arc(&round_id).await else {
                        continue;
                    };
                    let mut round = round_arc.lock().await;
                    if !round.status.is_terminal() {
                        if let Err(err) = self.fail_round(&mut round, &round_id).await {
                            warn!(round_id, %err, "failed to record an aborted round at shutdown");
                        }
                    }
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(200).min(deadline - now)).await;
        }
    }

    async fn fail_round(&self, round: &mut Round, round_id: &str) -> Result<(), RoundError> {
        round.status = RoundStatus::Failed;
        round.ended_at = Some(SystemTime::now());
        self.store.snapshot_round(round_id, &*round).await?;
        self.metric_sink
            .emit(RoundEvent {
                round_id: round_id.to_string(),
                model_id: round.model_id.clone(),
                round_number: round.round_number,
                outcome: RoundOutcome::Failed,
                metrics: serde_json::json!({}),
            })
            .await;
        warn!(round_id, "round failed");
        Ok(())
    }

    /// `getRoundStatus(roundId) → round summary`.
    pub async fn round_snapshot(&self, round_id: &str) -> Result<Round, RoundError> {
        let round_arc = self.round_arc(round_id).await?;
        let round = round_arc.lock().await;
        Ok(round.clone())
    }

    /// `listAvailableRounds(clientId, modelKind?)`: rounds for which this
    /// client currently holds an outstanding invitation.
    pub async fn list_available_rounds(&self, client_id: &str, model_kind: Option<&str>) -> Vec<Round> {
        let index = self.index.read().await;
        let mut available = Vec::new();
        for round_arc in index.by_id.values() {
            let round = round_arc.lock().await;
            if let Some(kind) = model_kind {
                if round.model_kind != kind {
                    continue;
                }
            }
            if let Some(participant) = round.participants.get(client_id) {
                if participant.status == ParticipantStatus::Invited {
                    available.push(round.clone());
                }
            }
        }
        available
    }

    /// `getGlobalModel(modelKind, version?) → blob stream + version`.
    pub async fn global_model(
        &self,
        model_kind: &str,
        version: Option<u32>,
    ) -> Result<Option<(u32, Vec<u8>)>, RoundError> {
        Ok(self.store.read_global_model(model_kind, version).await?)
    }
}
