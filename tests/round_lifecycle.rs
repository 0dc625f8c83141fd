//! End-to-end round-lifecycle tests, one per scenario in spec.md §8.
use std::{sync::Arc, time::Duration};

use mosaic_coordinator::{
    core::{
        aggregator::{registry::ModelKindRegistry, AggregationStrategy},
        model::ModelBlob,
    },
    crypto::CryptoKit,
    db::ModelStore,
    metrics::MetricSink,
    registry::{ClientRegistry, DeviceProfile},
    round::{manager::RoundManager, ParticipantStatus, RoundConfig, RoundStatus, SelectionStrategy},
};

struct Harness {
    _dir: tempfile::TempDir,
    crypto: Arc<CryptoKit>,
    clients: Arc<ClientRegistry>,
    rounds: Arc<RoundManager>,
}

fn profile() -> DeviceProfile {
    DeviceProfile {
        has_accelerator: false,
        accelerator_count: 0,
        os_tag: "linux".into(),
    }
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = ModelStore::new(dir.path());
    let crypto = Arc::new(CryptoKit::generate_keys(dir.path().join("keys")).unwrap());
    let clients = Arc::new(ClientRegistry::new(Duration::from_secs(3600)));
    let rounds = Arc::new(RoundManager::new(
        store,
        clients.clone(),
        crypto.clone(),
        ModelKindRegistry::default(),
        Arc::new(MetricSink::new(None)),
    ));
    Harness {
        _dir: dir,
        crypto,
        clients,
        rounds,
    }
}

fn config(min_clients: u32, max_clients: u32, timeout_seconds: u64, strategy: AggregationStrategy) -> RoundConfig {
    RoundConfig {
        min_clients,
        max_clients,
        timeout_seconds,
        aggregation_strategy: strategy,
        selection_strategy: SelectionStrategy::Random,
        hyperparameters: serde_json::Map::new(),
    }
}

async fn upload(h: &Harness, round_id: &str, client_id: &str, values: Vec<f64>, data_size: Option<f64>) {
    let mut blob = ModelBlob::empty("m1");
    blob.parameters
        .insert("w".to_string(), mosaic_coordinator::core::model::Tensor::vector(values));
    let bytes = blob.to_bytes();
    let signature = h.crypto.sign(&bytes).unwrap();
    let metrics = data_size.map(|d| serde_json::json!({ "dataSize": d }));
    h.rounds
        .upload_model(round_id, client_id, blob, &signature, metrics, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn scenario_a_happy_path_uniform_mean() {
    let h = harness().await;
    h.clients.register("c1", "m1", profile()).await;
    h.clients.register("c2", "m1", profile()).await;

    let round_id = h
        .rounds
        .create_round("model-a", "m1", 1, config(2, 2, 60, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();

    h.rounds.join(&round_id, "c1").await.unwrap();
    h.rounds.join(&round_id, "c2").await.unwrap();
    upload(&h, &round_id, "c1", vec![1.0, 3.0], None).await;
    upload(&h, &round_id, "c2", vec![3.0, 5.0], None).await;

    // Finalization is spawned off the last upload; give it a moment.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Completed);
    for id in ["c1", "c2"] {
        assert_eq!(round.participants[id].status, ParticipantStatus::Completed);
        assert_eq!(h.clients.get(id).await.unwrap().rounds_participated, 1);
    }

    let aggregated_ref = round.aggregated_blob_ref.unwrap();
    let bytes = mosaic_coordinator::db::ModelStore::new(h._dir.path())
        .get_blob(&aggregated_ref)
        .await
        .unwrap();
    let aggregated = ModelBlob::from_bytes(&bytes).unwrap();
    assert_eq!(aggregated.parameters["w"].values, vec![2.0, 4.0]);
}

#[tokio::test]
async fn scenario_b_size_weighted_aggregation() {
    let h = harness().await;
    h.clients.register("c1", "m1", profile()).await;
    h.clients.register("c2", "m1", profile()).await;

    let round_id = h
        .rounds
        .create_round("model-b", "m1", 1, config(2, 2, 60, AggregationStrategy::SizeWeightedMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();
    h.rounds.join(&round_id, "c1").await.unwrap();
    h.rounds.join(&round_id, "c2").await.unwrap();
    upload(&h, &round_id, "c1", vec![0.0], Some(10.0)).await;
    upload(&h, &round_id, "c2", vec![4.0], Some(30.0)).await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Completed);
    let aggregated_ref = round.aggregated_blob_ref.unwrap();
    let bytes = mosaic_coordinator::db::ModelStore::new(h._dir.path())
        .get_blob(&aggregated_ref)
        .await
        .unwrap();
    let aggregated = ModelBlob::from_bytes(&bytes).unwrap();
    assert_eq!(aggregated.parameters["w"].values, vec![3.0]);
}

#[tokio::test]
async fn scenario_c_timeout_with_partial_completion() {
    let h = harness().await;
    for id in ["c1", "c2", "c3"] {
        h.clients.register(id, "m1", profile()).await;
    }

    let round_id = h
        .rounds
        .create_round("model-c", "m1", 1, config(2, 3, 1, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();

    h.rounds.join(&round_id, "c1").await.unwrap();
    h.rounds.join(&round_id, "c2").await.unwrap();
    upload(&h, &round_id, "c1", vec![1.0], None).await;
    upload(&h, &round_id, "c2", vec![3.0], None).await;
    // c3 never joins; the timeout handler spawned by start_round fires at 1s.

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Completed);
    assert_eq!(round.participants["c3"].status, ParticipantStatus::TimedOut);
    assert_eq!(
        round.results.unwrap().contributing_clients,
        vec!["c1".to_string(), "c2".to_string()]
    );
}

#[tokio::test]
async fn scenario_d_timeout_below_quorum_fails() {
    let h = harness().await;
    for id in ["c1", "c2", "c3"] {
        h.clients.register(id, "m1", profile()).await;
    }

    let round_id = h
        .rounds
        .create_round("model-d", "m1", 1, config(3, 3, 1, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();

    h.rounds.join(&round_id, "c1").await.unwrap();
    upload(&h, &round_id, "c1", vec![1.0], None).await;
    // c2, c3 never upload.

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
    assert!(round.aggregated_blob_ref.is_none());
}

#[tokio::test]
async fn scenario_e_schema_mismatch_fails_round_but_keeps_uploads() {
    let h = harness().await;
    h.clients.register("c1", "m1", profile()).await;
    h.clients.register("c2", "m1", profile()).await;

    let round_id = h
        .rounds
        .create_round("model-e", "m1", 1, config(2, 2, 60, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();
    h.rounds.join(&round_id, "c1").await.unwrap();
    h.rounds.join(&round_id, "c2").await.unwrap();

    let mut b1 = ModelBlob::empty("m1");
    b1.parameters
        .insert("A".into(), mosaic_coordinator::core::model::Tensor::vector(vec![1.0]));
    b1.parameters
        .insert("B".into(), mosaic_coordinator::core::model::Tensor::vector(vec![1.0]));
    let sig1 = h.crypto.sign(&b1.to_bytes()).unwrap();
    h.rounds
        .upload_model(&round_id, "c1", b1, &sig1, None, None)
        .await
        .unwrap();

    let mut b2 = ModelBlob::empty("m1");
    b2.parameters
        .insert("A".into(), mosaic_coordinator::core::model::Tensor::vector(vec![1.0]));
    b2.parameters
        .insert("C".into(), mosaic_coordinator::core::model::Tensor::vector(vec![1.0]));
    let sig2 = h.crypto.sign(&b2.to_bytes()).unwrap();
    h.rounds
        .upload_model(&round_id, "c2", b2, &sig2, None, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
    assert!(round.participants["c1"].uploaded_blob_ref.is_some());
    assert!(round.participants["c2"].uploaded_blob_ref.is_some());
}

#[tokio::test]
async fn upload_with_invalid_signature_is_rejected_and_state_unchanged() {
    let h = harness().await;
    h.clients.register("c1", "m1", profile()).await;
    h.clients.register("c2", "m1", profile()).await;

    let round_id = h
        .rounds
        .create_round("model-f", "m1", 1, config(2, 2, 60, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();
    h.rounds.join(&round_id, "c1").await.unwrap();

    let mut blob = ModelBlob::empty("m1");
    blob.parameters
        .insert("w".into(), mosaic_coordinator::core::model::Tensor::vector(vec![1.0]));
    let bogus_signature = vec![0u8; 256];
    // A registered client key makes the signature actually checked; without
    // one the coordinator trusts the upload on the strength of the request's
    // bearer auth instead (see DESIGN.md).
    let client_key = h.crypto.public_key().unwrap();
    let result = h
        .rounds
        .upload_model(&round_id, "c1", blob, &bogus_signature, None, Some(&client_key))
        .await;
    assert!(result.is_err());

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.participants["c1"].status, ParticipantStatus::Joined);
}

#[tokio::test]
async fn join_is_idempotent_once_joined() {
    let h = harness().await;
    h.clients.register("c1", "m1", profile()).await;
    h.clients.register("c2", "m1", profile()).await;

    let round_id = h
        .rounds
        .create_round("model-g", "m1", 1, config(2, 2, 60, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();

    let first = h.rounds.join(&round_id, "c1").await.unwrap();
    let second = h.rounds.join(&round_id, "c1").await.unwrap();
    assert_eq!(first, second);

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.participants["c1"].status, ParticipantStatus::Joined);
}

#[tokio::test]
async fn decline_removes_client_from_round_but_lets_it_proceed() {
    let h = harness().await;
    for id in ["c1", "c2", "c3"] {
        h.clients.register(id, "m1", profile()).await;
    }

    let round_id = h
        .rounds
        .create_round("model-h", "m1", 1, config(2, 3, 60, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.decline(&round_id, "c3").await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();

    h.rounds.join(&round_id, "c1").await.unwrap();
    h.rounds.join(&round_id, "c2").await.unwrap();
    upload(&h, &round_id, "c1", vec![1.0], None).await;
    upload(&h, &round_id, "c2", vec![3.0], None).await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Completed);
    assert_eq!(round.participants["c3"].status, ParticipantStatus::Declined);

    // c3 is no longer eligible to join or upload after declining.
    assert!(h.rounds.join(&round_id, "c3").await.is_err());
}

#[tokio::test]
async fn decline_is_rejected_once_client_has_joined() {
    let h = harness().await;
    h.clients.register("c1", "m1", profile()).await;
    h.clients.register("c2", "m1", profile()).await;

    let round_id = h
        .rounds
        .create_round("model-i", "m1", 1, config(2, 2, 60, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();
    h.rounds.join(&round_id, "c1").await.unwrap();

    assert!(h.rounds.decline(&round_id, "c1").await.is_err());
}

#[tokio::test]
async fn client_uploads_are_encrypted_at_rest() {
    let h = harness().await;
    h.clients.register("c1", "m1", profile()).await;
    h.clients.register("c2", "m1", profile()).await;

    let round_id = h
        .rounds
        .create_round("model-j", "m1", 1, config(2, 2, 60, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();
    h.rounds.join(&round_id, "c1").await.unwrap();
    h.rounds.join(&round_id, "c2").await.unwrap();
    upload(&h, &round_id, "c1", vec![1.0, 3.0], None).await;
    upload(&h, &round_id, "c2", vec![3.0, 5.0], None).await;

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    let blob_ref = round.participants["c1"].uploaded_blob_ref.clone().unwrap();
    let store = mosaic_coordinator::db::ModelStore::new(h._dir.path());
    let stored_bytes = store.get_blob(&blob_ref).await.unwrap();

    let mut plain_blob = ModelBlob::empty("m1");
    plain_blob
        .parameters
        .insert("w".to_string(), mosaic_coordinator::core::model::Tensor::vector(vec![1.0, 3.0]));
    let plaintext = plain_blob.to_bytes();
    assert_ne!(stored_bytes, plaintext, "upload must not be stored as plaintext");

    let decrypted = h.crypto.decrypt(&stored_bytes).unwrap();
    assert_eq!(decrypted, plaintext);

    // Re-uploading identical bytes in a fresh round still dedupes: the
    // deterministic nonce keeps the ciphertext (and its content ref) stable.
    let round_id2 = h
        .rounds
        .create_round("model-j2", "m1", 1, config(1, 2, 60, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id2).await.unwrap();
    h.rounds.start_round(&round_id2).await.unwrap();
    h.rounds.join(&round_id2, "c1").await.unwrap();
    upload(&h, &round_id2, "c1", vec![1.0, 3.0], None).await;
    let round2 = h.rounds.round_snapshot(&round_id2).await.unwrap();
    assert_eq!(
        round2.participants["c1"].uploaded_blob_ref,
        Some(blob_ref),
        "identical plaintext uploads must dedupe to the same content ref"
    );
}

#[tokio::test]
async fn shutdown_aborts_in_flight_rounds_past_the_grace_period() {
    let h = harness().await;
    h.clients.register("c1", "m1", profile()).await;
    h.clients.register("c2", "m1", profile()).await;

    let round_id = h
        .rounds
        .create_round("model-k", "m1", 1, config(2, 2, 3600, AggregationStrategy::UniformMean))
        .await
        .unwrap();
    h.rounds.select_clients(&round_id).await.unwrap();
    h.rounds.start_round(&round_id).await.unwrap();
    h.rounds.join(&round_id, "c1").await.unwrap();
    // c2 never joins or uploads; the round is still inProgress.

    h.rounds.shutdown(Duration::from_millis(100)).await;

    let round = h.rounds.round_snapshot(&round_id).await.unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
}
