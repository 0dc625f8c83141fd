//! `CoordinatorAPI`: the external request boundary. Validates inbound
//! fields, authenticates bearer tokens via `CryptoKit`, and routes to
//! `RoundManager` / `ClientRegistry`. Grounded in the teacher's
//! `rest::serve` / `with_fetcher` warp-filter style, generalized from a
//! single stats endpoint to the full wire protocol of spec §6.
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use warp::{http::StatusCode, reply::Reply, Filter};

use crate::{
    core::model::ModelBlob,
    crypto::CryptoKit,
    db::ModelStore,
    error::CoordinatorError,
    registry::{ClientRegistry, DeviceProfile},
    round::{manager::RoundManager, ParticipantStatus, Round, RoundConfig, RoundStatus},
};

/// Shared state handed to every handler; cheap to clone (everything behind
/// an `Arc` or already `Clone`).
#[derive(Clone)]
pub struct CoordinatorState {
    pub rounds: Arc<RoundManager>,
    pub clients: Arc<ClientRegistry>,
    pub crypto: Arc<CryptoKit>,
    pub store: ModelStore,
    /// Deploy-time switch: when `false`, the bearer-token check is skipped
    /// entirely (used for local development / tests).
    pub require_auth: bool,
    /// Bounds the number of requests handled concurrently; a request that
    /// can't claim a permit is rejected with a retryable error instead of
    /// queuing unboundedly.
    pub request_slots: Arc<Semaphore>,
}

/// Wraps [`CoordinatorError`] so it can travel through warp's rejection
/// machinery and be mapped back onto its §7 status class.
#[derive(Debug)]
struct ApiRejection(CoordinatorError);
impl warp::reject::Reject for ApiRejection {}

fn reject(err: impl Into<CoordinatorError>) -> warp::Rejection {
    warp::reject::custom(ApiRejection(err.into()))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

async fn handle_rejection(err: warp::Rejection) -> Result<impl Reply, Infallible> {
    if let Some(ApiRejection(e)) = err.find() {
        let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Ok(warp::reply::with_status(warp::reply::json(&ErrorBody { error: e.to_string() }), status));
    }
    if err.is_not_found() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorBody { error: "not found".into() }),
            StatusCode::NOT_FOUND,
        ));
    }
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody { error: "malformed request".into() }),
        StatusCode::BAD_REQUEST,
    ))
}

fn with_state(
    state: CoordinatorState,
) -> impl Filter<Extract = (CoordinatorState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Extracts and verifies the bearer token. A no-op returning a synthetic
/// claim when `require_auth` is disabled.
async fn authenticate(
    state: CoordinatorState,
    header: Option<String>,
) -> Result<(), warp::Rejection> {
    if !state.require_auth {
        return Ok(());
    }
    let header = header.ok_or_else(|| reject(CoordinatorError::Unauthorized("missing bearer token".into())))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| reject(CoordinatorError::Unauthorized("malformed authorization header".into())))?;
    state.crypto.verify_token(token).map_err(reject)?;
    Ok(())
}

fn with_auth(
    state: CoordinatorState,
) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    with_state(state)
        .and(warp::header::optional::<String>("authorization"))
        .and_then(authenticate)
        .untuple_one()
}

/// Claims a request slot out of `state.request_slots`, rejecting with a
/// retryable error when the bounded queue is already full. The returned
/// permit is held until the wrapped filter's response is produced.
fn with_capacity(
    state: CoordinatorState,
) -> impl Filter<Extract = (tokio::sync::OwnedSemaphorePermit,), Error = warp::Rejection> + Clone {
    warp::any().and_then(move || {
        let slots = state.request_slots.clone();
        async move {
            slots
                .try_acquire_owned()
                .map_err(|_| reject(CoordinatorError::Transient("coordinator request queue is full".into())))
        }
    })
}

#[derive(Debug, Serialize)]
struct Ack {
    ok: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    client_id: String,
    model_kind: String,
    device_profile: DeviceProfile,
}

async fn register_handler(req: RegisterRequest, state: CoordinatorState) -> Result<impl Reply, Infallible> {
    state
        .clients
        .register(&req.client_id, &req.model_kind, req.device_profile)
        .await;
    Ok(warp::reply::json(&Ack { ok: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAvailableRoundsQuery {
    client_id: String,
    model_kind: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AvailableRound {
    round_id: String,
    model_kind: String,
    round_number: u64,
    invited_at: Option<std::time::SystemTime>,
}

async fn list_available_rounds_handler(
    query: ListAvailableRoundsQuery,
    state: CoordinatorState,
) -> Result<impl Reply, Infallible> {
    let rounds = state
        .rounds
        .list_available_rounds(&query.client_id, query.model_kind.as_deref())
        .await;
    let summaries: Vec<AvailableRound> = rounds
        .iter()
        .map(|r| AvailableRound {
            round_id: r.id.clone(),
            model_kind: r.model_kind.clone(),
            round_number: r.round_number,
            invited_at: r.participants.get(&query.client_id).map(|p| p.invited_at),
        })
        .collect();
    Ok(warp::reply::json(&summaries))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoundRequest {
    model_id: String,
    model_kind: String,
    round_number: u64,
    config: RoundConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoundResponse {
    round_id: String,
}

async fn create_round_handler(
    req: CreateRoundRequest,
    state: CoordinatorState,
) -> Result<impl Reply, warp::Rejection> {
    let round_id = state
        .rounds
        .create_round(&req.model_id, &req.model_kind, req.round_number, req.config)
        .await
        .map_err(reject)?;
    state.rounds.select_clients(&round_id).await.map_err(reject)?;
    info!(round_id = %round_id, "round created and clients selected");
    Ok(warp::reply::json(&CreateRoundResponse { round_id }))
}

async fn start_round_handler(
    round_id: String,
    state: CoordinatorState,
) -> Result<impl Reply, warp::Rejection> {
    state.rounds.start_round(&round_id).await.map_err(reject)?;
    Ok(warp::reply::json(&Ack { ok: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoundRequest {
    client_id: String,
}

async fn join_round_handler(
    round_id: String,
    req: JoinRoundRequest,
    state: CoordinatorState,
) -> Result<impl Reply, warp::Rejection> {
    let blob_ref = state.rounds.join(&round_id, &req.client_id).await.map_err(reject)?;
    let bytes = state.store.get_blob(&blob_ref).await.map_err(|e| reject(CoordinatorError::from(e)))?;
    Ok(warp::http::Response::builder()
        .header("content-type", "application/octet-stream")
        .body(bytes)
        .unwrap())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadModelRequest {
    client_id: String,
    blob: ModelBlob,
    signature_b64: String,
    metrics: Option<serde_json::Value>,
    client_public_key_pem: Option<String>,
}

async fn upload_model_handler(
    round_id: String,
    req: UploadModelRequest,
    state: CoordinatorState,
) -> Result<impl Reply, warp::Rejection> {
    let signature = STANDARD
        .decode(req.signature_b64)
        .map_err(|e| reject(CoordinatorError::Validation(e.to_string())))?;
    let client_key = match req.client_public_key_pem {
        Some(pem) => Some(
            rsa::RsaPublicKey::from_public_key_pem(&pem)
                .map_err(|e| reject(CoordinatorError::Validation(e.to_string())))?,
        ),
        None => None,
    };

    state
        .rounds
        .upload_model(
            &round_id,
            &req.client_id,
            req.blob,
            &signature,
            req.metrics,
            client_key.as_ref(),
        )
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&Ack { ok: true }))
}

async fn decline_round_handler(
    round_id: String,
    req: JoinRoundRequest,
    state: CoordinatorState,
) -> Result<impl Reply, warp::Rejection> {
    state.rounds.decline(&round_id, &req.client_id).await.map_err(reject)?;
    Ok(warp::reply::json(&Ack { ok: true }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RoundStatusResponse {
    round_id: String,
    model_id: String,
    model_kind: String,
    round_number: u64,
    status: RoundStatus,
    participants_completed: usize,
    participants_total: usize,
}

impl From<&Round> for RoundStatusResponse {
    fn from(round: &Round) -> Self {
        Self {
            round_id: round.id.clone(),
            model_id: round.model_id.clone(),
            model_kind: round.model_kind.clone(),
            round_number: round.round_number,
            status: round.status,
            participants_completed: round
                .participants
                .values()
                .filter(|p| p.status == ParticipantStatus::Completed)
                .count(),
            participants_total: round.participants.len(),
        }
    }
}

async fn get_round_status_handler(
    round_id: String,
    state: CoordinatorState,
) -> Result<impl Reply, warp::Rejection> {
    let round = state.rounds.round_snapshot(&round_id).await.map_err(reject)?;
    Ok(warp::reply::json(&RoundStatusResponse::from(&round)))
}

#[derive(Debug, Deserialize)]
struct GetGlobalModelQuery {
    version: Option<u32>,
}

async fn get_global_model_handler(
    model_kind: String,
    query: GetGlobalModelQuery,
    state: CoordinatorState,
) -> Result<impl Reply, warp::Rejection> {
    let found = state
        .rounds
        .global_model(&model_kind, query.version)
        .await
        .map_err(reject)?;
    let (version, bytes) =
        found.ok_or_else(|| reject(CoordinatorError::NotFound(format!("no global model for {model_kind}"))))?;
    Ok(warp::http::Response::builder()
        .header("content-type", "application/octet-stream")
        .header("x-model-version", version.to_string())
        .body(bytes)
        .unwrap())
}

async fn healthz_handler(state: CoordinatorState) -> Result<impl Reply, Infallible> {
    let keys_ready = state.crypto.public_key().is_ok();
    let storage_ready = tokio::fs::metadata(state.store.root()).await.is_ok();
    if keys_ready && storage_ready {
        Ok(warp::reply::with_status(warp::reply::json(&Ack { ok: true }), StatusCode::OK))
    } else {
        warn!(keys_ready, storage_ready, "healthz check failing");
        Ok(warp::reply::with_status(
            warp::reply::json(&Ack { ok: false }),
            StatusCode::SERVICE_UNAVAILABLE,
        ))
    }
}

/// Builds the full set of warp routes backed by `state`.
pub fn routes(state: CoordinatorState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let healthz = warp::path("healthz")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(healthz_handler);

    let register = warp::path("register")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(register_handler);

    let list_available_rounds = warp::path("rounds")
        .and(warp::get())
        .and(warp::query::<ListAvailableRoundsQuery>())
        .and(with_state(state.clone()))
        .and_then(list_available_rounds_handler);

    let create_round = warp::path("rounds")
        .and(warp::post())
        .and(with_auth(state.clone()))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(create_round_handler);

    let start_round = warp::path!("rounds" / String / "start")
        .and(warp::post())
        .and(with_auth(state.clone()))
        .and(with_state(state.clone()))
        .and_then(start_round_handler);

    let join_round = warp::path!("rounds" / String / "join")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(join_round_handler);

    let upload_model = warp::path!("rounds" / String / "upload")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(upload_model_handler);

    let round_status = warp::path!("rounds" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_round_status_handler);

    let global_model = warp::path!("models" / String)
        .and(warp::get())
        .and(warp::query::<GetGlobalModelQuery>())
        .and(with_state(state.clone()))
        .and_then(get_global_model_handler);

    let decline = warp::path!("rounds" / String / "decline")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(decline_round_handler);

    let api = healthz
        .or(register)
        .or(create_round)
        .or(start_round)
        .or(join_round)
        .or(upload_model)
        .or(decline)
        .or(list_available_rounds)
        .or(round_status)
        .or(global_model);

    with_capacity(state)
        .and(api)
        .map(|_permit, reply| reply)
        .recover(handle_rejection)
}

/// Runs the REST server until the process is signaled to stop.
pub async fn serve(state: CoordinatorState, addr: SocketAddr) {
    let routes = routes(state).with(warp::log("mosaic_coordinator::api"));
    warp::serve(routes).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::aggregator::registry::ModelKindRegistry, metrics::MetricSink};
    use std::time::Duration;

    async fn test_state() -> (tempfile::TempDir, CoordinatorState) {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let crypto = Arc::new(CryptoKit::generate_keys(dir.path().join("keys")).unwrap());
        let clients = Arc::new(ClientRegistry::new(Duration::from_secs(3600)));
        let rounds = Arc::new(RoundManager::new(
            store.clone(),
            clients.clone(),
            crypto.clone(),
            ModelKindRegistry::default(),
            Arc::new(MetricSink::new(None)),
        ));
        (
            dir,
            CoordinatorState {
                rounds,
                clients,
                crypto,
                store,
                require_auth: false,
                request_slots: Arc::new(Semaphore::new(64)),
            },
        )
    }

    #[tokio::test]
    async fn healthz_reports_ready_once_keys_exist() {
        let (_dir, state) = test_state().await;
        let filter = routes(state);
        let resp = warp::test::request().method("GET").path("/healthz").reply(&filter).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn request_queue_rejects_once_full() {
        let (_dir, mut state) = test_state().await;
        state.request_slots = Arc::new(Semaphore::new(0));
        let filter = routes(state);
        let resp = warp::test::request().method("GET").path("/healthz").reply(&filter).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn register_then_create_round_round_trips() {
        let (_dir, state) = test_state().await;
        let filter = routes(state);

        let register_body = serde_json::json!({
            "clientId": "c1",
            "modelKind": "m1",
            "deviceProfile": {"hasAccelerator": false, "acceleratorCount": 0, "osTag": "linux"},
        });
        let resp = warp::test::request()
            .method("POST")
            .path("/register")
            .json(&register_body)
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let create_body = serde_json::json!({
            "modelId": "model-a",
            "modelKind": "m1",
            "roundNumber": 1,
            "config": {
                "minClients": 1,
                "maxClients": 1,
                "timeoutSeconds": 60,
                "aggregationStrategy": {"kind": "uniformMean"},
                "selectionStrategy": "random",
            }
        });
        let resp = warp::test::request()
            .method("POST")
            .path("/rounds")
            .json(&create_body)
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
