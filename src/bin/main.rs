//! Mosaic Coordinator server.
//!
//! Entry point: loads settings, generates or loads key material, wires the
//! storage/registry/round components, and serves the REST API until
//! signaled to stop.
use std::{path::PathBuf, process, sync::Arc};

use mosaic_coordinator::{
    api::{self, CoordinatorState},
    core::aggregator::registry::ModelKindRegistry,
    crypto::CryptoKit,
    db::ModelStore,
    metrics::MetricSink,
    registry::ClientRegistry,
    round::manager::RoundManager,
    settings::Settings,
};
use structopt::StructOpt;
use tokio::{signal, sync::Semaphore};
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, StructOpt)]
struct Cli {
    #[structopt(short, parse(from_os_str))]
    config_path: Option<PathBuf>,
}

fn main() {
    let cli = Cli::from_args();

    let settings = Settings::new(cli.config_path).unwrap_or_else(|error| {
        eprintln!("{error}");
        process::exit(4);
    });

    // The worker pool size is a deploy-time setting, so the runtime is built
    // by hand instead of via `#[tokio::main]`'s fixed sizing.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.api.worker_pool_size)
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("failed to build tokio runtime: {err}");
            process::exit(5);
        });
    runtime.block_on(run(settings));
}

async fn run(settings: Settings) {
    let Settings {
        api: api_settings,
        round: round_defaults,
        storage,
        security,
        log,
    } = settings;

    let _ = FmtSubscriber::builder().with_env_filter(log.filter).with_ansi(true).try_init();

    let storage_root = PathBuf::from(&storage.root_dir);
    if let Err(err) = std::fs::create_dir_all(&storage_root) {
        eprintln!("failed to create storage root {storage_root:?}: {err}");
        process::exit(3);
    }

    let keys_dir = storage_root.join("keys");
    let crypto = match CryptoKit::generate_keys(&keys_dir) {
        Ok(crypto) => Arc::new(crypto),
        Err(err) => {
            eprintln!("key initialization failed: {err}");
            process::exit(1);
        }
    };
    if security.enabled && crypto.public_key().is_err() {
        eprintln!("security is enabled but no keys are available");
        process::exit(1);
    }

    let store = ModelStore::new(&storage_root);
    let clients = Arc::new(ClientRegistry::new(std::time::Duration::from_secs(
        security.client_staleness_seconds,
    )));
    let metric_sink = Arc::new(MetricSink::new(security.metric_sink_endpoint));
    let rounds = Arc::new(RoundManager::new(
        store.clone(),
        clients.clone(),
        crypto.clone(),
        ModelKindRegistry::default(),
        metric_sink,
    ));
    info!(
        min_clients = round_defaults.min_clients,
        max_clients = round_defaults.max_clients,
        "coordinator ready"
    );

    let state = CoordinatorState {
        rounds: rounds.clone(),
        clients,
        crypto,
        store,
        require_auth: security.enabled,
        request_slots: Arc::new(Semaphore::new(api_settings.request_queue_capacity)),
    };

    tokio::select! {
        biased;

        _ = signal::ctrl_c() => {
            info!("received shutdown signal, draining in-flight rounds");
            rounds
                .shutdown(std::time::Duration::from_secs(api_settings.shutdown_grace_period_seconds))
                .await;
        }
        _ = api::serve(state, api_settings.bind_address) => {
            warn!("rest api server terminated unexpectedly");
            process::exit(2);
        }
    }
}
