//! Oxygen validator node.
//!
//! Wiring order: storage → state machine → admission → consensus adapter →
//! mesh bridge → REST.  A root cancellation token fans out to every loop;
//! SIGINT/SIGTERM cancels it and the process exits 0 after a final flush.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oxygen::config::Config;
use oxygen::consensus::adapter::{ConsensusAdapter, HealthFlags};
use oxygen::consensus::app::App;
use oxygen::consensus::validators::ValidatorSet;
use oxygen::mempool::AdmissionController;
use oxygen::metrics::Metrics;
use oxygen::net::mesh::{MeshBridge, MeshPublisher};
use oxygen::net::QueryHandler;
use oxygen::rpc::{self, ApiState};
use oxygen::storage::ChainDb;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    init_logging(&config);
    info!(
        chain_id = %config.chain_id,
        data_dir = %config.data_dir.display(),
        "oxygen node starting"
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let db = Arc::new(ChainDb::open(&config.data_dir)?);
    let metrics = Arc::new(Metrics::new());
    let health = Arc::new(HealthFlags::default());

    let validators = Arc::new(Mutex::new(
        ValidatorSet::open(db.clone()).map_err(|e| anyhow::anyhow!("validator set: {e}"))?,
    ));
    let app = Arc::new(Mutex::new(App::open(
        db.clone(),
        validators,
        metrics.clone(),
        config.chain_id.clone(),
    )?));
    let admission = Arc::new(AdmissionController::new(db.clone(), metrics.clone()));

    let adapter =
        ConsensusAdapter::bootstrap(&config, app.clone(), admission.clone(), health.clone())?;
    let node_id = adapter.proposer().to_hex();

    let cancel = CancellationToken::new();

    // Consensus driver; startup fails hard if the chain cannot initialize.
    let driver_handle = adapter.start(cancel.clone())?;

    // Rate-limiter sweep.
    tokio::spawn(admission.clone().run_sweeper(cancel.clone()));

    // Mesh bridge + query handler.
    let (publisher, outbound_rx) = MeshPublisher::channel(node_id);
    let query = Arc::new(QueryHandler::new(db.clone(), publisher.clone(), metrics.clone()));
    let mesh = MeshBridge::new(
        config.mesh_endpoint.clone(),
        outbound_rx,
        publisher.clone(),
        admission.clone(),
        query,
        db.clone(),
        metrics.clone(),
        health.clone(),
    );
    tokio::spawn(mesh.run(cancel.clone()));

    // REST surface.
    if config.api_enabled {
        let api_state = ApiState {
            db: db.clone(),
            admission: admission.clone(),
            metrics: metrics.clone(),
            health: health.clone(),
            publisher: Some(publisher),
            chain_id: config.chain_id.clone(),
        };
        let addr = config.api_addr();
        let api_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc::serve(addr, api_state, api_cancel).await {
                error!(error = %e, "REST server exited");
            }
        });
    }

    wait_for_shutdown(&cancel).await;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = driver_handle.await;
    db.flush()?;
    info!("oxygen node stopped");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on SIGINT or SIGTERM, or when a fatal error cancels the root
/// token first.
async fn wait_for_shutdown(cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = cancel.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = cancel.cancelled() => {}
        }
    }
}
