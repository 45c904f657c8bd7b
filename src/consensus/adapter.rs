//! Consensus adapter: owns the driver lifecycle and the node's key material.
//!
//! On first boot it generates the Ed25519 validator key, a node identity
//! key, and a minimal genesis document under the data dir.  The BFT driver
//! itself is external; [`LocalDriver`] is the in-process stand-in that honors
//! the callback contract — one writer thread, `commit(h)` strictly before
//! `begin_block(h+1)` — and orders transactions from the mempool.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::consensus::app::App;
use crate::consensus::{Application, BlockHeaderInfo, Genesis, GenesisValidator};
use crate::crypto::ed25519::{self, Ed25519Keypair};
use crate::error::ChainError;
use crate::mempool::AdmissionController;
use crate::types::{keccak256, Address};

const DEFAULT_BLOCK_INTERVAL: Duration = Duration::from_millis(1000);
const MAX_TXS_PER_BLOCK: usize = 1000;
const GENESIS_SELF_STAKE: u128 = 1_000_000_000_000_000_000;

/// Liveness flags read by the REST health endpoint.
#[derive(Default)]
pub struct HealthFlags {
    pub driver_ready: AtomicBool,
    pub mesh_connected: AtomicBool,
}

impl HealthFlags {
    /// healthy | degraded | unhealthy, in REST terms.
    pub fn status(&self) -> &'static str {
        if !self.driver_ready.load(Ordering::Relaxed) {
            "unhealthy"
        } else if !self.mesh_connected.load(Ordering::Relaxed) {
            "degraded"
        } else {
            "healthy"
        }
    }
}

pub struct ConsensusAdapter {
    app: Arc<Mutex<App>>,
    admission: Arc<AdmissionController>,
    genesis: Genesis,
    validator_key: Ed25519Keypair,
    proposer: Address,
    block_interval: Duration,
    health: Arc<HealthFlags>,
}

impl ConsensusAdapter {
    /// Load or create key material and the genesis document, then wire the
    /// application in.  Fails fatally if the data dir is unusable.
    pub fn bootstrap(
        config: &Config,
        app: Arc<Mutex<App>>,
        admission: Arc<AdmissionController>,
        health: Arc<HealthFlags>,
    ) -> Result<Self, ChainError> {
        let keys_dir = config.data_dir.join("keys");
        let validator_key = ed25519::load_or_generate(&keys_dir.join("validator.key"))
            .map_err(|e| ChainError::StorageCorrupt(format!("validator key: {e}")))?;
        // The node identity key is distinct from the consensus key; peers
        // address this node by it on the mesh.
        let _node_key = ed25519::load_or_generate(&keys_dir.join("node.key"))
            .map_err(|e| ChainError::StorageCorrupt(format!("node key: {e}")))?;

        let proposer = match Address::from_hex(&config.validator_addr) {
            Some(addr) => addr,
            None => derive_node_address(&validator_key),
        };

        let genesis = load_or_create_genesis(
            &config.data_dir.join("genesis.json"),
            &config.chain_id,
            proposer,
            &validator_key,
        )?;

        info!(proposer = %proposer, chain_id = %config.chain_id, "consensus adapter bootstrapped");
        Ok(Self {
            app,
            admission,
            genesis,
            validator_key,
            proposer,
            block_interval: DEFAULT_BLOCK_INTERVAL,
            health,
        })
    }

    pub fn proposer(&self) -> Address {
        self.proposer
    }

    pub fn validator_pubkey(&self) -> [u8; 32] {
        self.validator_key.public_key()
    }

    #[cfg(test)]
    pub fn set_block_interval(&mut self, interval: Duration) {
        self.block_interval = interval;
    }

    /// Initialize the chain (driver handshake) and spawn the block-production
    /// loop.  Returns once the driver is healthy; a fatal error here aborts
    /// startup.
    pub fn start(self, cancel: CancellationToken) -> Result<tokio::task::JoinHandle<()>, ChainError> {
        {
            let mut app = self.app.lock();
            let app_info = app.info();
            if app_info.last_height == 0 {
                let updates = app.init_chain(&self.genesis)?;
                info!(validators = updates.len(), "chain initialized from genesis");
            } else {
                info!(
                    height = app_info.last_height,
                    app_hash = %app_info.app_hash,
                    "resuming committed chain"
                );
            }
        }
        self.health.driver_ready.store(true, Ordering::Relaxed);

        let driver = LocalDriver {
            app: self.app,
            admission: self.admission,
            proposer: self.proposer,
            interval: self.block_interval,
            health: self.health,
        };
        Ok(tokio::spawn(driver.run(cancel)))
    }
}

/// In-process block producer implementing the driver side of the contract.
struct LocalDriver {
    app: Arc<Mutex<App>>,
    admission: Arc<AdmissionController>,
    proposer: Address,
    interval: Duration,
    health: Arc<HealthFlags>,
}

impl LocalDriver {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.health.driver_ready.store(false, Ordering::Relaxed);
                    info!("consensus driver stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.produce_block() {
                        if e.is_fatal() {
                            error!(error = %e, "fatal consensus error, halting driver");
                            self.health.driver_ready.store(false, Ordering::Relaxed);
                            cancel.cancel();
                            return;
                        }
                        warn!(error = %e, "block production failed");
                    }
                }
            }
        }
    }

    fn produce_block(&self) -> Result<(), ChainError> {
        let txs = self.admission.pending(MAX_TXS_PER_BLOCK);
        if txs.is_empty() {
            return Ok(());
        }

        let timestamp = unix_now();
        let mut app = self.app.lock();
        let height = app.info().last_height + 1;

        app.begin_block(&BlockHeaderInfo { height, timestamp, proposer: self.proposer })?;

        let mut processed = Vec::with_capacity(txs.len());
        for tx in &txs {
            processed.push(tx.hash);
            let bytes = serde_json::to_vec(tx)?;
            match app.deliver_tx(&bytes) {
                Ok(outcome) => {
                    debug!(tx = %tx.hash, gas = outcome.gas_used, "delivered");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // Economic rejection at delivery: the tx leaves the pool
                    // without entering the block.
                    debug!(tx = %tx.hash, error = %e, "transaction rejected in block");
                }
            }
        }

        app.end_block(height)?;
        let app_hash = app.commit()?;
        drop(app);

        self.admission.remove_committed(&processed);
        debug!(height, app_hash = %app_hash, "driver committed block");
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Node address derived from the validator consensus key, used when no
/// explicit validator address is configured.
fn derive_node_address(key: &Ed25519Keypair) -> Address {
    let digest = keccak256(&key.public_key());
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Address(out)
}

fn load_or_create_genesis(
    path: &Path,
    chain_id: &str,
    validator_addr: Address,
    validator_key: &Ed25519Keypair,
) -> Result<Genesis, ChainError> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .map_err(|e| ChainError::StorageCorrupt(format!("genesis.json: {e}")))?;
        let genesis: Genesis = serde_json::from_slice(&bytes)
            .map_err(|e| ChainError::StorageCorrupt(format!("genesis.json: {e}")))?;
        return Ok(genesis);
    }

    let genesis = Genesis {
        chain_id: chain_id.to_string(),
        validators: vec![GenesisValidator {
            address: validator_addr,
            pubkey: validator_key.public_key().to_vec(),
            stake: GENESIS_SELF_STAKE,
        }],
        alloc: Default::default(),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ChainError::StorageCorrupt(format!("genesis dir: {e}")))?;
    }
    let bytes = serde_json::to_vec_pretty(&genesis)?;
    std::fs::write(path, bytes)
        .map_err(|e| ChainError::StorageCorrupt(format!("genesis.json: {e}")))?;
    info!(path = %path.display(), "wrote genesis document");
    Ok(genesis)
}

/// Convenience for tests and the binary: the path of the genesis document.
pub fn genesis_path(data_dir: &Path) -> PathBuf {
    data_dir.join("genesis.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::validators::ValidatorSet;
    use crate::metrics::Metrics;
    use crate::storage::ChainDb;
    use crate::types::Hash32;

    fn config(dir: &Path) -> Config {
        Config { data_dir: dir.to_path_buf(), ..Config::default() }
    }

    fn build(dir: &Path) -> (Arc<Mutex<App>>, Arc<AdmissionController>, ConsensusAdapter) {
        let db = Arc::new(ChainDb::open(dir).unwrap());
        let metrics = Arc::new(Metrics::new());
        let validators = Arc::new(Mutex::new(ValidatorSet::open(db.clone()).unwrap()));
        let app = Arc::new(Mutex::new(
            App::open(db.clone(), validators, metrics.clone(), "oxy-gen-chain".into()).unwrap(),
        ));
        let admission = Arc::new(AdmissionController::new(db, metrics));
        let health = Arc::new(HealthFlags::default());
        let adapter =
            ConsensusAdapter::bootstrap(&config(dir), app.clone(), admission.clone(), health)
                .unwrap();
        (app, admission, adapter)
    }

    #[test]
    fn bootstrap_creates_keys_and_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let (first_pubkey, first_proposer) = {
            let (_app, _admission, adapter) = build(dir.path());
            assert!(dir.path().join("keys/validator.key").exists());
            assert!(dir.path().join("keys/node.key").exists());
            assert!(dir.path().join("genesis.json").exists());
            assert_eq!(adapter.genesis.chain_id, "oxy-gen-chain");
            assert_eq!(adapter.genesis.validators.len(), 1);
            (adapter.validator_pubkey(), adapter.proposer())
        };

        // second bootstrap (fresh handles on the same data dir) reuses the
        // same identity
        let (_app, _admission, again) = build(dir.path());
        assert_eq!(first_pubkey, again.validator_pubkey());
        assert_eq!(first_proposer, again.proposer());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn driver_produces_a_block_from_the_mempool() {
        let dir = tempfile::tempdir().unwrap();
        let (app, admission, mut adapter) = build(dir.path());
        adapter.set_block_interval(Duration::from_millis(20));

        // fund a sender directly through genesis alloc
        let key = k256::ecdsa::SigningKey::from_slice(&[0x42u8; 32]).unwrap();
        let sender = crate::crypto::secp::address_of(key.verifying_key());
        adapter.genesis.alloc.insert(sender, 100 * GENESIS_SELF_STAKE);

        let cancel = CancellationToken::new();
        let handle = adapter.start(cancel.clone()).unwrap();

        let mut tx = crate::types::Transaction {
            hash: Hash32::zero(),
            from: sender,
            to: Some(Address([0xBB; 20])),
            value: GENESIS_SELF_STAKE,
            data: vec![],
            gas_limit: 21_000,
            gas_price: 1_000_000_000,
            nonce: 0,
            signature: vec![],
        };
        crate::crypto::sign_transaction(&mut tx, &key).unwrap();
        admission.submit(tx).unwrap();

        for _ in 0..100 {
            if app.lock().info().last_height >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(app.lock().info().last_height, 1);
        assert!(admission.is_empty());

        cancel.cancel();
        let _ = handle.await;
    }
}
