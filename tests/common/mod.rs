//! Shared fixture: a funded chain with the application, admission
//! controller and store wired together the way the node binary wires them.
#![allow(dead_code)]

use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use oxygen::consensus::app::App;
use oxygen::consensus::validators::ValidatorSet;
use oxygen::consensus::{Application, BlockHeaderInfo, Genesis};
use oxygen::crypto::sign_transaction;
use oxygen::mempool::AdmissionController;
use oxygen::metrics::Metrics;
use oxygen::storage::ChainDb;
use oxygen::types::{Address, Hash32, Height, Transaction};

pub const WEI: u128 = 1_000_000_000_000_000_000;

pub struct TestChain {
    pub dir: tempfile::TempDir,
    pub db: Arc<ChainDb>,
    pub app: App,
    pub admission: Arc<AdmissionController>,
    pub metrics: Arc<Metrics>,
}

pub fn keypair(seed: u8) -> (SigningKey, Address) {
    let key = SigningKey::from_slice(&[seed; 32]).expect("non-zero seed");
    let addr = oxygen::crypto::secp::address_of(key.verifying_key());
    (key, addr)
}

pub fn chain_with_alloc(alloc: BTreeMap<Address, u128>) -> TestChain {
    chain_with_alloc_and_limits(alloc, 10_000, 10, Duration::from_secs(1))
}

pub fn chain_with_alloc_and_limits(
    alloc: BTreeMap<Address, u128>,
    capacity: usize,
    per_sender_limit: usize,
    window: Duration,
) -> TestChain {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(ChainDb::open(dir.path()).unwrap());
    let metrics = Arc::new(Metrics::new());
    let validators = Arc::new(Mutex::new(ValidatorSet::open(db.clone()).unwrap()));
    let mut app = App::open(
        db.clone(),
        validators,
        metrics.clone(),
        "oxy-gen-chain".into(),
    )
    .unwrap();

    app.init_chain(&Genesis {
        chain_id: "oxy-gen-chain".into(),
        validators: vec![],
        alloc,
    })
    .unwrap();

    let admission = Arc::new(AdmissionController::with_limits(
        db.clone(),
        metrics.clone(),
        capacity,
        per_sender_limit,
        window,
    ));

    TestChain { dir, db, app, admission, metrics }
}

pub fn signed_transfer(
    key: &SigningKey,
    from: Address,
    to: Address,
    value: u128,
    nonce: u64,
) -> Transaction {
    let mut tx = Transaction {
        hash: Hash32::zero(),
        from,
        to: Some(to),
        value,
        data: vec![],
        gas_limit: 21_000,
        gas_price: 1_000_000_000,
        nonce,
        signature: vec![],
    };
    sign_transaction(&mut tx, key).unwrap();
    tx
}

/// Drive one block through the callback contract, the way the driver does.
pub fn produce_block(chain: &mut TestChain, height: Height, txs: &[Transaction]) -> Hash32 {
    chain
        .app
        .begin_block(&BlockHeaderInfo {
            height,
            timestamp: 1_700_000_000 + height,
            proposer: Address::zero(),
        })
        .unwrap();
    for tx in txs {
        let bytes = serde_json::to_vec(tx).unwrap();
        // Economic rejections drop the tx from the block; that is the
        // driver's behavior too.
        let _ = chain.app.deliver_tx(&bytes);
    }
    chain.app.end_block(height).unwrap();
    let root = chain.app.commit().unwrap();
    chain
        .admission
        .remove_committed(&txs.iter().map(|t| t.hash).collect::<Vec<_>>());
    root
}
