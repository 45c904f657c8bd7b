//! After a hard stop, a reopened node observes the
//! committed block, its receipts, the state root and the latest-height
//! pointer — all agreeing.

mod common;

use common::*;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use oxygen::consensus::app::App;
use oxygen::consensus::validators::ValidatorSet;
use oxygen::consensus::Application;
use oxygen::metrics::Metrics;
use oxygen::storage::ChainDb;
use oxygen::types::{Address, Hash32};

#[test]
fn commit_survives_reopen() {
    let (key, a) = keypair(0xA1);
    let b = Address([0xBB; 20]);

    let mut alloc = BTreeMap::new();
    alloc.insert(a, 100 * WEI);
    let mut chain = chain_with_alloc(alloc);

    let tx = signed_transfer(&key, a, b, WEI, 0);
    chain.admission.submit(tx.clone()).unwrap();
    let root = produce_block(&mut chain, 1, &[tx.clone()]);
    let committed_block = chain.db.block(1).unwrap();

    // hard stop: drop every handle, keep the directory
    let dir = chain.dir;
    drop(chain.db);
    drop(chain.app);
    drop(chain.admission);

    // restart
    let db = Arc::new(ChainDb::open(dir.path()).unwrap());
    let metrics = Arc::new(Metrics::new());
    let validators = Arc::new(Mutex::new(ValidatorSet::open(db.clone()).unwrap()));
    let app = App::open(db.clone(), validators, metrics, "oxy-gen-chain".into()).unwrap();

    // latest-height pointer, block, receipts and state root all agree
    assert_eq!(db.latest_height().unwrap(), 1);
    let block = db.block(1).unwrap();
    assert_eq!(block, committed_block);
    assert_eq!(block.header.state_root, root);
    assert_eq!(block.receipts.len(), 1);

    let meta = db.state_meta().unwrap();
    assert_eq!(meta.height, 1);
    assert_eq!(meta.root, root);

    let info = app.info();
    assert_eq!(info.last_height, 1);
    assert_eq!(info.app_hash, root);

    // account state is back
    let view: serde_json::Value =
        serde_json::from_slice(&app.query(&format!("account/{b}")).unwrap()).unwrap();
    assert_eq!(view["balance"], WEI.to_string());

    // the committed transaction is queryable by hash
    assert!(app.query(&format!("tx/{}", tx.hash)).is_ok());
}

#[test]
fn reopened_chain_continues_from_parent_hash() {
    let (key, a) = keypair(0xA1);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 100 * WEI);
    let mut chain = chain_with_alloc(alloc);

    let tx1 = signed_transfer(&key, a, Address([1u8; 20]), WEI, 0);
    produce_block(&mut chain, 1, &[tx1]);
    let b1_hash = chain.db.block(1).unwrap().header.hash;

    let dir = chain.dir;
    drop(chain.db);
    drop(chain.app);
    drop(chain.admission);

    let db = Arc::new(ChainDb::open(dir.path()).unwrap());
    let metrics = Arc::new(Metrics::new());
    let validators = Arc::new(Mutex::new(ValidatorSet::open(db.clone()).unwrap()));
    let mut app = App::open(db.clone(), validators, metrics, "oxy-gen-chain".into()).unwrap();

    let tx2 = signed_transfer(&key, a, Address([2u8; 20]), WEI, 1);
    app.begin_block(&oxygen::consensus::BlockHeaderInfo {
        height: 2,
        timestamp: 1_700_000_002,
        proposer: Address::zero(),
    })
    .unwrap();
    app.deliver_tx(&serde_json::to_vec(&tx2).unwrap()).unwrap();
    app.end_block(2).unwrap();
    let root2 = app.commit().unwrap();

    let b2 = db.block(2).unwrap();
    assert_eq!(b2.header.parent_hash, b1_hash);
    assert_eq!(b2.header.state_root, root2);
    assert_ne!(root2, Hash32::zero());
}
