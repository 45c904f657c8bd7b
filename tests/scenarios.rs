//! End-to-end scenarios through admission and the callback contract.

mod common;

use common::*;
use std::collections::BTreeMap;
use std::time::Duration;

use oxygen::consensus::validators::{ValidatorSet, POWER_DENOMINATOR};
use oxygen::consensus::Application;
use oxygen::error::ChainError;
use oxygen::storage::ChainDb;
use oxygen::types::{Address, ReceiptStatus};

/// A funded transfer lands with exact balances and a success receipt for
/// 21000 gas.
#[test]
fn simple_transfer() {
    let (key, a) = keypair(0xA1);
    let b = Address([0xBB; 20]);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 100 * WEI); // 10^20
    let mut chain = chain_with_alloc(alloc);

    let tx = signed_transfer(&key, a, b, WEI, 0);
    chain.admission.submit(tx.clone()).unwrap();
    assert_eq!(chain.admission.len(), 1);

    produce_block(&mut chain, 1, &[tx.clone()]);

    let block = chain.db.block(1).unwrap();
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.receipts.len(), 1);
    let receipt = &block.receipts[0];
    assert_eq!(receipt.status, ReceiptStatus::Success);
    assert_eq!(receipt.gas_used, 21_000);
    assert_eq!(receipt.tx_hash, tx.hash);

    let balance_a: serde_json::Value =
        serde_json::from_slice(&chain.app.query(&format!("account/{a}")).unwrap()).unwrap();
    let expected_a = 100 * WEI - WEI - 21_000u128 * 1_000_000_000;
    assert_eq!(balance_a["balance"], expected_a.to_string());
    assert_eq!(balance_a["nonce"], 1);

    let balance_b: serde_json::Value =
        serde_json::from_slice(&chain.app.query(&format!("balance/{b}")).unwrap()).unwrap();
    assert_eq!(balance_b["balance"], WEI.to_string());

    assert!(chain.admission.is_empty());
}

/// A flipped signature byte is rejected at admission and nothing moves.
#[test]
fn bad_signature_rejected() {
    let (key, a) = keypair(0xA1);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 100 * WEI);
    let chain = chain_with_alloc(alloc);

    let mut tx = signed_transfer(&key, a, Address([0xBB; 20]), WEI, 0);
    tx.signature[0] ^= 0x01;

    match chain.admission.submit(tx) {
        Err(ChainError::SignatureInvalid) => {}
        other => panic!("expected SignatureInvalid, got {other:?}"),
    }
    assert!(chain.admission.is_empty());
    assert!(matches!(
        chain.db.latest_height(),
        Err(ChainError::NotFound(_))
    ));
}

/// Spending more than the balance is refused before pooling.
#[test]
fn insufficient_funds_rejected() {
    let (key, a) = keypair(0xA1);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 1_000_000_000_000_000); // 10^15
    let chain = chain_with_alloc(alloc);

    let tx = signed_transfer(&key, a, Address([0xBB; 20]), WEI, 0);
    match chain.admission.submit(tx) {
        Err(ChainError::InsufficientFunds { .. }) => {}
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }
    assert!(chain.admission.is_empty());
}

/// Re-submitting the same transaction is `Duplicate` both while pooled and
/// after commit; it executes exactly once.
#[test]
fn duplicate_submission_is_idempotent() {
    let (key, a) = keypair(0xA1);
    let b = Address([0xBB; 20]);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 100 * WEI);
    let mut chain = chain_with_alloc(alloc);

    let tx = signed_transfer(&key, a, b, WEI, 0);
    chain.admission.submit(tx.clone()).unwrap();
    match chain.admission.submit(tx.clone()) {
        Err(ChainError::Duplicate(_)) => {}
        other => panic!("expected Duplicate, got {other:?}"),
    }
    assert_eq!(chain.admission.len(), 1);

    produce_block(&mut chain, 1, &[tx.clone()]);

    // after commit the hash is known to the store: still Duplicate
    match chain.admission.submit(tx) {
        Err(ChainError::Duplicate(_)) => {}
        other => panic!("expected Duplicate after commit, got {other:?}"),
    }

    let view: serde_json::Value =
        serde_json::from_slice(&chain.app.query(&format!("balance/{b}")).unwrap()).unwrap();
    assert_eq!(view["balance"], WEI.to_string());
}

/// The 11th admission inside the window is rate limited; after the window
/// passes the same transaction is accepted.
#[test]
fn per_sender_rate_limit() {
    let (key, a) = keypair(0xA1);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 1_000 * WEI);
    let window = Duration::from_millis(150);
    let chain = chain_with_alloc_and_limits(alloc, 10_000, 10, window);

    let txs: Vec<_> = (0..=10u64)
        .map(|nonce| signed_transfer(&key, a, Address([0xBB; 20]), WEI, nonce))
        .collect();

    for tx in &txs[..10] {
        chain.admission.submit(tx.clone()).unwrap();
    }
    match chain.admission.submit(txs[10].clone()) {
        Err(ChainError::RateLimited(_)) => {}
        other => panic!("expected RateLimited, got {other:?}"),
    }
    assert_eq!(chain.admission.len(), 10);

    std::thread::sleep(window + Duration::from_millis(50));
    chain.admission.submit(txs[10].clone()).unwrap();
    assert_eq!(chain.admission.len(), 11);
}

/// 101 registrations with strictly increasing stakes keep the top 100; the
/// lowest-staked registrant is evicted by the 101st.
#[test]
fn validator_set_keeps_top_hundred() {
    let dir = tempfile::tempdir().unwrap();
    let db = std::sync::Arc::new(ChainDb::open(dir.path()).unwrap());
    let mut set = ValidatorSet::open(db).unwrap();
    let min_stake = set.min_stake();

    for i in 0..=100u32 {
        let mut addr = [0u8; 20];
        addr[16..].copy_from_slice(&i.to_be_bytes());
        set.register(
            Address(addr),
            vec![i as u8; 32],
            min_stake + i as u128 * POWER_DENOMINATOR,
            0,
        )
        .unwrap();
    }

    assert_eq!(set.len(), 100);
    let active = set.active_set();
    assert_eq!(active.len(), 100);
    assert_eq!(active[0].stake, min_stake + 100 * POWER_DENOMINATOR);
    // the i=0 entry (exactly min_stake) was evicted
    assert!(active.iter().all(|v| v.stake > min_stake));
}

/// Failed EVM execution still lands in the block with a failed receipt, so
/// the tx/receipt buffers stay index-aligned.
#[test]
fn failed_execution_keeps_receipt_alignment() {
    let (key, a) = keypair(0xA1);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 100 * WEI);
    let mut chain = chain_with_alloc(alloc);

    // REVERT: PUSH1 0 PUSH1 0 REVERT as init code
    let mut tx = oxygen::types::Transaction {
        hash: oxygen::types::Hash32::zero(),
        from: a,
        to: None,
        value: 0,
        data: vec![0x60, 0x00, 0x60, 0x00, 0xFD],
        gas_limit: 100_000,
        gas_price: 1_000_000_000,
        nonce: 0,
        signature: vec![],
    };
    oxygen::crypto::sign_transaction(&mut tx, &key).unwrap();

    produce_block(&mut chain, 1, &[tx]);

    let block = chain.db.block(1).unwrap();
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.receipts.len(), 1);
    assert_eq!(block.receipts[0].status, ReceiptStatus::Failed);
    // the sender still paid for the attempt
    let view: serde_json::Value =
        serde_json::from_slice(&chain.app.query(&format!("account/{a}")).unwrap()).unwrap();
    assert_eq!(view["nonce"], 1);
}
