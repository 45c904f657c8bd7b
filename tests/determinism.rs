//! Determinism checks: two independent nodes fed the same ordered inputs
//! must produce byte-identical roots, block hashes and receipts.  Any
//! failure here is a consensus-critical bug.

mod common;

use common::*;
use std::collections::BTreeMap;

use oxygen::types::{Address, Block};

fn run_chain(seed_txs: &[(u8, u128, u64)]) -> (Vec<Block>, Vec<u8>) {
    let (key, a) = keypair(0xA1);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 1_000 * WEI);
    let mut chain = chain_with_alloc(alloc);

    let mut blocks = Vec::new();
    for (height, chunk) in seed_txs.chunks(2).enumerate() {
        let txs: Vec<_> = chunk
            .iter()
            .map(|(to, value, nonce)| {
                signed_transfer(&key, a, Address([*to; 20]), *value, *nonce)
            })
            .collect();
        produce_block(&mut chain, height as u64 + 1, &txs);
        blocks.push(chain.db.block(height as u64 + 1).unwrap());
    }

    let roots: Vec<u8> = blocks
        .iter()
        .flat_map(|b| b.header.state_root.0.to_vec())
        .collect();
    (blocks, roots)
}

#[test]
fn independent_runs_converge() {
    let script = [
        (0x01u8, WEI, 0u64),
        (0x02, 2 * WEI, 1),
        (0x03, 3 * WEI, 2),
        (0x01, WEI / 2, 3),
        (0x04, 7 * WEI, 4),
    ];

    let (blocks_a, roots_a) = run_chain(&script);
    let (blocks_b, roots_b) = run_chain(&script);

    assert_eq!(roots_a, roots_b, "state roots diverged");
    for (a, b) in blocks_a.iter().zip(blocks_b.iter()) {
        assert_eq!(a.header.hash, b.header.hash, "block hashes diverged");
        assert_eq!(a.receipts, b.receipts, "receipts diverged");
        // persisted bytes are identical too
        assert_eq!(
            serde_json::to_vec(a).unwrap(),
            serde_json::to_vec(b).unwrap()
        );
    }
}

#[test]
fn canonical_tx_hash_is_stable_across_encodings() {
    let (key, a) = keypair(0xA1);
    let tx = signed_transfer(&key, a, Address([0xBB; 20]), WEI, 0);

    // hash survives a JSON round trip
    let bytes = serde_json::to_vec(&tx).unwrap();
    let back: oxygen::types::Transaction = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(back.canonical_hash(), tx.canonical_hash());
    assert_eq!(back.hash, tx.hash);
}

#[test]
fn ordering_changes_the_root() {
    let (key, a) = keypair(0xA1);
    let mut alloc = BTreeMap::new();
    alloc.insert(a, 1_000 * WEI);

    let tx0 = |key: &k256::ecdsa::SigningKey| signed_transfer(key, a, Address([1u8; 20]), WEI, 0);
    let tx1 = |key: &k256::ecdsa::SigningKey| signed_transfer(key, a, Address([2u8; 20]), WEI, 1);

    let mut chain_a = chain_with_alloc(alloc.clone());
    produce_block(&mut chain_a, 1, &[tx0(&key), tx1(&key)]);

    // swapped delivery: the nonce-1 tx is rejected first, then nonce-0
    // lands, so the resulting block contents differ
    let mut chain_b = chain_with_alloc(alloc);
    produce_block(&mut chain_b, 1, &[tx1(&key), tx0(&key)]);

    assert_ne!(
        chain_a.db.block(1).unwrap().header.hash,
        chain_b.db.block(1).unwrap().header.hash
    );
}
