//! Crash-safe byte-addressed KV store.
//!
//! Key namespaces:
//!   block:<height>    — full block JSON (header + transactions + receipts)
//!   tx:<hash>         — transaction JSON
//!   account:<address> — account record JSON
//!   state:latest      — state metadata {root, height}
//!   state:<height>    — state metadata at that height
//!   height:latest     — decimal latest committed height
//!   validators:set    — full validator set JSON
//!
//! Multi-key writes that must land together (block, receipts, latest-height
//! pointer, state metadata) go through [`CommitBatch`]; sled applies the
//! batch atomically and `flush` makes it durable before the commit returns.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ChainError;
use crate::types::{Address, Block, Hash32, Height, Transaction};

/// State metadata persisted under `state:latest` and `state:<height>`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateMeta {
    pub root: Hash32,
    pub height: Height,
}

pub struct ChainDb {
    db: sled::Db,
}

fn block_key(height: Height) -> Vec<u8> {
    format!("block:{height}").into_bytes()
}

fn tx_key(hash: &Hash32) -> Vec<u8> {
    format!("tx:{}", hash.to_hex()).into_bytes()
}

fn account_key(addr: &Address) -> Vec<u8> {
    format!("account:{}", addr.to_hex()).into_bytes()
}

fn state_key(height: Height) -> Vec<u8> {
    format!("state:{height}").into_bytes()
}

const STATE_LATEST: &[u8] = b"state:latest";
const HEIGHT_LATEST: &[u8] = b"height:latest";
const VALIDATORS_SET: &[u8] = b"validators:set";
const ACCOUNT_PREFIX: &[u8] = b"account:";

impl ChainDb {
    pub fn open(dir: &Path) -> Result<Self, ChainError> {
        let db = sled::open(dir.join("chain.db"))?;
        Ok(Self { db })
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn get_required(&self, key: &[u8]) -> Result<Vec<u8>, ChainError> {
        self.get_raw(key)?.ok_or_else(|| {
            ChainError::NotFound(String::from_utf8_lossy(key).into_owned())
        })
    }

    // ── blocks ───────────────────────────────────────────────────────────

    pub fn block(&self, height: Height) -> Result<Block, ChainError> {
        let bytes = self.get_required(&block_key(height))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ChainError::StorageCorrupt(format!("block:{height}: {e}")))
    }

    pub fn block_bytes(&self, height: Height) -> Result<Vec<u8>, ChainError> {
        self.get_required(&block_key(height))
    }

    pub fn latest_height(&self) -> Result<Height, ChainError> {
        let bytes = self.get_required(HEIGHT_LATEST)?;
        let s = String::from_utf8(bytes)
            .map_err(|e| ChainError::StorageCorrupt(format!("height:latest: {e}")))?;
        s.parse()
            .map_err(|e| ChainError::StorageCorrupt(format!("height:latest: {e}")))
    }

    pub fn latest_block(&self) -> Result<Block, ChainError> {
        self.block(self.latest_height()?)
    }

    // ── transactions ─────────────────────────────────────────────────────

    pub fn transaction(&self, hash: &Hash32) -> Result<Transaction, ChainError> {
        let bytes = self.get_required(&tx_key(hash))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ChainError::StorageCorrupt(format!("tx:{hash}: {e}")))
    }

    pub fn transaction_bytes(&self, hash: &Hash32) -> Result<Vec<u8>, ChainError> {
        self.get_required(&tx_key(hash))
    }

    pub fn has_transaction(&self, hash: &Hash32) -> Result<bool, ChainError> {
        Ok(self.db.contains_key(tx_key(hash))?)
    }

    /// Persist transaction bytes outside a commit batch (deliver path keeps
    /// raw bytes durable as soon as the tx enters a block under assembly).
    pub fn put_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
        let bytes = serde_json::to_vec(tx)?;
        self.db.insert(tx_key(&tx.hash), bytes)?;
        Ok(())
    }

    // ── accounts ─────────────────────────────────────────────────────────

    pub fn account_bytes(&self, addr: &Address) -> Result<Option<Vec<u8>>, ChainError> {
        self.get_raw(&account_key(addr))
    }

    /// All persisted accounts, for trie reconstruction at load.
    pub fn scan_accounts(&self) -> Result<Vec<(Address, Vec<u8>)>, ChainError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(ACCOUNT_PREFIX) {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key);
            let addr_str = &key_str[ACCOUNT_PREFIX.len()..];
            let addr = Address::from_hex(addr_str).ok_or_else(|| {
                ChainError::StorageCorrupt(format!("bad account key {key_str}"))
            })?;
            out.push((addr, value.to_vec()));
        }
        Ok(out)
    }

    // ── state metadata ───────────────────────────────────────────────────

    pub fn state_meta(&self) -> Result<StateMeta, ChainError> {
        let bytes = self.get_required(STATE_LATEST)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ChainError::StorageCorrupt(format!("state:latest: {e}")))
    }

    // ── validators ───────────────────────────────────────────────────────

    pub fn validators_bytes(&self) -> Result<Option<Vec<u8>>, ChainError> {
        self.get_raw(VALIDATORS_SET)
    }

    pub fn put_validators(&self, bytes: &[u8]) -> Result<(), ChainError> {
        self.db.insert(VALIDATORS_SET, bytes)?;
        self.db.flush()?;
        Ok(())
    }

    // ── atomic commit ────────────────────────────────────────────────────

    pub fn commit(&self, batch: CommitBatch) -> Result<(), ChainError> {
        self.db.apply_batch(batch.inner)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Collects every write of a block commit so they land atomically.
#[derive(Default)]
pub struct CommitBatch {
    inner: sled::Batch,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_block(&mut self, block: &Block) -> Result<(), ChainError> {
        let bytes = serde_json::to_vec(block)?;
        self.inner.insert(block_key(block.header.height), bytes);
        Ok(())
    }

    pub fn put_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        let bytes = serde_json::to_vec(tx)?;
        self.inner.insert(tx_key(&tx.hash), bytes);
        Ok(())
    }

    pub fn put_account(&mut self, addr: &Address, bytes: Vec<u8>) {
        self.inner.insert(account_key(addr), bytes);
    }

    pub fn delete_account(&mut self, addr: &Address) {
        self.inner.remove(account_key(addr));
    }

    pub fn put_latest_height(&mut self, height: Height) {
        self.inner.insert(HEIGHT_LATEST, height.to_string().into_bytes());
    }

    pub fn put_state_meta(&mut self, meta: &StateMeta) -> Result<(), ChainError> {
        let bytes = serde_json::to_vec(meta)?;
        self.inner.insert(STATE_LATEST, bytes.clone());
        self.inner.insert(state_key(meta.height), bytes);
        Ok(())
    }

    pub fn put_validators(&mut self, bytes: Vec<u8>) {
        self.inner.insert(VALIDATORS_SET, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHeader;

    fn sample_block(height: Height) -> Block {
        Block {
            header: BlockHeader {
                height,
                hash: Hash32([height as u8; 32]),
                parent_hash: Hash32::zero(),
                timestamp: 1_700_000_000,
                chain_id: "oxy-gen-chain".into(),
                proposer: Address::zero(),
                state_root: Hash32::zero(),
            },
            transactions: vec![],
            receipts: vec![],
        }
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();
        assert!(matches!(db.block(7), Err(ChainError::NotFound(_))));
        assert!(matches!(db.latest_height(), Err(ChainError::NotFound(_))));
    }

    #[test]
    fn commit_batch_is_atomic_and_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = ChainDb::open(dir.path()).unwrap();
            let block = sample_block(1);
            let mut batch = CommitBatch::new();
            batch.put_block(&block).unwrap();
            batch.put_latest_height(1);
            batch
                .put_state_meta(&StateMeta { root: Hash32([9u8; 32]), height: 1 })
                .unwrap();
            db.commit(batch).unwrap();
        }
        // reopen: everything from the batch is visible together
        let db = ChainDb::open(dir.path()).unwrap();
        assert_eq!(db.latest_height().unwrap(), 1);
        assert_eq!(db.block(1).unwrap().header.height, 1);
        let meta = db.state_meta().unwrap();
        assert_eq!(meta.height, 1);
        assert_eq!(meta.root, Hash32([9u8; 32]));
    }

    #[test]
    fn transaction_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();
        let tx = Transaction {
            hash: Hash32([3u8; 32]),
            from: Address([1u8; 20]),
            to: None,
            value: 5,
            data: vec![1, 2, 3],
            gas_limit: 21_000,
            gas_price: 7,
            nonce: 0,
            signature: vec![0u8; 65],
        };
        db.put_transaction(&tx).unwrap();
        assert!(db.has_transaction(&tx.hash).unwrap());
        assert_eq!(db.transaction(&tx.hash).unwrap(), tx);
    }

    #[test]
    fn account_scan_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();
        let mut batch = CommitBatch::new();
        batch.put_account(&Address([1u8; 20]), b"{\"a\":1}".to_vec());
        batch.put_account(&Address([2u8; 20]), b"{\"a\":2}".to_vec());
        db.commit(batch).unwrap();
        let accounts = db.scan_accounts().unwrap();
        assert_eq!(accounts.len(), 2);
    }
}
