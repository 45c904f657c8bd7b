//! Account state manager: the single-writer view of the state trie.
//!
//! Reads from committed state go through the KV store (`account:<addr>`
//! records); this manager holds the live working copy between commits.
//! Checkpoints are undo logs — a failed transaction reverts with no trace,
//! and nothing another thread can observe changes until `commit` returns.

pub mod trie;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::ChainError;
use crate::storage::{ChainDb, CommitBatch};
use crate::types::{keccak256, Address, Hash32};

/// One account: balance (wei), nonce, contract code, storage.
///
/// The empty account (zero balance, zero nonce, no code, no storage) is
/// never persisted — accounts exist implicitly and are pruned at commit.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub balance: u128,
    pub nonce: u64,
    #[serde(with = "crate::types::hex_bytes", default)]
    pub code: Vec<u8>,
    #[serde(default)]
    pub storage: BTreeMap<Hash32, Hash32>,
}

impl Account {
    pub fn code_hash(&self) -> Hash32 {
        Hash32(keccak256(&self.code))
    }

    pub fn is_empty(&self) -> bool {
        self.balance == 0 && self.nonce == 0 && self.code.is_empty() && self.storage.is_empty()
    }
}

/// Opaque checkpoint handle returned by [`StateManager::checkpoint`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint(usize);

pub struct StateManager {
    db: Arc<ChainDb>,
    accounts: BTreeMap<Address, Account>,
    /// Undo layers: first-touch previous value per mutated address.
    undo: Vec<HashMap<Address, Option<Account>>>,
    /// Addresses mutated since the last commit.
    dirty: HashSet<Address>,
    root: Hash32,
}

impl StateManager {
    pub fn new(db: Arc<ChainDb>) -> Self {
        Self {
            db,
            accounts: BTreeMap::new(),
            undo: Vec::new(),
            dirty: HashSet::new(),
            root: trie::empty_root(),
        }
    }

    /// Open the trie at `root`.  The zero hash and the empty-trie root both
    /// denote an empty state.  An unknown root is reported (`NotFound`);
    /// undecodable account records are fatal (`TrieCorrupt`).
    pub fn load(&mut self, root: Hash32) -> Result<(), ChainError> {
        self.accounts.clear();
        self.undo.clear();
        self.dirty.clear();

        if root.is_zero() || root == trie::empty_root() {
            self.root = trie::empty_root();
            return Ok(());
        }

        for (addr, bytes) in self.db.scan_accounts()? {
            let account: Account = serde_json::from_slice(&bytes)
                .map_err(|e| ChainError::TrieCorrupt(format!("account {addr}: {e}")))?;
            self.accounts.insert(addr, account);
        }

        let computed = trie::state_root(self.accounts.iter());
        if computed != root {
            self.accounts.clear();
            return Err(ChainError::NotFound(format!(
                "state root {root} (store has {computed})"
            )));
        }
        self.root = root;
        Ok(())
    }

    pub fn root(&self) -> Hash32 {
        self.root
    }

    // ── reads ────────────────────────────────────────────────────────────

    pub fn account(&self, addr: &Address) -> Option<&Account> {
        self.accounts.get(addr)
    }

    pub fn balance(&self, addr: &Address) -> u128 {
        self.accounts.get(addr).map(|a| a.balance).unwrap_or(0)
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn storage(&self, addr: &Address, key: &Hash32) -> Hash32 {
        self.accounts
            .get(addr)
            .and_then(|a| a.storage.get(key).copied())
            .unwrap_or_else(Hash32::zero)
    }

    pub fn accounts_iter(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    // ── writes ───────────────────────────────────────────────────────────

    fn touch(&mut self, addr: Address) {
        self.dirty.insert(addr);
        if let Some(layer) = self.undo.last_mut() {
            layer
                .entry(addr)
                .or_insert_with(|| self.accounts.get(&addr).cloned());
        }
    }

    pub fn set_account(&mut self, addr: Address, account: Account) {
        self.touch(addr);
        self.accounts.insert(addr, account);
    }

    pub fn delete_account(&mut self, addr: &Address) {
        self.touch(*addr);
        self.accounts.remove(addr);
    }

    pub fn set_storage(&mut self, addr: Address, key: Hash32, value: Hash32) {
        self.touch(addr);
        let account = self.accounts.entry(addr).or_default();
        if value.is_zero() {
            account.storage.remove(&key);
        } else {
            account.storage.insert(key, value);
        }
    }

    // ── checkpoints ──────────────────────────────────────────────────────

    pub fn checkpoint(&mut self) -> Checkpoint {
        self.undo.push(HashMap::new());
        Checkpoint(self.undo.len())
    }

    /// Roll every layer at or above `cp` back, restoring first-touch values.
    pub fn revert_to(&mut self, cp: Checkpoint) {
        while self.undo.len() >= cp.0 {
            let layer = match self.undo.pop() {
                Some(l) => l,
                None => return,
            };
            for (addr, prior) in layer {
                match prior {
                    Some(account) => {
                        self.accounts.insert(addr, account);
                    }
                    None => {
                        self.accounts.remove(&addr);
                    }
                }
            }
        }
    }

    /// Keep the changes made since `cp`, merging undo entries into the
    /// enclosing layer so an outer revert still restores the oldest value.
    pub fn release(&mut self, cp: Checkpoint) {
        while self.undo.len() >= cp.0 {
            let layer = match self.undo.pop() {
                Some(l) => l,
                None => return,
            };
            if let Some(parent) = self.undo.last_mut() {
                for (addr, prior) in layer {
                    parent.entry(addr).or_insert(prior);
                }
            }
        }
    }

    // ── roots & commit ───────────────────────────────────────────────────

    /// Hash all pending modifications without finalizing anything.
    pub fn intermediate_root(&self) -> Hash32 {
        trie::state_root(self.accounts.iter())
    }

    /// Stage every dirty account into `batch` and return the new root.  The
    /// batch is applied (atomically, together with the block) by the caller;
    /// the in-memory view becomes the committed view.
    pub fn commit(&mut self, batch: &mut CommitBatch) -> Result<Hash32, ChainError> {
        self.undo.clear();

        // Empty accounts are pruned rather than persisted.
        let pruned: Vec<Address> = self
            .accounts
            .iter()
            .filter(|(_, a)| a.is_empty())
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &pruned {
            self.accounts.remove(addr);
            self.dirty.insert(*addr);
        }

        for addr in self.dirty.drain() {
            match self.accounts.get(&addr) {
                Some(account) => {
                    batch.put_account(&addr, serde_json::to_vec(account)?);
                }
                None => batch.delete_account(&addr),
            }
        }

        self.root = trie::state_root(self.accounts.iter());
        Ok(self.root)
    }
}
