//! Mempool and its admission controller.
//!
//! Admission checks run in a fixed order and the first failure wins:
//! duplicate, capacity, rate limit, crypto (signature / hash), then
//! economics (nonce / balance) against the *committed* state read from the
//! KV store.  Nothing mutates unless every check passes.  The pool never
//! evicts — entries leave only when a block commits them.

pub mod ratelimit;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ChainError;
use crate::metrics::{inc, Metrics};
use crate::state::Account;
use crate::storage::ChainDb;
use crate::types::{Hash32, Transaction};

pub use ratelimit::{RateLimiter, DEFAULT_PER_SENDER_LIMIT, DEFAULT_WINDOW, SWEEP_INTERVAL};

pub const DEFAULT_CAPACITY: usize = 10_000;

/// Ordered pending transactions with O(1) dedup.
pub struct Mempool {
    entries: Vec<Transaction>,
    hashes: HashSet<Hash32>,
    capacity: usize,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            hashes: HashSet::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.hashes.contains(hash)
    }

    pub fn has_capacity(&self) -> bool {
        self.entries.len() < self.capacity
    }

    fn push(&mut self, tx: Transaction) {
        self.hashes.insert(tx.hash);
        self.entries.push(tx);
    }

    /// Insertion-order view for the driver; ordering authority stays with
    /// the consensus driver.
    pub fn pending(&self, max: usize) -> Vec<Transaction> {
        self.entries.iter().take(max).cloned().collect()
    }

    /// Drop every entry committed in a block.
    pub fn remove_committed(&mut self, hashes: &[Hash32]) {
        let committed: HashSet<&Hash32> = hashes.iter().collect();
        self.entries.retain(|tx| !committed.contains(&tx.hash));
        for h in hashes {
            self.hashes.remove(h);
        }
    }
}

/// The admission pipeline shared by REST submit and mesh gossip.
pub struct AdmissionController {
    pool: Mutex<Mempool>,
    limiter: RateLimiter,
    db: Arc<ChainDb>,
    metrics: Arc<Metrics>,
}

impl AdmissionController {
    pub fn new(db: Arc<ChainDb>, metrics: Arc<Metrics>) -> Self {
        Self::with_limits(
            db,
            metrics,
            DEFAULT_CAPACITY,
            DEFAULT_PER_SENDER_LIMIT,
            DEFAULT_WINDOW,
        )
    }

    pub fn with_limits(
        db: Arc<ChainDb>,
        metrics: Arc<Metrics>,
        capacity: usize,
        per_sender_limit: usize,
        window: Duration,
    ) -> Self {
        Self {
            pool: Mutex::new(Mempool::new(capacity)),
            limiter: RateLimiter::new(per_sender_limit, window),
            db,
            metrics,
        }
    }

    /// Run the full admission sequence; returns the canonical hash on
    /// success.
    pub fn submit(&self, tx: Transaction) -> Result<Hash32, ChainError> {
        let result = self.admit(tx);
        match &result {
            Ok(_) => inc(&self.metrics.mempool_admitted),
            Err(e) => {
                inc(&self.metrics.mempool_rejected);
                debug!(error = %e, "transaction rejected at admission");
            }
        }
        result
    }

    fn admit(&self, tx: Transaction) -> Result<Hash32, ChainError> {
        let hash = tx.hash;

        {
            let pool = self.pool.lock();
            if pool.contains(&hash) {
                return Err(ChainError::Duplicate(hash.to_hex()));
            }
            // Already-committed transactions are duplicates too (idempotent
            // re-submit, never a second execution).
            if self.db.has_transaction(&hash)? {
                return Err(ChainError::Duplicate(hash.to_hex()));
            }
            if !pool.has_capacity() {
                return Err(ChainError::MempoolFull);
            }
        }

        if !self.limiter.check(&tx.from) {
            return Err(ChainError::RateLimited(tx.from.to_hex()));
        }

        crate::crypto::verify_transaction(&tx)?;

        let account = self.committed_account(&tx)?;
        if tx.nonce < account.nonce {
            return Err(ChainError::InvalidNonce { expected: account.nonce, got: tx.nonce });
        }
        let required = tx.upfront_cost();
        if account.balance < required {
            return Err(ChainError::InsufficientFunds { balance: account.balance, required });
        }

        let mut pool = self.pool.lock();
        // Re-check under the lock; another thread may have admitted the same
        // hash or taken the last slot.
        if pool.contains(&hash) {
            return Err(ChainError::Duplicate(hash.to_hex()));
        }
        if !pool.has_capacity() {
            return Err(ChainError::MempoolFull);
        }
        let sender = tx.from;
        pool.push(tx);
        drop(pool);
        self.limiter.record(&sender);
        Ok(hash)
    }

    fn committed_account(&self, tx: &Transaction) -> Result<Account, ChainError> {
        match self.db.account_bytes(&tx.from)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ChainError::StorageCorrupt(format!("account {}: {e}", tx.from))),
            None => Ok(Account::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock().is_empty()
    }

    pub fn pending(&self, max: usize) -> Vec<Transaction> {
        self.pool.lock().pending(max)
    }

    pub fn remove_committed(&self, hashes: &[Hash32]) {
        self.pool.lock().remove_committed(hashes);
    }

    /// Periodic rate-limiter sweep; exits when the root token cancels.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.limiter.sweep(),
            }
        }
    }
}
