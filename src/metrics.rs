//! Process counters, exposed as a JSON snapshot on `GET /metrics`.
//!
//! One instance is created at startup and injected into every component
//! that records; nothing reaches for a global registry.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub blocks_committed: AtomicU64,
    pub txs_executed: AtomicU64,
    pub txs_failed: AtomicU64,
    pub mempool_admitted: AtomicU64,
    pub mempool_rejected: AtomicU64,
    pub mesh_messages_in: AtomicU64,
    pub mesh_messages_out: AtomicU64,
    pub mesh_reconnects: AtomicU64,
    pub query_timeouts: AtomicU64,
    pub api_requests: AtomicU64,
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub blocks_committed: u64,
    pub txs_executed: u64,
    pub txs_failed: u64,
    pub mempool_admitted: u64,
    pub mempool_rejected: u64,
    pub mesh_messages_in: u64,
    pub mesh_messages_out: u64,
    pub mesh_reconnects: u64,
    pub query_timeouts: u64,
    pub api_requests: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_committed: self.blocks_committed.load(Ordering::Relaxed),
            txs_executed: self.txs_executed.load(Ordering::Relaxed),
            txs_failed: self.txs_failed.load(Ordering::Relaxed),
            mempool_admitted: self.mempool_admitted.load(Ordering::Relaxed),
            mempool_rejected: self.mempool_rejected.load(Ordering::Relaxed),
            mesh_messages_in: self.mesh_messages_in.load(Ordering::Relaxed),
            mesh_messages_out: self.mesh_messages_out.load(Ordering::Relaxed),
            mesh_reconnects: self.mesh_reconnects.load(Ordering::Relaxed),
            query_timeouts: self.query_timeouts.load(Ordering::Relaxed),
            api_requests: self.api_requests.load(Ordering::Relaxed),
        }
    }
}

/// Relaxed increment; counters are monotonic and read only for reporting.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
