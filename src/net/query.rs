//! Correlated request/response queries over the mesh.
//!
//! Outgoing queries get a process-unique id (monotonic counter plus a
//! high-resolution timestamp) and wait on a oneshot channel; the timeout
//! removes the correlation entry so a late response is discarded, never
//! misdelivered.  Inbound requests are answered from committed local state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ChainError;
use crate::metrics::{inc, Metrics};
use crate::net::mesh::MeshPublisher;
use crate::net::{TOPIC_QUERY, TOPIC_RESPONSE};
use crate::state::Account;
use crate::storage::ChainDb;
use crate::types::{Address, Hash32, Height};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

pub struct QueryHandler {
    db: Arc<ChainDb>,
    publisher: MeshPublisher,
    pending: Mutex<HashMap<String, oneshot::Sender<QueryResponse>>>,
    counter: AtomicU64,
    metrics: Arc<Metrics>,
}

impl QueryHandler {
    pub fn new(db: Arc<ChainDb>, publisher: MeshPublisher, metrics: Arc<Metrics>) -> Self {
        Self {
            db,
            publisher,
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            metrics,
        }
    }

    fn next_request_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("query-{nanos}-{n}")
    }

    /// Ask the mesh for `path`, waiting up to `timeout` for a peer response.
    pub async fn query(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<QueryResponse, ChainError> {
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let request = QueryRequest {
            kind: "query".into(),
            path: path.to_string(),
            request_id: request_id.clone(),
            from: Some(self.publisher.node_id().to_string()),
        };
        if let Err(e) = self
            .publisher
            .publish(TOPIC_QUERY, serde_json::to_value(&request)?)
        {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                Err(ChainError::Transient("query channel dropped".into()))
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                inc(&self.metrics.query_timeouts);
                Err(ChainError::Transient(format!("query timeout: {path}")))
            }
        }
    }

    /// Service an inbound request from committed local state and publish the
    /// response under the same id.
    pub fn handle_query(&self, request: QueryRequest) {
        let mut response = QueryResponse {
            kind: "response".into(),
            request_id: request.request_id.clone(),
            path: request.path.clone(),
            data: None,
            error: None,
            from: Some(self.publisher.node_id().to_string()),
        };

        match self.answer(&request.path) {
            Ok(data) => response.data = Some(data),
            Err(e) => response.error = Some(e.to_string()),
        }

        match serde_json::to_value(&response) {
            Ok(value) => {
                if let Err(e) = self.publisher.publish(TOPIC_RESPONSE, value) {
                    debug!(error = %e, "query response dropped (back-pressure)");
                }
            }
            Err(e) => debug!(error = %e, "query response encode failed"),
        }
    }

    /// Deliver an inbound response to its waiter; strays are discarded.
    pub fn handle_response(&self, response: QueryResponse) {
        if let Some(tx) = self.pending.lock().remove(&response.request_id) {
            let _ = tx.send(response);
        } else {
            debug!(request_id = %response.request_id, "stray query response discarded");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Same path grammar as the state machine's `query`, answered from the
    /// committed store.
    fn answer(&self, path: &str) -> Result<serde_json::Value, ChainError> {
        match path {
            "height" | "status" => {
                let height = self.db.latest_height().unwrap_or(0);
                Ok(serde_json::json!({ "height": height }))
            }
            _ if path.starts_with("balance/") => {
                let addr = Address::from_hex(&path["balance/".len()..])
                    .ok_or_else(|| ChainError::Decode(format!("bad address in {path}")))?;
                let account = self.committed_account(&addr)?;
                Ok(serde_json::json!({
                    "address": addr,
                    "balance": account.balance.to_string(),
                }))
            }
            _ if path.starts_with("account/") => {
                let addr = Address::from_hex(&path["account/".len()..])
                    .ok_or_else(|| ChainError::Decode(format!("bad address in {path}")))?;
                let account = self.committed_account(&addr)?;
                Ok(serde_json::json!({
                    "address": addr,
                    "balance": account.balance.to_string(),
                    "nonce": account.nonce,
                    "codeHash": account.code_hash(),
                }))
            }
            _ if path.starts_with("tx/") => {
                let hash = Hash32::from_hex(&path["tx/".len()..])
                    .ok_or_else(|| ChainError::Decode(format!("bad hash in {path}")))?;
                let bytes = self.db.transaction_bytes(&hash)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
            _ if path.starts_with("block/") => {
                let height: Height = path["block/".len()..]
                    .parse()
                    .map_err(|_| ChainError::Decode(format!("bad height in {path}")))?;
                let bytes = self.db.block_bytes(height)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
            other => Err(ChainError::Decode(format!("unknown query path: {other}"))),
        }
    }

    fn committed_account(&self, addr: &Address) -> Result<Account, ChainError> {
        match self.db.account_bytes(addr)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ChainError::StorageCorrupt(format!("account {addr}: {e}"))),
            None => Ok(Account::default()),
        }
    }
}
