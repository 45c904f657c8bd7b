//! Persistent websocket bridge to the peer mesh.
//!
//! One connection carries every topic.  The read loop and the heartbeat run
//! inside a single session select; a read error tears the session down and
//! reconnection walks the 2/4/6/8/10 s backoff ladder, then keeps retrying
//! in the background at the ladder's top.  Outbound publishes go through a
//! bounded queue — when it is full, publishing fails instead of blocking.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consensus::adapter::HealthFlags;
use crate::error::ChainError;
use crate::mempool::AdmissionController;
use crate::metrics::{inc, Metrics};
use crate::net::query::{QueryHandler, QueryRequest, QueryResponse};
use crate::net::{
    ALL_TOPICS, TOPIC_BLOCKS, TOPIC_QUERY, TOPIC_RESPONSE, TOPIC_TRANSACTIONS, TOPIC_VALIDATORS,
};
use crate::storage::ChainDb;
use crate::types::Transaction;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_LADDER_SECS: [u64; 5] = [2, 4, 6, 8, 10];
const OUTBOUND_BUFFER: usize = 256;

pub const MSG_SUBSCRIBE: &str = "subscribe";
pub const MSG_UNSUBSCRIBE: &str = "unsubscribe";
pub const MSG_PUBLISH: &str = "publish";
pub const MSG_PING: &str = "ping";
pub const MSG_PONG: &str = "pong";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Wire envelope shared by every mesh message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl MeshMessage {
    pub fn publish(topic: &str, data: serde_json::Value, from: Option<String>) -> Self {
        Self {
            kind: MSG_PUBLISH.into(),
            topic: Some(topic.into()),
            data: Some(data),
            from,
            to: None,
        }
    }

    fn control(kind: &str) -> Self {
        Self { kind: kind.into(), topic: None, data: None, from: None, to: None }
    }

    fn subscribe(topic: &str) -> Self {
        Self {
            kind: MSG_SUBSCRIBE.into(),
            topic: Some(topic.into()),
            data: None,
            from: None,
            to: None,
        }
    }
}

/// Clonable outbound half; the only way to put messages on the wire.
#[derive(Clone)]
pub struct MeshPublisher {
    tx: mpsc::Sender<MeshMessage>,
    node_id: String,
}

impl MeshPublisher {
    pub fn channel(node_id: String) -> (Self, mpsc::Receiver<MeshMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (Self { tx, node_id }, rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Queue a publish; fails with `Transient` when the buffer is full
    /// rather than blocking the caller.
    pub fn publish(&self, topic: &str, data: serde_json::Value) -> Result<(), ChainError> {
        let msg = MeshMessage::publish(topic, data, Some(self.node_id.clone()));
        self.tx
            .try_send(msg)
            .map_err(|_| ChainError::Transient("mesh outbound buffer full".into()))
    }

    fn send_control(&self, kind: &str) {
        let _ = self.tx.try_send(MeshMessage::control(kind));
    }
}

enum SessionEnd {
    Cancelled,
    Disconnected,
}

/// Inbound dispatch, separated from the connection loop so the session
/// select can borrow the outbound queue independently.
#[derive(Clone)]
struct InboundHandler {
    publisher: MeshPublisher,
    admission: Arc<AdmissionController>,
    query: Arc<QueryHandler>,
    db: Arc<ChainDb>,
    metrics: Arc<Metrics>,
}

impl InboundHandler {
    fn handle(&self, text: &str) {
        inc(&self.metrics.mesh_messages_in);
        let msg: MeshMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "undecodable mesh message dropped");
                return;
            }
        };

        match msg.kind.as_str() {
            MSG_PING => self.publisher.send_control(MSG_PONG),
            MSG_PONG => {}
            MSG_PUBLISH => {
                let Some(topic) = msg.topic.as_deref() else { return };
                let Some(data) = msg.data else { return };
                self.handle_publish(topic, data);
            }
            // Direct query/response frames (no publish envelope) are also
            // accepted, mirroring the mesh's point-to-point form.
            "query" => {
                if let Some(data) = msg.data {
                    if let Ok(req) = serde_json::from_value::<QueryRequest>(data) {
                        self.query.handle_query(req);
                    }
                }
            }
            "response" => {
                if let Some(data) = msg.data {
                    if let Ok(resp) = serde_json::from_value::<QueryResponse>(data) {
                        self.query.handle_response(resp);
                    }
                }
            }
            other => debug!(kind = other, "unknown mesh message type"),
        }
    }

    fn handle_publish(&self, topic: &str, data: serde_json::Value) {
        match topic {
            TOPIC_TRANSACTIONS => {
                let tx: Transaction = match serde_json::from_value(data) {
                    Ok(tx) => tx,
                    Err(e) => {
                        debug!(error = %e, "undecodable mesh transaction dropped");
                        return;
                    }
                };
                match self.admission.submit(tx) {
                    Ok(hash) => debug!(%hash, "mesh transaction admitted"),
                    // Gossip echoes of known transactions are expected.
                    Err(ChainError::Duplicate(_)) => {}
                    Err(e) => debug!(error = %e, "mesh transaction rejected"),
                }
            }
            TOPIC_BLOCKS => {
                // The mesh is a gossip path, not an authority: observed
                // blocks are logged and left to the BFT driver.
                let height = data
                    .get("header")
                    .and_then(|h| h.get("height"))
                    .and_then(|h| h.as_u64());
                let local = self.db.latest_height().unwrap_or(0);
                match height {
                    Some(h) if h > local => {
                        info!(height = h, local, "mesh block ahead of local chain (driver will sync)");
                    }
                    Some(h) => debug!(height = h, local, "stale mesh block dropped"),
                    None => debug!("mesh block without height dropped"),
                }
            }
            TOPIC_VALIDATORS => {
                // Set mutations only happen through the state-machine path.
                info!("validator update observed on mesh");
            }
            TOPIC_QUERY => {
                if let Ok(req) = serde_json::from_value::<QueryRequest>(data) {
                    self.query.handle_query(req);
                }
            }
            TOPIC_RESPONSE => {
                if let Ok(resp) = serde_json::from_value::<QueryResponse>(data) {
                    self.query.handle_response(resp);
                }
            }
            other => debug!(topic = other, "message on unknown topic dropped"),
        }
    }
}

pub struct MeshBridge {
    endpoint: String,
    outbound: mpsc::Receiver<MeshMessage>,
    handler: InboundHandler,
    metrics: Arc<Metrics>,
    health: Arc<HealthFlags>,
}

impl MeshBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: String,
        outbound: mpsc::Receiver<MeshMessage>,
        publisher: MeshPublisher,
        admission: Arc<AdmissionController>,
        query: Arc<QueryHandler>,
        db: Arc<ChainDb>,
        metrics: Arc<Metrics>,
        health: Arc<HealthFlags>,
    ) -> Self {
        Self {
            endpoint,
            outbound,
            handler: InboundHandler {
                publisher,
                admission,
                query,
                db,
                metrics: metrics.clone(),
            },
            metrics,
            health,
        }
    }

    /// Connect-and-serve until the root token cancels.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut failures = 0usize;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let connect = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                tokio_tungstenite::connect_async(self.endpoint.as_str()),
            );
            match connect.await {
                Ok(Ok((ws, _))) => {
                    info!(endpoint = %self.endpoint, "mesh connected");
                    failures = 0;
                    self.health.mesh_connected.store(true, Ordering::Relaxed);
                    let end = self.session(ws, &cancel).await;
                    self.health.mesh_connected.store(false, Ordering::Relaxed);
                    inc(&self.metrics.mesh_reconnects);
                    if matches!(end, SessionEnd::Cancelled) {
                        return;
                    }
                    warn!(endpoint = %self.endpoint, "mesh disconnected, will reconnect");
                }
                Ok(Err(e)) => {
                    failures += 1;
                    debug!(error = %e, attempt = failures, "mesh connect failed");
                }
                Err(_) => {
                    failures += 1;
                    debug!(attempt = failures, "mesh handshake timed out");
                }
            }

            if failures == BACKOFF_LADDER_SECS.len() {
                warn!(
                    endpoint = %self.endpoint,
                    attempts = failures,
                    "mesh unreachable, retrying in background"
                );
            }
            let idx = failures.saturating_sub(1).min(BACKOFF_LADDER_SECS.len() - 1);
            let delay = Duration::from_secs(BACKOFF_LADDER_SECS[idx]);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(&mut self, ws: WsStream, cancel: &CancellationToken) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        // Disjoint borrows: the select below needs the outbound receiver
        // mutably and the handler/metrics immutably.
        let outbound = &mut self.outbound;
        let handler = self.handler.clone();
        let metrics = self.metrics.clone();

        for topic in ALL_TOPICS {
            let msg = MeshMessage::subscribe(topic);
            let text = serde_json::to_string(&msg).unwrap_or_default();
            if write.send(Message::Text(text)).await.is_err() {
                return SessionEnd::Disconnected;
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // the interval fires immediately once

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                inbound = read.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => handler.handle(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Disconnected,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "mesh read error");
                            return SessionEnd::Disconnected;
                        }
                    }
                }
                msg = outbound.recv() => {
                    let Some(msg) = msg else { return SessionEnd::Disconnected };
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if write.send(Message::Text(text)).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                    inc(&metrics.mesh_messages_out);
                }
                _ = heartbeat.tick() => {
                    let ping = serde_json::to_string(&MeshMessage::control(MSG_PING))
                        .unwrap_or_default();
                    if write.send(Message::Text(ping)).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
            }
        }
    }
}
