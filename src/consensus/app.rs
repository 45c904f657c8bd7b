//! The application state machine behind the BFT driver callbacks.
//!
//! Single-writer: only the driver thread calls the block-mutating methods.
//! Commit is the one place state becomes visible — the block, its receipts,
//! the latest-height pointer and the state metadata land in one atomic
//! batch, so a crash either shows all of height `h` or none of it.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::consensus::validators::ValidatorSet;
use crate::consensus::{
    AppInfo, Application, BlockHeaderInfo, DeliverOutcome, Event, Genesis, ValidatorUpdate,
};
use crate::error::ChainError;
use crate::evm::{execute_transaction, BlockContext};
use crate::metrics::{inc, Metrics};
use crate::state::{Account, StateManager};
use crate::storage::{ChainDb, CommitBatch, StateMeta};
use crate::types::{
    block_hash, chain_id_numeric, tx_root, Address, Block, BlockHeader, Hash32, Height, Receipt,
    ReceiptStatus, Transaction,
};

const BLOCK_GAS_LIMIT: u64 = 30_000_000;
const ROTATION_INTERVAL: Height = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Ready,
    InBlock,
    EndPending,
}

/// Account view returned by `query("account/..")` and the REST surface.
/// Balances serialize as decimal strings so JSON consumers never round.
#[derive(Serialize)]
pub struct AccountView {
    pub address: Address,
    pub balance: String,
    pub nonce: u64,
    pub code_hash: Hash32,
}

impl AccountView {
    pub fn new(address: Address, account: &Account) -> Self {
        Self {
            address,
            balance: account.balance.to_string(),
            nonce: account.nonce,
            code_hash: account.code_hash(),
        }
    }
}

pub struct App {
    db: Arc<ChainDb>,
    state: StateManager,
    validators: Arc<Mutex<ValidatorSet>>,
    metrics: Arc<Metrics>,
    chain_id: String,
    chain_id_num: u64,

    phase: Phase,
    /// Last committed height; 0 before the first block.
    height: Height,
    app_hash: Hash32,

    // block under assembly
    block_height: Height,
    block_time: u64,
    block_proposer: Address,
    block_txs: Vec<Transaction>,
    block_receipts: Vec<Receipt>,
}

impl App {
    /// Open the application over an existing store, resuming from the
    /// persisted state metadata when present.
    pub fn open(
        db: Arc<ChainDb>,
        validators: Arc<Mutex<ValidatorSet>>,
        metrics: Arc<Metrics>,
        chain_id: String,
    ) -> Result<Self, ChainError> {
        let mut state = StateManager::new(db.clone());
        let (height, app_hash) = match db.state_meta() {
            Ok(meta) => {
                state.load(meta.root)?;
                (meta.height, meta.root)
            }
            Err(ChainError::NotFound(_)) => (0, Hash32::zero()),
            Err(e) => return Err(e),
        };

        let chain_id_num = chain_id_numeric(&chain_id);
        Ok(Self {
            db,
            state,
            validators,
            metrics,
            chain_id,
            chain_id_num,
            phase: Phase::Ready,
            height,
            app_hash,
            block_height: 0,
            block_time: 0,
            block_proposer: Address::zero(),
            block_txs: Vec::new(),
            block_receipts: Vec::new(),
        })
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn expect_phase(&self, want: Phase, call: &str) -> Result<(), ChainError> {
        if self.phase != want {
            return Err(ChainError::ConsensusProtocolViolation(format!(
                "{call} in phase {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    /// Full stateless-plus-read-only validation shared by `check_tx` and
    /// mempool admission: decode is the caller's job, this checks crypto and
    /// the committed-economics constraints.
    fn validate(&self, tx: &Transaction) -> Result<(), ChainError> {
        crate::crypto::verify_transaction(tx)?;

        let stored_nonce = self.state.nonce(&tx.from);
        if tx.nonce < stored_nonce {
            return Err(ChainError::InvalidNonce { expected: stored_nonce, got: tx.nonce });
        }
        let balance = self.state.balance(&tx.from);
        let required = tx.upfront_cost();
        if balance < required {
            return Err(ChainError::InsufficientFunds { balance, required });
        }
        Ok(())
    }

    fn parent_hash(&self, height: Height) -> Result<Hash32, ChainError> {
        if height <= 1 {
            return Ok(Hash32::zero());
        }
        match self.db.block(height - 1) {
            Ok(parent) => Ok(parent.header.hash),
            Err(ChainError::NotFound(_)) => Ok(Hash32::zero()),
            Err(e) => Err(e),
        }
    }
}

impl Application for App {
    fn info(&self) -> AppInfo {
        AppInfo { last_height: self.height, app_hash: self.app_hash }
    }

    fn init_chain(&mut self, genesis: &Genesis) -> Result<Vec<ValidatorUpdate>, ChainError> {
        self.expect_phase(Phase::Ready, "init_chain")?;
        info!(chain_id = %genesis.chain_id, validators = genesis.validators.len(), "initializing chain");

        for (addr, balance) in &genesis.alloc {
            self.state
                .set_account(*addr, Account { balance: *balance, ..Account::default() });
        }
        // Persist the allocations now so admission (which reads committed
        // state) accepts spends from genesis accounts before block 1.
        // Idempotent: a crash before the first commit re-runs init_chain and
        // rewrites the same records.
        let mut batch = CommitBatch::new();
        self.app_hash = self.state.commit(&mut batch)?;
        self.db.commit(batch)?;

        let mut validators = self.validators.lock();
        // A persisted non-empty set wins over the genesis entries.
        if validators.is_empty() {
            for gv in &genesis.validators {
                validators
                    .register(gv.address, gv.pubkey.clone(), gv.stake, 0)
                    .map_err(|e| ChainError::Decode(format!("genesis validator: {e}")))?;
            }
        }
        validators
            .rotate()
            .map_err(|e| ChainError::StorageCorrupt(e.to_string()))
    }

    fn check_tx(&self, bytes: &[u8]) -> Result<(), ChainError> {
        let tx: Transaction =
            serde_json::from_slice(bytes).map_err(|e| ChainError::Decode(e.to_string()))?;
        self.validate(&tx)
    }

    fn begin_block(&mut self, header: &BlockHeaderInfo) -> Result<(), ChainError> {
        self.expect_phase(Phase::Ready, "begin_block")?;
        debug!(height = header.height, "begin block");

        self.block_height = header.height;
        self.block_time = header.timestamp;
        self.block_proposer = header.proposer;
        self.block_txs.clear();
        self.block_receipts.clear();
        self.phase = Phase::InBlock;
        Ok(())
    }

    fn deliver_tx(&mut self, bytes: &[u8]) -> Result<DeliverOutcome, ChainError> {
        self.expect_phase(Phase::InBlock, "deliver_tx")?;

        let tx: Transaction =
            serde_json::from_slice(bytes).map_err(|e| ChainError::Decode(e.to_string()))?;

        let ctx = BlockContext {
            height: self.block_height,
            timestamp: self.block_time,
            gas_limit: BLOCK_GAS_LIMIT,
            chain_id: self.chain_id_num,
        };

        // Economic rejections exclude the transaction from the block;
        // EVM-level failures are included with a failed receipt so the
        // tx/receipt buffers stay index-aligned.
        let result = execute_transaction(&mut self.state, &tx, &ctx)?;

        self.db.put_transaction(&tx)?;

        let receipt = Receipt {
            tx_hash: tx.hash,
            block_height: self.block_height,
            gas_used: result.gas_used,
            status: if result.success { ReceiptStatus::Success } else { ReceiptStatus::Failed },
            logs: result.logs.clone(),
            error: result.error.clone(),
        };

        if result.success {
            inc(&self.metrics.txs_executed);
        } else {
            inc(&self.metrics.txs_failed);
            debug!(tx = %tx.hash, error = ?result.error, "transaction failed in block");
        }

        let mut events = vec![Event {
            kind: "execution".into(),
            attributes: vec![
                ("success".into(), result.success.to_string()),
                ("gas_used".into(), result.gas_used.to_string()),
            ],
        }];
        for log in &result.logs {
            events.push(Event {
                kind: "contract_log".into(),
                attributes: vec![("address".into(), log.address.to_hex())],
            });
        }

        self.block_txs.push(tx);
        self.block_receipts.push(receipt);

        Ok(DeliverOutcome { gas_used: result.gas_used, events })
    }

    fn end_block(&mut self, height: Height) -> Result<Vec<ValidatorUpdate>, ChainError> {
        self.expect_phase(Phase::InBlock, "end_block")?;
        if height != self.block_height {
            return Err(ChainError::ConsensusProtocolViolation(format!(
                "end_block({height}) while assembling block {}",
                self.block_height
            )));
        }
        self.phase = Phase::EndPending;

        if height > 0 && height % ROTATION_INTERVAL == 0 {
            let updates = self
                .validators
                .lock()
                .rotate()
                .map_err(|e| ChainError::StorageCorrupt(e.to_string()))?;
            info!(height, updates = updates.len(), "validator set rotated");
            return Ok(updates);
        }
        Ok(Vec::new())
    }

    fn commit(&mut self) -> Result<Hash32, ChainError> {
        self.expect_phase(Phase::EndPending, "commit")?;
        debug_assert_eq!(self.block_txs.len(), self.block_receipts.len());

        let mut batch = CommitBatch::new();
        let state_root = self.state.commit(&mut batch)?;

        let parent_hash = self.parent_hash(self.block_height)?;
        let txs_root = tx_root(&self.block_txs);
        let hash = block_hash(
            self.block_height,
            &parent_hash,
            self.block_time,
            &self.chain_id,
            &self.block_proposer,
            &txs_root,
            &state_root,
        );

        let block = Block {
            header: BlockHeader {
                height: self.block_height,
                hash,
                parent_hash,
                timestamp: self.block_time,
                chain_id: self.chain_id.clone(),
                proposer: self.block_proposer,
                state_root,
            },
            transactions: std::mem::take(&mut self.block_txs),
            receipts: std::mem::take(&mut self.block_receipts),
        };

        batch.put_block(&block)?;
        for tx in &block.transactions {
            batch.put_transaction(tx)?;
        }
        batch.put_latest_height(self.block_height);
        batch.put_state_meta(&StateMeta { root: state_root, height: self.block_height })?;
        self.db.commit(batch)?;

        self.height = self.block_height;
        self.app_hash = state_root;
        self.phase = Phase::Ready;
        inc(&self.metrics.blocks_committed);
        info!(
            height = self.height,
            hash = %hash,
            txs = block.transactions.len(),
            "block committed"
        );
        Ok(self.app_hash)
    }

    fn query(&self, path: &str) -> Result<Vec<u8>, ChainError> {
        match path {
            "height" | "status" => Ok(self.height.to_string().into_bytes()),
            _ if path.starts_with("balance/") => {
                let addr = Address::from_hex(&path["balance/".len()..])
                    .ok_or_else(|| ChainError::Decode(format!("bad address in {path}")))?;
                let balance = self.state.balance(&addr);
                Ok(serde_json::to_vec(&serde_json::json!({
                    "address": addr,
                    "balance": balance.to_string(),
                }))?)
            }
            _ if path.starts_with("account/") => {
                let addr = Address::from_hex(&path["account/".len()..])
                    .ok_or_else(|| ChainError::Decode(format!("bad address in {path}")))?;
                let account = self.state.account(&addr).cloned().unwrap_or_default();
                Ok(serde_json::to_vec(&AccountView::new(addr, &account))?)
            }
            _ if path.starts_with("tx/") => {
                let hash = Hash32::from_hex(&path["tx/".len()..])
                    .ok_or_else(|| ChainError::Decode(format!("bad hash in {path}")))?;
                self.db.transaction_bytes(&hash)
            }
            _ if path.starts_with("block/") => {
                let height: Height = path["block/".len()..]
                    .parse()
                    .map_err(|_| ChainError::Decode(format!("bad height in {path}")))?;
                self.db.block_bytes(height)
            }
            other => Err(ChainError::Decode(format!("unknown query path: {other}"))),
        }
    }
}
