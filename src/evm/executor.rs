//! Deterministic transaction execution at the London fork set.
//!
//! Every input flows through the block context and the state manager; the
//! executor never reads the clock or OS randomness, so two nodes replaying
//! the same ordered transactions converge on the same state root.

use revm::primitives::{BlockEnv, CfgEnv, Env, ExecutionResult as RevmResult, Output, SpecId, TransactTo, TxEnv, U256};
use revm::Evm;

use crate::error::ChainError;
use crate::evm::db::{from_revm_addr, to_revm_addr, StateDb};
use crate::state::StateManager;
use crate::types::{Address, Hash32, LogRecord, Transaction};

/// Per-block execution environment supplied by the consensus driver.
#[derive(Clone, Debug)]
pub struct BlockContext {
    pub height: u64,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub chain_id: u64,
}

#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub gas_used: u64,
    pub return_data: Vec<u8>,
    pub logs: Vec<LogRecord>,
    pub created_address: Option<Address>,
    pub error: Option<String>,
}

/// Execute one authenticated transaction against the live state.
///
/// Economic rejections surface as errors so callers can refuse the
/// transaction before it enters a block; EVM-level failures (revert, halt,
/// internal error) come back as a failed [`ExecutionResult`] with the nonce
/// bump and gas charge retained.
pub fn execute_transaction(
    state: &mut StateManager,
    tx: &Transaction,
    ctx: &BlockContext,
) -> Result<ExecutionResult, ChainError> {
    let stored_nonce = state.nonce(&tx.from);
    if tx.nonce != stored_nonce {
        return Err(ChainError::InvalidNonce { expected: stored_nonce, got: tx.nonce });
    }

    let balance = state.balance(&tx.from);
    let required = tx.upfront_cost();
    if balance < required {
        return Err(ChainError::InsufficientFunds { balance, required });
    }

    let cp = state.checkpoint();

    let outcome = {
        let mut db = StateDb::new(state);
        let mut evm = Evm::builder()
            .with_db(&mut db)
            .with_env(Box::new(build_env(tx, ctx)))
            .with_spec_id(SpecId::LONDON)
            .build();
        evm.transact_commit()
    };

    match outcome {
        Ok(result) => {
            state.release(cp);
            Ok(map_result(result))
        }
        Err(e) => {
            // Hard EVM error: no state writes survive, but the sender keeps
            // the nonce bump and loses the gas it offered.
            state.revert_to(cp);
            let mut account = state.account(&tx.from).cloned().unwrap_or_default();
            account.nonce = account.nonce.saturating_add(1);
            let gas_cost = (tx.gas_limit as u128).saturating_mul(tx.gas_price);
            account.balance = account.balance.saturating_sub(gas_cost);
            state.set_account(tx.from, account);

            Ok(ExecutionResult {
                success: false,
                gas_used: tx.gas_limit,
                return_data: vec![],
                logs: vec![],
                created_address: None,
                error: Some(format!("evm: {e:?}")),
            })
        }
    }
}

fn build_env(tx: &Transaction, ctx: &BlockContext) -> Env {
    let mut env = Env::default();
    env.cfg = CfgEnv::default();
    env.cfg.chain_id = ctx.chain_id;
    env.block = BlockEnv {
        number: U256::from(ctx.height),
        timestamp: U256::from(ctx.timestamp),
        gas_limit: U256::from(ctx.gas_limit),
        basefee: U256::ZERO,
        ..Default::default()
    };

    let mut tx_env = TxEnv::default();
    tx_env.caller = to_revm_addr(&tx.from);
    tx_env.gas_limit = tx.gas_limit;
    tx_env.gas_price = U256::from(tx.gas_price);
    tx_env.value = U256::from(tx.value);
    tx_env.nonce = Some(tx.nonce);
    tx_env.chain_id = Some(ctx.chain_id);
    tx_env.transact_to = match &tx.to {
        Some(to) => TransactTo::Call(to_revm_addr(to)),
        None => TransactTo::Create,
    };
    tx_env.data = revm::primitives::Bytes::copy_from_slice(&tx.data);
    env.tx = tx_env;
    env
}

fn map_result(result: RevmResult) -> ExecutionResult {
    match result {
        RevmResult::Success { gas_used, output, logs, .. } => {
            let (return_data, created_address) = match output {
                Output::Call(bytes) => (bytes.to_vec(), None),
                Output::Create(bytes, addr) => (bytes.to_vec(), addr.map(from_revm_addr)),
            };
            ExecutionResult {
                success: true,
                gas_used,
                return_data,
                logs: logs.iter().map(map_log).collect(),
                created_address,
                error: None,
            }
        }
        RevmResult::Revert { gas_used, output } => ExecutionResult {
            success: false,
            gas_used,
            return_data: output.to_vec(),
            logs: vec![],
            created_address: None,
            error: Some("execution reverted".into()),
        },
        RevmResult::Halt { gas_used, reason } => ExecutionResult {
            success: false,
            gas_used,
            return_data: vec![],
            logs: vec![],
            created_address: None,
            error: Some(format!("halted: {reason:?}")),
        },
    }
}

fn map_log(log: &revm::primitives::Log) -> LogRecord {
    LogRecord {
        address: from_revm_addr(log.address),
        topics: log
            .data
            .topics()
            .iter()
            .map(|t| {
                let mut out = [0u8; 32];
                out.copy_from_slice(t.as_slice());
                Hash32(out)
            })
            .collect(),
        data: log.data.data.to_vec(),
    }
}
