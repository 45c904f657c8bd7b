//! The consensus boundary: the application callback contract, the validator
//! set, and the adapter that owns the driver lifecycle.
//!
//! Only the driver's thread may call the mutating half of [`Application`]
//! (`begin_block`/`deliver_tx`/`end_block`/`commit`); everything else in the
//! process reads committed state through the KV store.

pub mod adapter;
pub mod app;
pub mod validators;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ChainError;
use crate::types::{Address, Hash32, Height};

/// Driver handshake info.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppInfo {
    pub last_height: Height,
    pub app_hash: Hash32,
}

/// Block header fields handed to `begin_block` by the driver.
#[derive(Clone, Debug)]
pub struct BlockHeaderInfo {
    pub height: Height,
    /// Unix seconds.
    pub timestamp: u64,
    pub proposer: Address,
}

/// A (consensus pubkey → voting power) delta; power 0 removes the key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatorUpdate {
    #[serde(with = "crate::types::hex_bytes")]
    pub pubkey: Vec<u8>,
    pub power: u64,
}

/// One event attribute set emitted by `deliver_tx`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default)]
pub struct DeliverOutcome {
    pub gas_used: u64,
    pub events: Vec<Event>,
}

/// Genesis document written by the adapter on first boot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Genesis {
    pub chain_id: String,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    /// Pre-funded accounts (address → balance in wei).
    #[serde(default)]
    pub alloc: BTreeMap<Address, u128>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    #[serde(with = "crate::types::hex_bytes")]
    pub pubkey: Vec<u8>,
    pub stake: u128,
}

/// The callback contract the BFT driver holds against the application.
///
/// Call order is `init_chain` once, then per block:
/// `begin_block → deliver_tx* → end_block → commit`.  `check_tx` and
/// `query` are read-only and legal whenever no block is open.  Out-of-order
/// calls are a driver bug and surface as the fatal
/// [`ChainError::ConsensusProtocolViolation`].
pub trait Application: Send {
    fn info(&self) -> AppInfo;
    fn init_chain(&mut self, genesis: &Genesis) -> Result<Vec<ValidatorUpdate>, ChainError>;
    fn check_tx(&self, bytes: &[u8]) -> Result<(), ChainError>;
    fn begin_block(&mut self, header: &BlockHeaderInfo) -> Result<(), ChainError>;
    fn deliver_tx(&mut self, bytes: &[u8]) -> Result<DeliverOutcome, ChainError>;
    fn end_block(&mut self, height: Height) -> Result<Vec<ValidatorUpdate>, ChainError>;
    fn commit(&mut self) -> Result<Hash32, ChainError>;
    fn query(&self, path: &str) -> Result<Vec<u8>, ChainError>;
}
