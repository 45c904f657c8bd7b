//! Validator set: staking, slashing, jailing and rotation.
//!
//! Every mutating operation persists the full set atomically under
//! `validators:set` before returning, so a crash can never observe a
//! half-applied stake change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::consensus::ValidatorUpdate;
use crate::error::ChainError;
use crate::storage::ChainDb;
use crate::types::Address;

/// 1 token = 10^18 wei; one unit of voting power per whole token staked.
pub const POWER_DENOMINATOR: u128 = 1_000_000_000_000_000_000;
/// Power clamp keeping any validator (and the set total) inside i64.
pub const MAX_VOTING_POWER: u64 = 1 << 30;

pub const DEFAULT_MIN_STAKE: u128 = POWER_DENOMINATOR;
pub const DEFAULT_MAX_VALIDATORS: usize = 100;

/// Misses before the set autonomously slashes for downtime.
const MISSED_BLOCKS_SLASH_THRESHOLD: u32 = 100;
const DOWNTIME_JAIL_SECS: u64 = 24 * 60 * 60;

pub fn voting_power(stake: u128) -> u64 {
    let power = stake / POWER_DENOMINATOR;
    if power >= MAX_VOTING_POWER as u128 {
        MAX_VOTING_POWER
    } else {
        power as u64
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    /// Ed25519 consensus key (32 bytes).
    #[serde(with = "crate::types::hex_bytes")]
    pub pubkey: Vec<u8>,
    pub stake: u128,
    pub power: u64,
    pub jailed: bool,
    /// Unix seconds; 0 when not jailed.
    pub jailed_until: u64,
    pub created_at: u64,
    pub last_active_at: u64,
    /// Consecutive missed blocks; reset on activity or downtime slash.
    pub missed_blocks: u32,
    pub total_missed: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorError {
    #[error("validator already registered: {0}")]
    AlreadyRegistered(Address),
    #[error("stake {stake} below minimum {min}")]
    BelowMinStake { stake: u128, min: u128 },
    #[error("validator set full and stake does not exceed the lowest-staked member")]
    SetFull,
    #[error("validator not found: {0}")]
    NotFound(Address),
    #[error("validator is jailed: {0}")]
    Jailed(Address),
    #[error("validator is not jailed: {0}")]
    NotJailed(Address),
    #[error("still jailed until {until}")]
    StillJailed { until: u64 },
    #[error("unstake would leave {remaining}, below minimum {min}")]
    WouldDropBelowMin { remaining: u128, min: u128 },
    #[error("storage: {0}")]
    Storage(String),
}

impl From<ChainError> for ValidatorError {
    fn from(e: ChainError) -> Self {
        ValidatorError::Storage(e.to_string())
    }
}

/// Persisted form: the registry plus the last (pubkey → power) view handed
/// to the driver, so `rotate` emits minimal diffs across restarts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PersistedSet {
    validators: BTreeMap<Address, Validator>,
    reported: BTreeMap<String, u64>,
}

pub struct ValidatorSet {
    db: Arc<ChainDb>,
    validators: BTreeMap<Address, Validator>,
    /// Last power view reported to the consensus driver, keyed by hex pubkey.
    reported: BTreeMap<String, u64>,
    min_stake: u128,
    max_validators: usize,
}

impl ValidatorSet {
    pub fn new(db: Arc<ChainDb>, min_stake: u128, max_validators: usize) -> Self {
        Self {
            db,
            validators: BTreeMap::new(),
            reported: BTreeMap::new(),
            min_stake,
            max_validators,
        }
    }

    pub fn open(db: Arc<ChainDb>) -> Result<Self, ValidatorError> {
        let mut set = Self::new(db, DEFAULT_MIN_STAKE, DEFAULT_MAX_VALIDATORS);
        set.load()?;
        Ok(set)
    }

    pub fn min_stake(&self) -> u128 {
        self.min_stake
    }

    pub fn load(&mut self) -> Result<(), ValidatorError> {
        if let Some(bytes) = self.db.validators_bytes()? {
            let persisted: PersistedSet = serde_json::from_slice(&bytes)
                .map_err(|e| ValidatorError::Storage(format!("validators:set: {e}")))?;
            self.validators = persisted.validators;
            self.reported = persisted.reported;
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), ValidatorError> {
        let persisted = PersistedSet {
            validators: self.validators.clone(),
            reported: self.reported.clone(),
        };
        let bytes = serde_json::to_vec(&persisted)
            .map_err(|e| ValidatorError::Storage(e.to_string()))?;
        self.db.put_validators(&bytes)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn get(&self, addr: &Address) -> Option<&Validator> {
        self.validators.get(addr)
    }

    /// Owned copy for read paths outside the driver thread.
    pub fn snapshot(&self) -> Vec<Validator> {
        self.validators.values().cloned().collect()
    }

    // ── mutations ────────────────────────────────────────────────────────

    pub fn register(
        &mut self,
        address: Address,
        pubkey: Vec<u8>,
        stake: u128,
        now: u64,
    ) -> Result<(), ValidatorError> {
        if self.validators.contains_key(&address) {
            return Err(ValidatorError::AlreadyRegistered(address));
        }
        if stake < self.min_stake {
            return Err(ValidatorError::BelowMinStake { stake, min: self.min_stake });
        }
        if self.validators.len() >= self.max_validators {
            let lowest = self
                .validators
                .values()
                .min_by(|a, b| a.stake.cmp(&b.stake).then(a.address.cmp(&b.address)))
                .map(|v| (v.address, v.stake))
                .expect("set full implies non-empty");
            if stake <= lowest.1 {
                return Err(ValidatorError::SetFull);
            }
            self.validators.remove(&lowest.0);
            info!(evicted = %lowest.0, stake = %lowest.1, "evicted lowest-staked validator");
        }

        self.validators.insert(
            address,
            Validator {
                address,
                pubkey,
                stake,
                power: voting_power(stake),
                jailed: false,
                jailed_until: 0,
                created_at: now,
                last_active_at: now,
                missed_blocks: 0,
                total_missed: 0,
            },
        );
        self.persist()?;
        info!(validator = %address, %stake, "validator registered");
        Ok(())
    }

    pub fn stake(&mut self, addr: &Address, amount: u128, now: u64) -> Result<(), ValidatorError> {
        let v = self.validators.get_mut(addr).ok_or(ValidatorError::NotFound(*addr))?;
        if v.jailed {
            return Err(ValidatorError::Jailed(*addr));
        }
        v.stake = v.stake.saturating_add(amount);
        v.power = voting_power(v.stake);
        v.last_active_at = now;
        self.persist()
    }

    pub fn unstake(&mut self, addr: &Address, amount: u128, now: u64) -> Result<(), ValidatorError> {
        let min = self.min_stake;
        let v = self.validators.get_mut(addr).ok_or(ValidatorError::NotFound(*addr))?;
        if v.jailed {
            return Err(ValidatorError::Jailed(*addr));
        }
        let remaining = v.stake.saturating_sub(amount);
        if remaining < min {
            return Err(ValidatorError::WouldDropBelowMin { remaining, min });
        }
        v.stake = remaining;
        v.power = voting_power(v.stake);
        v.last_active_at = now;
        self.persist()
    }

    /// Reduce stake by `percent` and jail until `now + jail_secs`.  Stake
    /// never increases and an existing later jail expiry is never shortened.
    /// Drops the validator entirely when the remainder falls below minimum.
    pub fn slash(
        &mut self,
        addr: &Address,
        percent: u8,
        jail_secs: u64,
        now: u64,
    ) -> Result<(), ValidatorError> {
        let min = self.min_stake;
        let v = self.validators.get_mut(addr).ok_or(ValidatorError::NotFound(*addr))?;

        let slashed = v.stake.saturating_mul(percent.min(100) as u128) / 100;
        v.stake = v.stake.saturating_sub(slashed);
        v.power = voting_power(v.stake);
        v.jailed = true;
        v.jailed_until = v.jailed_until.max(now.saturating_add(jail_secs));

        warn!(
            validator = %addr,
            %slashed,
            remaining = %v.stake,
            jailed_until = v.jailed_until,
            "validator slashed and jailed"
        );

        if v.stake < min {
            self.validators.remove(addr);
            warn!(validator = %addr, "validator evicted: stake below minimum after slash");
        }
        self.persist()
    }

    pub fn unjail(&mut self, addr: &Address, now: u64) -> Result<(), ValidatorError> {
        let v = self.validators.get_mut(addr).ok_or(ValidatorError::NotFound(*addr))?;
        if !v.jailed {
            return Err(ValidatorError::NotJailed(*addr));
        }
        if now < v.jailed_until {
            return Err(ValidatorError::StillJailed { until: v.jailed_until });
        }
        v.jailed = false;
        v.jailed_until = 0;
        v.missed_blocks = 0;
        info!(validator = %addr, "validator unjailed");
        self.persist()
    }

    /// Record participation for one block.  Every 100 consecutive misses the
    /// set autonomously slashes `min(50%, 5% per hundred)` with a 24 h jail
    /// and resets the consecutive counter.
    pub fn record_activity(
        &mut self,
        addr: &Address,
        missed: bool,
        now: u64,
    ) -> Result<(), ValidatorError> {
        let v = match self.validators.get_mut(addr) {
            Some(v) => v,
            None => return Ok(()),
        };
        v.last_active_at = now;

        if !missed {
            v.missed_blocks = 0;
            return self.persist();
        }

        v.missed_blocks += 1;
        v.total_missed += 1;

        if v.missed_blocks >= MISSED_BLOCKS_SLASH_THRESHOLD {
            let hundreds = (v.missed_blocks / MISSED_BLOCKS_SLASH_THRESHOLD) as u64;
            let percent = (5 * hundreds).min(50) as u8;
            v.missed_blocks = 0;
            warn!(validator = %addr, %percent, "downtime threshold hit, auto-slashing");
            return self.slash(addr, percent, DOWNTIME_JAIL_SECS, now);
        }
        self.persist()
    }

    // ── views ────────────────────────────────────────────────────────────

    /// Non-jailed validators at or above minimum stake, stake descending,
    /// address ascending on ties, capped at `max_validators`.
    pub fn active_set(&self) -> Vec<Validator> {
        let mut active: Vec<Validator> = self
            .validators
            .values()
            .filter(|v| !v.jailed && v.stake >= self.min_stake)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.stake.cmp(&a.stake).then(a.address.cmp(&b.address)));
        active.truncate(self.max_validators);
        active
    }

    /// Diff bringing the driver's (pubkey → power) view up to the current
    /// active set.  Departed keys are emitted with power 0.
    pub fn rotate(&mut self) -> Result<Vec<ValidatorUpdate>, ValidatorError> {
        for v in self.validators.values_mut() {
            v.power = voting_power(v.stake);
        }

        let current: BTreeMap<String, (Vec<u8>, u64)> = self
            .active_set()
            .into_iter()
            .map(|v| (hex::encode(&v.pubkey), (v.pubkey, v.power)))
            .collect();

        let mut updates = Vec::new();
        for (key, (pubkey, power)) in &current {
            if self.reported.get(key) != Some(power) {
                updates.push(ValidatorUpdate { pubkey: pubkey.clone(), power: *power });
            }
        }
        for key in self.reported.keys() {
            if !current.contains_key(key) {
                updates.push(ValidatorUpdate {
                    pubkey: hex::decode(key).unwrap_or_default(),
                    power: 0,
                });
            }
        }

        self.reported = current.into_iter().map(|(k, (_, p))| (k, p)).collect();
        self.persist()?;
        Ok(updates)
    }
}
