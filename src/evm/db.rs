//! `StateDb` — the bridge between the chain's account state and revm.
//!
//! Reads go straight to the [`StateManager`] working view; writes arrive in
//! one shot through `DatabaseCommit::commit` after revm has journaled and
//! (if needed) reverted internally, so a failed call never touches the
//! manager.  The enclosing executor wraps the whole execution in a manager
//! checkpoint for the hard-error path.

use std::convert::Infallible;

use revm::primitives::{
    Account as RevmAccount, AccountInfo, Address as RevmAddress, Bytecode, B256, KECCAK_EMPTY,
    U256,
};
use revm::{Database, DatabaseCommit};

use crate::state::{Account, StateManager};
use crate::types::{Address, Hash32};

pub fn to_revm_addr(addr: &Address) -> RevmAddress {
    RevmAddress::from_slice(&addr.0)
}

pub fn from_revm_addr(addr: RevmAddress) -> Address {
    let mut out = [0u8; 20];
    out.copy_from_slice(addr.as_slice());
    Address(out)
}

pub struct StateDb<'a> {
    state: &'a mut StateManager,
}

impl<'a> StateDb<'a> {
    pub fn new(state: &'a mut StateManager) -> Self {
        Self { state }
    }
}

impl<'a> Database for StateDb<'a> {
    type Error = Infallible;

    fn basic(&mut self, address: RevmAddress) -> Result<Option<AccountInfo>, Self::Error> {
        let addr = from_revm_addr(address);
        let account = self.state.account(&addr).cloned().unwrap_or_default();

        let code = if account.code.is_empty() {
            Bytecode::new()
        } else {
            Bytecode::new_raw(revm::primitives::Bytes::copy_from_slice(&account.code))
        };
        let code_hash = if account.code.is_empty() {
            KECCAK_EMPTY
        } else {
            B256::from_slice(&account.code_hash().0)
        };

        Ok(Some(AccountInfo {
            balance: U256::from(account.balance),
            nonce: account.nonce,
            code_hash,
            code: Some(code),
        }))
    }

    fn code_by_hash(&mut self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::new());
        }
        // Code is stored inline per account; a linear scan is fine at this
        // state size and revm rarely takes this path when `basic` returns
        // the code eagerly.
        let mut want = [0u8; 32];
        want.copy_from_slice(code_hash.as_slice());
        for (_, account) in self.state.accounts_iter() {
            if !account.code.is_empty() && account.code_hash() == Hash32(want) {
                return Ok(Bytecode::new_raw(revm::primitives::Bytes::copy_from_slice(
                    &account.code,
                )));
            }
        }
        Ok(Bytecode::new())
    }

    fn storage(&mut self, address: RevmAddress, index: U256) -> Result<U256, Self::Error> {
        let addr = from_revm_addr(address);
        let slot = Hash32(index.to_be_bytes());
        let value = self.state.storage(&addr, &slot);
        Ok(U256::from_be_bytes(value.0))
    }

    fn block_hash(&mut self, _number: U256) -> Result<B256, Self::Error> {
        // No block-hash history index; BLOCKHASH observes zero.
        Ok(B256::ZERO)
    }
}

impl<'a> DatabaseCommit for StateDb<'a> {
    fn commit(&mut self, changes: revm::primitives::State) {
        for (revm_addr, change) in changes {
            if !change.is_touched() {
                continue;
            }
            let addr = from_revm_addr(revm_addr);

            if change.is_selfdestructed() {
                self.state.delete_account(&addr);
                continue;
            }

            let mut account = self.state.account(&addr).cloned().unwrap_or_default();
            apply_info(&mut account, &change);
            for (slot, value) in &change.storage {
                let key = Hash32(slot.to_be_bytes());
                let present = Hash32(value.present_value.to_be_bytes());
                if present.is_zero() {
                    account.storage.remove(&key);
                } else {
                    account.storage.insert(key, present);
                }
            }
            self.state.set_account(addr, account);
        }
    }
}

fn apply_info(account: &mut Account, change: &RevmAccount) {
    account.balance = change.info.balance.saturating_to::<u128>();
    account.nonce = change.info.nonce;
    if let Some(code) = &change.info.code {
        if !code.is_empty() {
            account.code = code.bytecode().to_vec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChainDb;
    use std::sync::Arc;

    fn manager() -> (tempfile::TempDir, StateManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChainDb::open(dir.path()).unwrap());
        (dir, StateManager::new(db))
    }

    #[test]
    fn basic_reflects_manager_state() {
        let (_dir, mut sm) = manager();
        let addr = Address([0xAA; 20]);
        sm.set_account(addr, Account { balance: 123, nonce: 4, ..Account::default() });

        let mut db = StateDb::new(&mut sm);
        let info = db.basic(to_revm_addr(&addr)).unwrap().unwrap();
        assert_eq!(info.balance, U256::from(123u64));
        assert_eq!(info.nonce, 4);
        assert_eq!(info.code_hash, KECCAK_EMPTY);
    }

    #[test]
    fn storage_round_trips_through_revm_words() {
        let (_dir, mut sm) = manager();
        let addr = Address([0xAA; 20]);
        let slot = Hash32([0x01; 32]);
        let value = Hash32([0x02; 32]);
        sm.set_storage(addr, slot, value);

        let mut db = StateDb::new(&mut sm);
        let got = db
            .storage(to_revm_addr(&addr), U256::from_be_bytes(slot.0))
            .unwrap();
        assert_eq!(got, U256::from_be_bytes(value.0));
    }
}
