//! Deterministic authenticated root over the account/storage state.
//!
//! Keys follow Ethereum's secure-trie derivation: accounts hash under
//! `keccak(address)`, storage slots under `keccak(slot)`.  Account leaves
//! carry `rlp([nonce, balance, storage_root, code_hash])`.  The root is a
//! keccak-256 Merkle fold over the sorted leaf set with domain-separated
//! leaf/node hashing; the empty root is `keccak(0x80)` (the RLP empty
//! string, as in Ethereum's empty trie).

use std::collections::BTreeMap;

use crate::state::Account;
use crate::types::{keccak256, Address, Hash32};

/// keccak(0x80) — root of the empty trie.
pub fn empty_root() -> Hash32 {
    Hash32(keccak256(&[0x80]))
}

fn leaf_hash(key: &[u8; 32], value: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(1 + 32 + value.len());
    buf.push(0x00);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    keccak256(&buf)
}

fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 65];
    buf[0] = 0x01;
    buf[1..33].copy_from_slice(left);
    buf[33..].copy_from_slice(right);
    keccak256(&buf)
}

fn fold(leaves: &[[u8; 32]]) -> [u8; 32] {
    debug_assert!(!leaves.is_empty());
    if leaves.len() == 1 {
        return leaves[0];
    }
    let mid = leaves.len().next_power_of_two() / 2;
    let left = fold(&leaves[..mid]);
    let right = if leaves.len() > mid {
        fold(&leaves[mid..])
    } else {
        left
    };
    node_hash(&left, &right)
}

fn root_of_sorted(mut keyed: Vec<([u8; 32], [u8; 32])>) -> Hash32 {
    if keyed.is_empty() {
        return empty_root();
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    let leaves: Vec<[u8; 32]> = keyed.into_iter().map(|(_, leaf)| leaf).collect();
    Hash32(fold(&leaves))
}

/// Root over one account's storage slots.
pub fn storage_root(storage: &BTreeMap<Hash32, Hash32>) -> Hash32 {
    let keyed = storage
        .iter()
        .filter(|(_, v)| !v.is_zero())
        .map(|(slot, value)| {
            let key = keccak256(&slot.0);
            let mut s = rlp::RlpStream::new();
            append_trimmed(&mut s, &value.0);
            (key, leaf_hash(&key, &s.out()))
        })
        .collect();
    root_of_sorted(keyed)
}

/// `rlp([nonce, balance, storage_root, code_hash])` for one account.
pub fn account_rlp(account: &Account) -> Vec<u8> {
    let mut s = rlp::RlpStream::new_list(4);
    s.append(&account.nonce);
    append_trimmed(&mut s, &account.balance.to_be_bytes());
    s.append(&storage_root(&account.storage).0.as_slice());
    s.append(&account.code_hash().0.as_slice());
    s.out().to_vec()
}

/// Root over the full account set.
pub fn state_root<'a, I>(accounts: I) -> Hash32
where
    I: Iterator<Item = (&'a Address, &'a Account)>,
{
    let keyed = accounts
        .map(|(addr, account)| {
            let key = keccak256(&addr.0);
            (key, leaf_hash(&key, &account_rlp(account)))
        })
        .collect();
    root_of_sorted(keyed)
}

/// RLP integers drop leading zero bytes; a zero value encodes as 0u8.
fn append_trimmed(s: &mut rlp::RlpStream, be: &[u8]) {
    let trimmed: Vec<u8> = be.iter().skip_while(|b| **b == 0).cloned().collect();
    if trimmed.is_empty() {
        s.append(&0u8);
    } else {
        s.append(&trimmed.as_slice());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_is_keccak_of_rlp_empty_string() {
        // Well-known Ethereum constant.
        assert_eq!(
            empty_root().to_hex(),
            "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
        );
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let a = Address([1u8; 20]);
        let b = Address([2u8; 20]);
        let acct = Account { balance: 5, ..Account::default() };

        let mut m1 = BTreeMap::new();
        m1.insert(a, acct.clone());
        m1.insert(b, acct.clone());
        let mut m2 = BTreeMap::new();
        m2.insert(b, acct.clone());
        m2.insert(a, acct);

        assert_eq!(state_root(m1.iter()), state_root(m2.iter()));
    }

    #[test]
    fn root_tracks_balance_changes() {
        let a = Address([1u8; 20]);
        let mut m = BTreeMap::new();
        m.insert(a, Account { balance: 5, ..Account::default() });
        let r1 = state_root(m.iter());
        m.get_mut(&a).unwrap().balance = 6;
        let r2 = state_root(m.iter());
        assert_ne!(r1, r2);
    }

    #[test]
    fn zero_storage_slots_do_not_affect_root() {
        let mut s1 = BTreeMap::new();
        s1.insert(Hash32([1u8; 32]), Hash32([9u8; 32]));
        let mut s2 = s1.clone();
        s2.insert(Hash32([2u8; 32]), Hash32::zero());
        assert_eq!(storage_root(&s1), storage_root(&s2));
    }
}
