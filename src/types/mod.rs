//! Core chain data model.
//!
//! All hashing here is Keccak-256 over fixed binary layouts (domain tag +
//! length-prefixed fields).  Canonical hashes never depend on JSON encoding,
//! so serde/whitespace changes cannot move a transaction or block identity.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

pub type Height = u64;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut h = Keccak256::new();
    h.update(data);
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

// ── Address ──────────────────────────────────────────────────────────────

/// 20-byte account address, `0x`-hex at every string boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn zero() -> Self {
        Self([0u8; 20])
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Parse `0x`-prefixed or bare 40-char hex.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != 40 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Address::from_hex(&s).ok_or_else(|| serde::de::Error::custom("bad address hex"))
    }
}

// ── Hash32 ───────────────────────────────────────────────────────────────

/// 32-byte hash, `0x`-hex at every string boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != 64 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Hash32::from_hex(&s).ok_or_else(|| serde::de::Error::custom("bad hash hex"))
    }
}

/// serde helper: byte strings as `0x`-hex.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ── Transaction ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    /// Declared canonical hash; admission recomputes and compares.
    pub hash: Hash32,
    pub from: Address,
    /// `None` for contract creation.
    #[serde(default)]
    pub to: Option<Address>,
    pub value: u128,
    #[serde(with = "hex_bytes", default)]
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub nonce: u64,
    /// 65 bytes R‖S‖V.
    #[serde(with = "hex_bytes", default)]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Canonical sign-bytes: every field except the signature and the carried
    /// hash, in a fixed binary layout.
    ///
    /// Format: "oxy-tx-v1" || from(20) || to_len(1) || to(0|20) ||
    ///         value(16 LE) || gas_limit(8 LE) || gas_price(16 LE) ||
    ///         nonce(8 LE) || data_len(4 LE) || data
    pub fn sign_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + 20 + 21 + 16 + 8 + 16 + 8 + 4 + self.data.len());
        buf.extend_from_slice(b"oxy-tx-v1");
        buf.extend_from_slice(&self.from.0);
        match &self.to {
            Some(to) => {
                buf.push(20);
                buf.extend_from_slice(&to.0);
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf.extend_from_slice(&self.gas_limit.to_le_bytes());
        buf.extend_from_slice(&self.gas_price.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// The canonical transaction hash: keccak-256 of the sign-bytes.  Also
    /// the identity used for dedup and receipt lookup.
    pub fn canonical_hash(&self) -> Hash32 {
        Hash32(keccak256(&self.sign_bytes()))
    }

    /// Total wei the sender must hold up front.
    pub fn upfront_cost(&self) -> u128 {
        self.value
            .saturating_add((self.gas_limit as u128).saturating_mul(self.gas_price))
    }
}

// ── Receipt / logs ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRecord {
    pub address: Address,
    pub topics: Vec<Hash32>,
    #[serde(with = "hex_bytes", default)]
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: Hash32,
    pub block_height: Height,
    pub gas_used: u64,
    pub status: ReceiptStatus,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

// ── Block ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: Height,
    pub hash: Hash32,
    pub parent_hash: Hash32,
    /// Unix seconds, supplied by the consensus driver.
    pub timestamp: u64,
    pub chain_id: String,
    pub proposer: Address,
    pub state_root: Hash32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Index-aligned with `transactions`.
    pub receipts: Vec<Receipt>,
}

/// Deterministic block hash over the header fields that define the block's
/// position and contents.
///
/// Format: "oxy-blk-v1" || height(8 LE) || parent(32) || timestamp(8 LE) ||
///         chain_id_len(2 LE) || chain_id || proposer(20) || tx_root(32) ||
///         state_root(32)
pub fn block_hash(
    height: Height,
    parent_hash: &Hash32,
    timestamp: u64,
    chain_id: &str,
    proposer: &Address,
    tx_root: &Hash32,
    state_root: &Hash32,
) -> Hash32 {
    let cid = chain_id.as_bytes();
    let mut buf = Vec::with_capacity(10 + 8 + 32 + 8 + 2 + cid.len() + 20 + 32 + 32);
    buf.extend_from_slice(b"oxy-blk-v1");
    buf.extend_from_slice(&height.to_le_bytes());
    buf.extend_from_slice(&parent_hash.0);
    buf.extend_from_slice(&timestamp.to_le_bytes());
    buf.extend_from_slice(&(cid.len() as u16).to_le_bytes());
    buf.extend_from_slice(cid);
    buf.extend_from_slice(&proposer.0);
    buf.extend_from_slice(&tx_root.0);
    buf.extend_from_slice(&state_root.0);
    Hash32(keccak256(&buf))
}

/// keccak over the concatenated canonical tx hashes.
pub fn tx_root(txs: &[Transaction]) -> Hash32 {
    let mut h = Keccak256::new();
    h.update(b"oxy-txroot-v1");
    h.update((txs.len() as u32).to_le_bytes());
    for tx in txs {
        h.update(tx.canonical_hash().0);
    }
    let out = h.finalize();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    Hash32(arr)
}

/// Numeric chain id for the EVM environment, derived from the string chain
/// id so two chains with different ids can never replay each other's blocks.
pub fn chain_id_numeric(chain_id: &str) -> u64 {
    let h = keccak256(chain_id.as_bytes());
    u64::from_be_bytes(h[..8].try_into().expect("8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            hash: Hash32::zero(),
            from: Address([0xAA; 20]),
            to: Some(Address([0xBB; 20])),
            value: 1_000_000_000_000_000_000,
            data: vec![],
            gas_limit: 21_000,
            gas_price: 1_000_000_000,
            nonce: 0,
            signature: vec![],
        }
    }

    #[test]
    fn canonical_hash_ignores_signature_and_carried_hash() {
        let tx = sample_tx();
        let mut signed = tx.clone();
        signed.signature = vec![1u8; 65];
        signed.hash = Hash32([0xCC; 32]);
        assert_eq!(tx.canonical_hash(), signed.canonical_hash());
    }

    #[test]
    fn canonical_hash_covers_every_field() {
        let base = sample_tx();
        let mut variants = Vec::new();
        let mut t = base.clone();
        t.from = Address([0x01; 20]);
        variants.push(t);
        let mut t = base.clone();
        t.to = None;
        variants.push(t);
        let mut t = base.clone();
        t.value += 1;
        variants.push(t);
        let mut t = base.clone();
        t.data = vec![0x60];
        variants.push(t);
        let mut t = base.clone();
        t.gas_limit += 1;
        variants.push(t);
        let mut t = base.clone();
        t.gas_price += 1;
        variants.push(t);
        let mut t = base.clone();
        t.nonce += 1;
        variants.push(t);

        for v in variants {
            assert_ne!(base.canonical_hash(), v.canonical_hash());
        }
    }

    #[test]
    fn address_hex_round_trip() {
        let a = Address([0xAB; 20]);
        assert_eq!(Address::from_hex(&a.to_hex()), Some(a));
        assert_eq!(Address::from_hex("0x1234"), None);
        assert_eq!(Address::from_hex("zz"), None);
    }

    #[test]
    fn block_hash_chains_on_parent() {
        let parent = Hash32([1u8; 32]);
        let root = Hash32([2u8; 32]);
        let txr = Hash32::zero();
        let h1 = block_hash(1, &parent, 1000, "oxy-gen-chain", &Address::zero(), &txr, &root);
        let h2 = block_hash(1, &Hash32::zero(), 1000, "oxy-gen-chain", &Address::zero(), &txr, &root);
        assert_ne!(h1, h2);
    }

    #[test]
    fn upfront_cost_saturates() {
        let mut tx = sample_tx();
        tx.value = u128::MAX;
        assert_eq!(tx.upfront_cost(), u128::MAX);
    }
}
