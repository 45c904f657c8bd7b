use thiserror::Error;

/// Error taxonomy shared across the node.
///
/// Admission errors are returned to the caller verbatim.  Execution failures
/// are *not* errors: they become a `failed` receipt.  `StorageCorrupt`,
/// `TrieCorrupt` and `ConsensusProtocolViolation` are fatal; the node halts
/// rather than risk producing a divergent state root.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("decode: {0}")]
    Decode(String),

    #[error("invalid signature")]
    SignatureInvalid,

    #[error("transaction hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },

    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: u128, required: u128 },

    #[error("rate limit exceeded for sender {0}")]
    RateLimited(String),

    #[error("mempool full")]
    MempoolFull,

    #[error("duplicate transaction {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("state trie corrupt: {0}")]
    TrieCorrupt(String),

    #[error("consensus protocol violation: {0}")]
    ConsensusProtocolViolation(String),

    #[error("transient: {0}")]
    Transient(String),
}

impl ChainError {
    /// Fatal errors must halt the process instead of being retried or
    /// converted into receipts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainError::StorageCorrupt(_)
                | ChainError::TrieCorrupt(_)
                | ChainError::ConsensusProtocolViolation(_)
        )
    }
}

impl From<sled::Error> for ChainError {
    fn from(e: sled::Error) -> Self {
        ChainError::StorageCorrupt(e.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(e: serde_json::Error) -> Self {
        ChainError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ChainError::StorageCorrupt("x".into()).is_fatal());
        assert!(ChainError::TrieCorrupt("x".into()).is_fatal());
        assert!(ChainError::ConsensusProtocolViolation("x".into()).is_fatal());
        assert!(!ChainError::MempoolFull.is_fatal());
        assert!(!ChainError::Duplicate("h".into()).is_fatal());
    }
}
