//! Transaction signing and verification (secp256k1 ECDSA with recovery).
//!
//! Signature format: 65 bytes `R‖S‖V` with `V ∈ {0,1,27,28}`, normalized to
//! 27/28 before recovery.  The signed message is the keccak-256 canonical
//! transaction hash.  Verification succeeds iff the recovered key derives to
//! the declared sender address.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};

use crate::error::ChainError;
use crate::types::{keccak256, Address, Transaction};

/// keccak(uncompressed_pubkey[1..])[12..], the Ethereum address derivation.
pub fn address_of(vk: &VerifyingKey) -> Address {
    let point = vk.to_encoded_point(false);
    // point bytes: 0x04 || X(32) || Y(32)
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Address(out)
}

/// Sign `tx` in place: fills the canonical hash and the 65-byte signature.
pub fn sign_transaction(tx: &mut Transaction, key: &SigningKey) -> Result<(), ChainError> {
    let hash = tx.canonical_hash();
    let (sig, recid) = key
        .sign_prehash_recoverable(&hash.0)
        .map_err(|_| ChainError::SignatureInvalid)?;

    let mut bytes = Vec::with_capacity(65);
    bytes.extend_from_slice(sig.to_bytes().as_slice());
    bytes.push(27 + recid.to_byte());

    tx.hash = hash;
    tx.signature = bytes;
    Ok(())
}

/// Recover the signer address from a transaction's signature.
pub fn recover_sender(tx: &Transaction) -> Result<Address, ChainError> {
    if tx.signature.len() != 65 {
        return Err(ChainError::SignatureInvalid);
    }

    let v = tx.signature[64];
    let v = if v < 27 { v + 27 } else { v };
    let recid = match v {
        27 | 28 => RecoveryId::from_byte(v - 27).ok_or(ChainError::SignatureInvalid)?,
        _ => return Err(ChainError::SignatureInvalid),
    };

    let sig =
        Signature::from_slice(&tx.signature[..64]).map_err(|_| ChainError::SignatureInvalid)?;

    let hash = tx.canonical_hash();
    let vk = VerifyingKey::recover_from_prehash(&hash.0, &sig, recid)
        .map_err(|_| ChainError::SignatureInvalid)?;

    Ok(address_of(&vk))
}

/// Full verification: the carried hash matches the canonical hash, and the
/// signature recovers to the declared sender.  The two failure modes are
/// never conflated.
pub fn verify_transaction(tx: &Transaction) -> Result<(), ChainError> {
    let computed = tx.canonical_hash();
    if tx.hash != computed {
        return Err(ChainError::HashMismatch {
            declared: tx.hash.to_hex(),
            computed: computed.to_hex(),
        });
    }

    let recovered = recover_sender(tx)?;
    if recovered != tx.from {
        return Err(ChainError::SignatureInvalid);
    }
    Ok(())
}
