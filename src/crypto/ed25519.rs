//! Ed25519 validator and node-identity keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::io::{self, Write};
use std::path::Path;

#[derive(Clone)]
pub struct Ed25519Keypair {
    sk: SigningKey,
}

impl Ed25519Keypair {
    pub fn generate() -> Self {
        let sk = SigningKey::generate(&mut OsRng);
        Self { sk }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { sk: SigningKey::from_bytes(&seed) }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.sk.verifying_key().to_bytes()
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.sk.sign(msg).to_bytes()
    }

    pub fn seed(&self) -> [u8; 32] {
        self.sk.to_bytes()
    }
}

pub fn verify(pubkey: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    vk.verify(msg, &Signature::from_bytes(sig)).is_ok()
}

/// Read a 32-byte seed from `path`, or generate one and persist it with
/// owner-only permissions.
pub fn load_or_generate(path: &Path) -> io::Result<Ed25519Keypair> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Ok(bytes) = std::fs::read(path) {
        if bytes.len() == 32 {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            return Ok(Ed25519Keypair::from_seed(seed));
        }
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("key file {} has {} bytes, want 32", path.display(), bytes.len()),
        ));
    }

    let kp = Ed25519Keypair::generate();
    let mut f = std::fs::File::create(path)?;
    f.write_all(&kp.seed())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(kp)
}
