//! Ed25519 identities.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tide_types::PeerId;

use crate::error::{CryptoError, Result};

/// A peer's signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministic keypair from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// The raw secret seed.
    pub fn to_seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Public identity of this keypair.
    pub fn identity(&self) -> Identity {
        Identity::from_public_key(self.signing_key.verifying_key().to_bytes())
    }

    /// Peer id of this keypair.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Public identity of a writer.
///
/// Compared by `id` for authorization checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Lowercase hex of `public_key`.
    pub id: String,
    /// Raw ed25519 public key.
    pub public_key: [u8; 32],
}

impl Identity {
    /// Build the identity for a public key.
    pub fn from_public_key(public_key: [u8; 32]) -> Self {
        Self {
            id: PeerId::from(public_key).to_string(),
            public_key,
        }
    }

    /// Peer id derived from the public key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.public_key)
    }

    /// Whether `id` really is the hex of `public_key`.
    pub fn is_consistent(&self) -> bool {
        self.id == self.peer_id().to_string()
    }

    /// Verify `signature` over `message` with this identity's key.
    ///
    /// Fails when the identity is inconsistent, the public key is not a
    /// valid curve point, or the signature does not verify.
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        if !self.is_consistent() {
            return Err(CryptoError::InvalidSignature(format!(
                "identity id {} does not match its public key",
                self.id
            )));
        }

        let verifying_key = VerifyingKey::from_bytes(&self.public_key)
            .map_err(|e| CryptoError::InvalidSignature(format!("bad public key: {e}")))?;

        verifying_key
            .verify(message, &Signature::from_bytes(signature))
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
