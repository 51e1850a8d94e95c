//! Log entry types.

use serde::{Deserialize, Serialize};
use tide_crypto::{Identity, Keypair};
use tide_types::{ContentHash, LamportClock};

use crate::error::{LogError, Result};

/// A single immutable entry of the log DAG.
///
/// `hash` is the BLAKE3 digest of the entry's canonical encoding (every
/// field except `hash` itself). The same bytes are what the content store
/// keeps, so an entry's store key is its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Content hash of the canonical encoding.
    pub hash: ContentHash,
    /// Writer of this entry.
    pub identity: Identity,
    /// Encoded [`Operation`], encrypted when the log has a shared key.
    pub payload: Vec<u8>,
    /// Writer's Lamport clock at append time.
    pub clock: LamportClock,
    /// Causal parents, sorted and de-duplicated.
    pub predecessors: Vec<ContentHash>,
    /// ed25519 signature over `(identity, payload, clock, predecessors)`.
    /// Stored as two 32-byte halves for serde compatibility.
    pub signature_r: [u8; 32],
    pub signature_s: [u8; 32],
}

/// Signed portion of an [`Entry`].
#[derive(Serialize)]
struct SignedContent<'a> {
    identity: &'a Identity,
    payload: &'a [u8],
    clock: &'a LamportClock,
    predecessors: &'a [ContentHash],
}

/// Canonical encoding of an [`Entry`] (excludes `hash`).
#[derive(Serialize)]
struct EncodedEntryRef<'a> {
    identity: &'a Identity,
    payload: &'a [u8],
    clock: &'a LamportClock,
    predecessors: &'a [ContentHash],
    signature_r: &'a [u8; 32],
    signature_s: &'a [u8; 32],
}

#[derive(Deserialize)]
struct EncodedEntry {
    identity: Identity,
    payload: Vec<u8>,
    clock: LamportClock,
    predecessors: Vec<ContentHash>,
    signature_r: [u8; 32],
    signature_s: [u8; 32],
}

impl Entry {
    /// Create a new signed entry.
    ///
    /// `predecessors` are sorted and de-duplicated before signing.
    pub fn new_signed(
        keypair: &Keypair,
        payload: Vec<u8>,
        clock: LamportClock,
        mut predecessors: Vec<ContentHash>,
    ) -> Result<Self> {
        predecessors.sort();
        predecessors.dedup();

        let identity = keypair.identity();
        let message = Self::signing_bytes(&identity, &payload, &clock, &predecessors)?;
        let sig = keypair.sign(&message);

        let mut signature_r = [0u8; 32];
        let mut signature_s = [0u8; 32];
        signature_r.copy_from_slice(&sig[..32]);
        signature_s.copy_from_slice(&sig[32..]);

        let mut entry = Self {
            hash: ContentHash::from([0u8; 32]),
            identity,
            payload,
            clock,
            predecessors,
            signature_r,
            signature_s,
        };
        entry.hash = ContentHash::from_data(&entry.to_bytes()?);
        Ok(entry)
    }

    /// Canonical encoding. `hash == blake3(to_bytes())`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let encoded = EncodedEntryRef {
            identity: &self.identity,
            payload: &self.payload,
            clock: &self.clock,
            predecessors: &self.predecessors,
            signature_r: &self.signature_r,
            signature_s: &self.signature_s,
        };
        Ok(postcard::to_allocvec(&encoded)?)
    }

    /// Decode an entry from its canonical bytes, computing its hash.
    ///
    /// Bytes that decode but are not canonical (unsorted or duplicated
    /// predecessors, trailing data) are rejected with
    /// [`LogError::InvalidHash`]: they would hash differently from the entry
    /// they describe.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let decoded: EncodedEntry = postcard::from_bytes(bytes)?;
        let entry = Self {
            hash: ContentHash::from_data(bytes),
            identity: decoded.identity,
            payload: decoded.payload,
            clock: decoded.clock,
            predecessors: decoded.predecessors,
            signature_r: decoded.signature_r,
            signature_s: decoded.signature_s,
        };

        let sorted = entry.predecessors.windows(2).all(|w| w[0] < w[1]);
        if !sorted || entry.to_bytes()? != bytes {
            return Err(LogError::InvalidHash);
        }
        Ok(entry)
    }

    /// Recompute the hash and compare it to the stored one.
    pub fn verify_hash(&self) -> bool {
        self.to_bytes()
            .map(|bytes| ContentHash::from_data(&bytes) == self.hash)
            .unwrap_or(false)
    }

    /// Reconstruct the 64-byte signature from its two halves.
    pub fn signature_bytes(&self) -> [u8; 64] {
        let mut sig = [0u8; 64];
        sig[..32].copy_from_slice(&self.signature_r);
        sig[32..].copy_from_slice(&self.signature_s);
        sig
    }

    /// Verify the writer's signature.
    ///
    /// Also fails when the clock is not owned by the signing identity.
    pub fn verify_signature(&self) -> Result<()> {
        if self.clock.owner != self.identity.id {
            return Err(LogError::InvalidSignature(format!(
                "clock owner {} is not the signer {}",
                self.clock.owner, self.identity.id
            )));
        }

        let message = Self::signing_bytes(
            &self.identity,
            &self.payload,
            &self.clock,
            &self.predecessors,
        )?;
        self.identity.verify(&message, &self.signature_bytes())?;
        Ok(())
    }

    fn signing_bytes(
        identity: &Identity,
        payload: &[u8],
        clock: &LamportClock,
        predecessors: &[ContentHash],
    ) -> Result<Vec<u8>> {
        let content = SignedContent {
            identity,
            payload,
            clock,
            predecessors,
        };
        Ok(postcard::to_allocvec(&content)?)
    }
}

/// Kind of log operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Append a value to the event log.
    Add,
}

/// Plaintext operation carried inside an entry's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpKind,
    pub value: Vec<u8>,
}

impl Operation {
    /// An `Add` operation carrying `value`.
    pub fn add(value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: OpKind::Add,
            value: value.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode an operation; trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (operation, rest) = postcard::take_from_bytes(bytes)?;
        if !rest.is_empty() {
            return Err(LogError::Encoding(format!(
                "{} trailing bytes after operation",
                rest.len()
            )));
        }
        Ok(operation)
    }
}

/// An accepted entry together with its decoded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub entry: Entry,
    pub operation: Operation,
}

impl Record {
    /// Hash of the underlying entry.
    pub fn hash(&self) -> ContentHash {
        self.entry.hash
    }

    /// Value carried by the operation.
    pub fn value(&self) -> &[u8] {
        &self.operation.value
    }

    /// Clock of the underlying entry.
    pub fn clock(&self) -> &LamportClock {
        &self.entry.clock
    }
}
