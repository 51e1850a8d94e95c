//! Shared types and identifiers for Tide.
//!
//! This crate defines the types used across the Tide workspace:
//! identifiers ([`ContentHash`], [`PeerId`], [`TopicId`]), the
//! [`LamportClock`] attached to every log entry, and the typed
//! [`EventBus`](events::EventBus) that logs use to report progress.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod events;

pub use events::{BusError, BusEvent, EventBus, Overflow, SubscribeOptions, Subscription};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Error returned when parsing a hex-encoded identifier fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    /// The string does not have exactly 64 hex characters.
    #[error("expected 64 hex characters, got {0}")]
    InvalidLength(usize),

    /// The string contains a non-hex character.
    #[error("invalid hex character at position {0}")]
    InvalidCharacter(usize),
}

/// Decode a 64-character hex string into 32 bytes.
fn decode_hex32(s: &str) -> Result<[u8; 32], ParseIdError> {
    if s.len() != 64 {
        return Err(ParseIdError::InvalidLength(s.len()));
    }

    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).map_err(|e| match e {
        hex::FromHexError::InvalidHexCharacter { index, .. } => {
            ParseIdError::InvalidCharacter(index)
        }
        hex::FromHexError::OddLength | hex::FromHexError::InvalidStringLength => {
            ParseIdError::InvalidLength(s.len())
        }
    })?;
    Ok(out)
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Short hex prefix for log output.
            pub fn fmt_short(&self) -> String {
                let mut s = self.to_string();
                s.truncate(10);
                s
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_hex32(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

define_id!(
    /// Content-addressed identifier: `blake3(bytes)`.
    ///
    /// Used as the key of the content-addressable store and as the hash of
    /// log entries and log manifests.
    ContentHash
);

define_id!(
    /// Identifier of a peer: the raw ed25519 public key of its identity.
    PeerId
);

define_id!(
    /// Identifier of a broadcast topic, derived from a log address.
    TopicId
);

impl TopicId {
    /// Derive the topic for a log address: `blake3(address)`.
    pub fn for_address(address: &str) -> Self {
        Self::from_data(address.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Lamport clock
// ---------------------------------------------------------------------------

/// Lamport clock attached to every log entry.
///
/// `time` strictly increases for each local append by `owner`. The clock is
/// only ever used as an ordering tie-break, never as proof of causality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LamportClock {
    /// Identity id of the writer that owns this clock.
    pub owner: String,
    /// Logical time.
    pub time: u64,
}

impl LamportClock {
    /// Create a clock for `owner` at `time`.
    pub fn new(owner: impl Into<String>, time: u64) -> Self {
        Self {
            owner: owner.into(),
            time,
        }
    }

    /// Return the next clock value for the same owner.
    pub fn tick(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            time: self.time + 1,
        }
    }

    /// Advance to at least `other`'s time, keeping our owner.
    pub fn merge(&self, other: &LamportClock) -> Self {
        Self {
            owner: self.owner.clone(),
            time: self.time.max(other.time),
        }
    }
}

impl PartialOrd for LamportClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LamportClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.owner.cmp(&other.owner))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
