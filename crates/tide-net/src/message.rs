//! Protocol messages for log replication.
//!
//! All messages are postcard-encoded. Entries travel as their canonical
//! bytes so the receiver can check them against the hashes it asked for.

use serde::{Deserialize, Serialize};
use tide_types::ContentHash;

use crate::error::NetError;

/// Maximum encoded size of a single message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Messages exchanged between peers replicating one log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogMessage {
    /// Head announcement: "my log currently ends at these entries".
    Heads {
        heads: Vec<ContentHash>,
    },

    /// Ask for entries and their ancestors.
    ///
    /// The responder walks back from `hashes`, stops at `have` (the
    /// requester's heads) and returns at most `limit` entries.
    EntryRequest {
        hashes: Vec<ContentHash>,
        have: Vec<ContentHash>,
        limit: u32,
    },

    /// Response to [`LogMessage::EntryRequest`]: canonical entry bytes,
    /// parents before children.
    EntryResponse {
        entries: Vec<Vec<u8>>,
    },

    /// Ask for a log manifest by hash.
    ManifestRequest {
        manifest: ContentHash,
    },

    /// Response to [`LogMessage::ManifestRequest`], `None` if unknown.
    ManifestResponse {
        manifest: Option<Vec<u8>>,
    },
}

impl LogMessage {
    /// Encode, enforcing [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        let bytes = postcard::to_allocvec(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Decode, enforcing [`MAX_MESSAGE_SIZE`].
    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Short name for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            LogMessage::Heads { .. } => "heads",
            LogMessage::EntryRequest { .. } => "entry_request",
            LogMessage::EntryResponse { .. } => "entry_response",
            LogMessage::ManifestRequest { .. } => "manifest_request",
            LogMessage::ManifestResponse { .. } => "manifest_response",
        }
    }
}
