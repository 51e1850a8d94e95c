//! Log manifests and addresses.
//!
//! A manifest records what a log is: its name, type, access list and
//! whether payloads are encrypted. It is stored in the content store, and
//! the log's address embeds the manifest hash, so anyone holding the
//! address can fetch and check the configuration the creator chose.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tide_access::AccessControlList;
use tide_types::{ContentHash, TopicId};

use crate::error::{NodeError, Result};

/// Address prefix for Tide logs.
pub const ADDRESS_PREFIX: &str = "tide";

/// The only log type.
pub const EVENTLOG: &str = "eventlog";

/// Creation parameters of a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogManifest {
    pub name: String,
    pub kind: String,
    pub access: AccessControlList,
    pub encrypted: bool,
}

impl LogManifest {
    /// Manifest for an event log.
    pub fn eventlog(name: impl Into<String>, access: AccessControlList, encrypted: bool) -> Self {
        Self {
            name: name.into(),
            kind: EVENTLOG.to_string(),
            access,
            encrypted,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// `/tide/<manifest hash>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogAddress {
    pub manifest: ContentHash,
    pub name: String,
}

impl LogAddress {
    pub fn new(manifest: ContentHash, name: impl Into<String>) -> Self {
        Self {
            manifest,
            name: name.into(),
        }
    }

    /// Whether `s` is meant as an address rather than a plain name.
    pub fn is_address(s: &str) -> bool {
        s.strip_prefix('/')
            .and_then(|rest| rest.strip_prefix(ADDRESS_PREFIX))
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Parse an address string.
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || NodeError::AddressResolution(format!("malformed address {s:?}"));

        let mut parts = s.splitn(4, '/');
        let (Some(""), Some(ADDRESS_PREFIX), Some(hash), Some(name)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if name.is_empty() {
            return Err(malformed());
        }
        let manifest = ContentHash::from_str(hash).map_err(|_| malformed())?;
        Ok(Self::new(manifest, name))
    }

    /// Topic on which peers replicating this log meet.
    pub fn topic(&self) -> TopicId {
        TopicId::for_address(&self.to_string())
    }
}

impl fmt::Display for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{ADDRESS_PREFIX}/{}/{}", self.manifest, self.name)
    }
}

impl FromStr for LogAddress {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
