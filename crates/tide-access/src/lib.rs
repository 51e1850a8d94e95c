//! Access control for Tide logs.
//!
//! The log and the replication coordinator only ever talk to the
//! [`AccessController`] trait. [`StaticList`] is the built-in policy: a fixed
//! capability → identity-set mapping supplied when the log is opened.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tide_crypto::Identity;

/// Capability required to append entries.
pub const WRITE: &str = "write";

/// Identity id that grants a capability to everyone.
pub const ANYONE: &str = "*";

/// Kind of operation an identity wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Append a new entry.
    Append,
}

impl OperationKind {
    /// The capability guarding this operation.
    pub fn capability(&self) -> &'static str {
        match self {
            OperationKind::Append => WRITE,
        }
    }
}

/// Errors from access checks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The identity lacks the capability.
    #[error("access denied: {identity} lacks the '{capability}' capability")]
    AccessDenied {
        /// Identity id that was refused.
        identity: String,
        /// Capability that was missing.
        capability: String,
    },
}

/// Policy deciding whether an identity may perform an operation.
///
/// Implementations must be cheap and safe to call concurrently: the log
/// checks every local append and every remote entry during merge.
pub trait AccessController: Send + Sync + fmt::Debug {
    /// Whether `identity` may perform `kind`.
    fn can_append(&self, identity: &Identity, kind: OperationKind) -> bool;

    /// Like [`can_append`](Self::can_append) but returns an error naming the
    /// missing capability.
    fn check(&self, identity: &Identity, kind: OperationKind) -> Result<(), AccessError> {
        if self.can_append(identity, kind) {
            Ok(())
        } else {
            Err(AccessError::AccessDenied {
                identity: identity.id.clone(),
                capability: kind.capability().to_string(),
            })
        }
    }
}

/// Capability → identity ids mapping.
///
/// Serializable so it can travel inside a log manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlList {
    capabilities: BTreeMap<String, BTreeSet<String>>,
}

impl AccessControlList {
    /// Empty list: nobody holds any capability.
    pub fn new() -> Self {
        Self::default()
    }

    /// List granting `write` to the given identity ids.
    pub fn writers<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut acl = Self::new();
        for id in ids {
            acl.grant(WRITE, id);
        }
        acl
    }

    /// List granting `write` to everyone.
    pub fn open() -> Self {
        Self::writers([ANYONE])
    }

    /// Grant `capability` to `identity_id`.
    pub fn grant(&mut self, capability: impl Into<String>, identity_id: impl Into<String>) {
        self.capabilities
            .entry(capability.into())
            .or_default()
            .insert(identity_id.into());
    }

    /// Builder form of [`grant`](Self::grant).
    pub fn with(mut self, capability: impl Into<String>, identity_id: impl Into<String>) -> Self {
        self.grant(capability, identity_id);
        self
    }

    /// Whether `identity_id` holds `capability`, directly or via `"*"`.
    pub fn allows(&self, capability: &str, identity_id: &str) -> bool {
        self.capabilities
            .get(capability)
            .is_some_and(|ids| ids.contains(identity_id) || ids.contains(ANYONE))
    }

    /// Identity ids holding `capability`.
    pub fn holders(&self, capability: &str) -> impl Iterator<Item = &str> {
        self.capabilities
            .get(capability)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }
}

/// Access controller backed by a fixed [`AccessControlList`].
#[derive(Debug, Clone)]
pub struct StaticList {
    acl: AccessControlList,
}

impl StaticList {
    pub fn new(acl: AccessControlList) -> Self {
        Self { acl }
    }

    /// The underlying list.
    pub fn acl(&self) -> &AccessControlList {
        &self.acl
    }
}

impl AccessController for StaticList {
    fn can_append(&self, identity: &Identity, kind: OperationKind) -> bool {
        self.acl.allows(kind.capability(), &identity.id)
    }
}
