//! Peer facade for Tide.
//!
//! A [`Node`] bundles a writer identity, a content store, a head cache and a
//! channel factory. [`Node::log`] opens an [`EventLogStore`] either from a
//! plain name, creating a new log and its [`LogManifest`], or from a
//! [`LogAddress`] handed over by another peer.
//!
//! ```text
//! /tide/<manifest hash>/<name>
//! ```
//!
//! Configuration is read from TOML into [`NodeConfig`]. [`Node::bind`]
//! puts a node on an iroh endpoint; [`Node::open`] takes any channel
//! factory, such as an in-process [`tide_net::MemoryNetwork`].

mod config;
mod error;
mod manifest;
mod node;
mod store;

#[cfg(test)]
mod tests;

pub use config::{AddressSection, LogSection, NetworkSection, NodeConfig, NodeSection, init_tracing};
pub use error::{NodeError, Result};
pub use manifest::{ADDRESS_PREFIX, EVENTLOG, LogAddress, LogManifest};
pub use node::{LogOptions, Node};
pub use store::EventLogStore;

pub use tide_log::{Amount, Direction, ListOptions, Record};
pub use tide_replication::{EventKind, ReplicationConfig, ReplicationStatus, StoreEvent};
