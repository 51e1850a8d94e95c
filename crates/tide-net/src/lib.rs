//! Network layer for Tide log replication.
//!
//! Defines the [`LogMessage`] wire protocol and the [`Channel`] abstraction
//! the replication coordinator talks to. Two iroh-backed flavours serve
//! real networks, both on one [`IrohNetwork`] endpoint per peer:
//!
//! - [`DirectChannel`]: pairwise delivery over QUIC.
//! - [`TopicChannel`]: iroh-gossip broadcast, QUIC for requests.
//!
//! [`MemoryNetwork`] provides the same two flavours in-process, with links
//! that can be severed to simulate partitions.

mod channel;
mod direct;
mod error;
mod frame;
mod memory;
mod message;
mod quic;
mod topic;


pub use channel::{Channel, ChannelFactory, ChannelKind, Delivery, Destination, Inbound, Responder};
pub use direct::DirectChannel;
pub use error::NetError;
pub use memory::{MemoryChannel, MemoryChannelFactory, MemoryNetwork};
pub use message::{LogMessage, MAX_MESSAGE_SIZE};
pub use quic::{IrohChannelFactory, IrohNetwork, TIDE_ALPN};
pub use topic::TopicChannel;

/// Re-exported so callers can pick a relay mode without depending on iroh.
pub use iroh::RelayMode;
