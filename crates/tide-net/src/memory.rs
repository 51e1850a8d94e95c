//! In-process network hub.
//!
//! [`MemoryNetwork`] routes frames between channels living in the same
//! process. Every message is encoded on send and decoded on receipt so
//! size limits and serialization behave as on a real wire. Links between
//! two peers can be severed and restored to simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tide_types::{PeerId, TopicId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelFactory, ChannelKind, Destination, Frame, Inbound};
use crate::error::NetError;
use crate::message::LogMessage;

struct Member {
    registration: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct Hub {
    topics: HashMap<TopicId, HashMap<PeerId, Member>>,
    severed: HashSet<(PeerId, PeerId)>,
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl Hub {
    fn connected(&self, a: PeerId, b: PeerId) -> bool {
        !self.severed.contains(&link(a, b))
    }

    /// Topics where both peers are members.
    fn shared_topics(&self, a: PeerId, b: PeerId) -> Vec<TopicId> {
        self.topics
            .iter()
            .filter(|(_, members)| members.contains_key(&a) && members.contains_key(&b))
            .map(|(topic, _)| *topic)
            .collect()
    }

    fn notify(&self, topic: TopicId, to: PeerId, frame: Frame) {
        if let Some(member) = self.topics.get(&topic).and_then(|m| m.get(&to)) {
            let _ = member.tx.send(frame);
        }
    }
}

/// Shared routing table for in-process channels.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
    next_registration: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory opening channels of `kind` for peer `local`.
    pub fn factory(&self, local: PeerId, kind: ChannelKind) -> MemoryChannelFactory {
        MemoryChannelFactory {
            network: self.clone(),
            local,
            kind,
        }
    }

    /// Current members of `topic`.
    pub fn members(&self, topic: TopicId) -> Vec<PeerId> {
        let hub = self.hub.lock().expect("network lock poisoned");
        let mut members: Vec<PeerId> = hub
            .topics
            .get(&topic)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Cut the link between `a` and `b`. Both sides see the other leave.
    pub fn sever(&self, a: PeerId, b: PeerId) {
        let mut hub = self.hub.lock().expect("network lock poisoned");
        if !hub.severed.insert(link(a, b)) {
            return;
        }
        debug!(a = %a.fmt_short(), b = %b.fmt_short(), "link severed");
        for topic in hub.shared_topics(a, b) {
            hub.notify(topic, a, Frame::Left(b));
            hub.notify(topic, b, Frame::Left(a));
        }
    }

    /// Restore a severed link. Both sides see the other join.
    pub fn restore(&self, a: PeerId, b: PeerId) {
        let mut hub = self.hub.lock().expect("network lock poisoned");
        if !hub.severed.remove(&link(a, b)) {
            return;
        }
        debug!(a = %a.fmt_short(), b = %b.fmt_short(), "link restored");
        for topic in hub.shared_topics(a, b) {
            hub.notify(topic, a, Frame::Joined(b));
            hub.notify(topic, b, Frame::Joined(a));
        }
    }

    /// Register `peer` on `topic`.
    ///
    /// Reachable existing members learn about the newcomer and the newcomer
    /// learns about them. Joining twice replaces the earlier registration.
    pub(crate) fn join(&self, topic: TopicId, peer: PeerId) -> Port {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);

        let mut hub = self.hub.lock().expect("network lock poisoned");
        let others: Vec<PeerId> = hub
            .topics
            .get(&topic)
            .map(|m| m.keys().copied().filter(|p| *p != peer).collect())
            .unwrap_or_default();

        for other in &others {
            if hub.connected(peer, *other) {
                hub.notify(topic, *other, Frame::Joined(peer));
                let _ = tx.send(Frame::Joined(*other));
            }
        }
        hub.topics
            .entry(topic)
            .or_default()
            .insert(peer, Member { registration, tx });
        debug!(topic = %topic.fmt_short(), peer = %peer.fmt_short(), "joined topic");

        Port {
            network: self.clone(),
            topic,
            local: peer,
            registration,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            closed: AtomicBool::new(false),
        }
    }

    fn leave(&self, topic: TopicId, peer: PeerId, registration: u64) {
        let mut hub = self.hub.lock().expect("network lock poisoned");
        let Some(members) = hub.topics.get_mut(&topic) else {
            return;
        };
        if members.get(&peer).map(|m| m.registration) != Some(registration) {
            return;
        }
        members.remove(&peer);
        let remaining: Vec<PeerId> = members.keys().copied().collect();
        if remaining.is_empty() {
            hub.topics.remove(&topic);
        }
        for other in remaining {
            if hub.connected(peer, other) {
                hub.notify(topic, other, Frame::Left(peer));
            }
        }
        debug!(topic = %topic.fmt_short(), peer = %peer.fmt_short(), "left topic");
    }

    fn peers_of(&self, topic: TopicId, peer: PeerId) -> Vec<PeerId> {
        let hub = self.hub.lock().expect("network lock poisoned");
        let mut peers: Vec<PeerId> = hub
            .topics
            .get(&topic)
            .map(|m| {
                m.keys()
                    .copied()
                    .filter(|p| *p != peer && hub.connected(peer, *p))
                    .collect()
            })
            .unwrap_or_default();
        peers.sort();
        peers
    }

    fn deliver(&self, topic: TopicId, from: PeerId, to: PeerId, frame: Frame) -> Result<(), NetError> {
        let hub = self.hub.lock().expect("network lock poisoned");
        if !hub.connected(from, to) {
            return Err(NetError::Unreachable(to));
        }
        let member = hub
            .topics
            .get(&topic)
            .and_then(|m| m.get(&to))
            .ok_or(NetError::Unreachable(to))?;
        member.tx.send(frame).map_err(|_| NetError::Unreachable(to))
    }

    /// Fan `bytes` out to every reachable member but the sender.
    fn publish(&self, topic: TopicId, from: PeerId, bytes: &[u8]) -> usize {
        let hub = self.hub.lock().expect("network lock poisoned");
        let Some(members) = hub.topics.get(&topic) else {
            return 0;
        };
        let mut delivered = 0;
        for (peer, member) in members {
            if *peer == from || !hub.connected(from, *peer) {
                continue;
            }
            let frame = Frame::Message {
                from,
                bytes: bytes.to_vec(),
            };
            if member.tx.send(frame).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hub = self.hub.lock().expect("network lock poisoned");
        f.debug_struct("MemoryNetwork")
            .field("topics", &hub.topics.len())
            .field("severed", &hub.severed.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// One registration on the hub.
pub(crate) struct Port {
    network: MemoryNetwork,
    topic: TopicId,
    local: PeerId,
    registration: u64,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
    closed: AtomicBool,
}

impl Port {
    pub(crate) fn local(&self) -> PeerId {
        self.local
    }

    pub(crate) fn topic(&self) -> TopicId {
        self.topic
    }

    pub(crate) fn peers(&self) -> Vec<PeerId> {
        if self.is_closed() {
            return Vec::new();
        }
        self.network.peers_of(self.topic, self.local)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), NetError> {
        if self.is_closed() {
            Err(NetError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn send_to(&self, to: PeerId, bytes: Vec<u8>) -> Result<(), NetError> {
        self.ensure_open()?;
        trace!(to = %to.fmt_short(), len = bytes.len(), "send");
        self.network.deliver(
            self.topic,
            self.local,
            to,
            Frame::Message {
                from: self.local,
                bytes,
            },
        )
    }

    pub(crate) fn publish(&self, bytes: &[u8]) -> Result<usize, NetError> {
        self.ensure_open()?;
        Ok(self.network.publish(self.topic, self.local, bytes))
    }

    pub(crate) async fn request(
        &self,
        to: PeerId,
        message: &LogMessage,
        timeout: Duration,
    ) -> Result<LogMessage, NetError> {
        self.ensure_open()?;
        let bytes = message.encode()?;
        let (reply, answer) = oneshot::channel();
        self.network.deliver(
            self.topic,
            self.local,
            to,
            Frame::Request {
                from: self.local,
                bytes,
                reply,
            },
        )?;

        match tokio::time::timeout(timeout, answer).await {
            Err(_) => Err(NetError::Timeout(timeout)),
            Ok(Err(_)) => Err(NetError::NoResponse(to)),
            Ok(Ok(bytes)) => LogMessage::decode(&bytes),
        }
    }

    pub(crate) fn inbound(&self) -> Inbound {
        Inbound::new(self.rx.clone())
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.network.leave(self.topic, self.local, self.registration);
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// In-process channel of either flavour.
///
/// A [`ChannelKind::Direct`] send to [`Destination::All`] loops over the
/// current peers and reports the first failure after trying all of them. A
/// [`ChannelKind::Topic`] send to `All` is a single best-effort publish.
pub struct MemoryChannel {
    port: Port,
    kind: ChannelKind,
}

impl MemoryChannel {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn local_id(&self) -> PeerId {
        self.port.local()
    }

    fn topic(&self) -> TopicId {
        self.port.topic()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.port.peers()
    }

    async fn send(&self, destination: Destination, message: &LogMessage) -> Result<(), NetError> {
        let bytes = message.encode()?;
        match (destination, self.kind) {
            (Destination::Peer(peer), _) => self.port.send_to(peer, bytes),
            (Destination::All, ChannelKind::Topic) => {
                let delivered = self.port.publish(&bytes)?;
                trace!(kind = message.kind(), delivered, "published");
                Ok(())
            }
            (Destination::All, ChannelKind::Direct) => {
                let mut first_error = None;
                for peer in self.port.peers() {
                    if let Err(e) = self.port.send_to(peer, bytes.clone()) {
                        debug!(peer = %peer.fmt_short(), %e, "direct send failed");
                        first_error.get_or_insert(e);
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None if self.port.is_closed() => Err(NetError::Closed),
                    None => Ok(()),
                }
            }
        }
    }

    async fn request(
        &self,
        peer: PeerId,
        message: &LogMessage,
        timeout: Duration,
    ) -> Result<LogMessage, NetError> {
        self.port.request(peer, message, timeout).await
    }

    fn inbound(&self) -> Inbound {
        self.port.inbound()
    }

    async fn close(&self) {
        self.port.close();
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Opens in-process channels for one local peer.
#[derive(Debug, Clone)]
pub struct MemoryChannelFactory {
    network: MemoryNetwork,
    local: PeerId,
    kind: ChannelKind,
}

impl MemoryChannelFactory {
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }
}

#[async_trait]
impl ChannelFactory for MemoryChannelFactory {
    async fn open(&self, topic: TopicId) -> Result<Arc<dyn Channel>, NetError> {
        let port = self.network.join(topic, self.local);
        Ok(Arc::new(MemoryChannel {
            port,
            kind: self.kind,
        }))
    }
}
