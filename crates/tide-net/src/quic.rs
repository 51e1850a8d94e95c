//! Network transport built on iroh QUIC and iroh-gossip.
//!
//! [`IrohNetwork`] owns one iroh [`Endpoint`] per peer and serves every
//! channel that peer opens:
//! - Connection pooling (one outgoing connection per remote peer).
//! - One-way envelopes over uni streams, requests over bi streams, both
//!   length-prefixed postcard.
//! - A per-topic route table feeding each open channel's inbound queue.
//! - A shared [`Gossip`] instance for [`TopicChannel`](crate::TopicChannel).
//!
//! A peer's [`PeerId`] is its iroh endpoint id, so the same ed25519 seed
//! names a peer both in signed entries and on the wire.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::Gossip;
use iroh_gossip::net::GOSSIP_ALPN;
use serde::{Deserialize, Serialize};
use tide_types::{PeerId, TopicId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelFactory, ChannelKind, Frame};
use crate::direct::DirectChannel;
use crate::error::NetError;
use crate::frame::{read_frame, write_frame};
use crate::message::{LogMessage, MAX_MESSAGE_SIZE};
use crate::topic::TopicChannel;

/// ALPN for Tide's direct QUIC protocol.
pub const TIDE_ALPN: &[u8] = b"tide/0";

/// Room for the envelope around a [`LogMessage`].
const ENVELOPE_OVERHEAD: usize = 1024;

/// Largest gossip broadcast. Announcements are small; entries travel over
/// direct requests.
pub(crate) const MAX_GOSSIP_MESSAGE_SIZE: usize = 1024 * 1024;

/// What travels on a stream between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Envelope {
    /// "I joined this topic."
    Hello(TopicId),
    /// Answer to [`Envelope::Hello`]: "so am I".
    Welcome(TopicId),
    /// "I left this topic."
    Leave(TopicId),
    /// One-way encoded [`LogMessage`].
    Message { topic: TopicId, bytes: Vec<u8> },
    /// Encoded [`LogMessage`] request; the answer comes back on the same
    /// bi stream.
    Request { topic: TopicId, bytes: Vec<u8> },
}

impl Envelope {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, NetError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Message broadcast on a gossip topic. Gossip only reports the neighbor
/// that relayed a message, so the origin travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Published {
    pub(crate) origin: PeerId,
    pub(crate) bytes: Vec<u8>,
}

pub(crate) fn peer_of(id: EndpointId) -> PeerId {
    PeerId::from(*id.as_bytes())
}

pub(crate) fn endpoint_of(peer: PeerId) -> Result<EndpointId, NetError> {
    EndpointId::from_bytes(peer.as_bytes())
        .map_err(|e| NetError::Connect(format!("{peer} is not an endpoint id: {e}")))
}

// ---------------------------------------------------------------------------
// Route table
// ---------------------------------------------------------------------------

struct Route {
    registration: u64,
    tx: mpsc::UnboundedSender<Frame>,
    members: HashSet<PeerId>,
}

/// Open topics of one peer and who is known to be on each.
#[derive(Default)]
pub(crate) struct Routes {
    topics: Mutex<HashMap<TopicId, Route>>,
    next_registration: AtomicU64,
}

impl Routes {
    /// Open `topic`, replacing any earlier registration.
    pub(crate) fn register(&self, topic: TopicId) -> (u64, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let route = Route {
            registration,
            tx,
            members: HashSet::new(),
        };
        self.lock().insert(topic, route);
        (registration, rx)
    }

    /// Close `topic` if `registration` still owns it. Returns the members
    /// it had.
    pub(crate) fn unregister(&self, topic: TopicId, registration: u64) -> Vec<PeerId> {
        let mut topics = self.lock();
        if topics.get(&topic).map(|r| r.registration) != Some(registration) {
            return Vec::new();
        }
        topics
            .remove(&topic)
            .map(|r| r.members.into_iter().collect())
            .unwrap_or_default()
    }

    pub(crate) fn is_open(&self, topic: TopicId) -> bool {
        self.lock().contains_key(&topic)
    }

    pub(crate) fn topics(&self) -> Vec<TopicId> {
        self.lock().keys().copied().collect()
    }

    pub(crate) fn members(&self, topic: TopicId) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self
            .lock()
            .get(&topic)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Record `peer` on `topic`. Returns whether the topic is open here.
    pub(crate) fn joined(&self, topic: TopicId, peer: PeerId) -> bool {
        let mut topics = self.lock();
        let Some(route) = topics.get_mut(&topic) else {
            return false;
        };
        if route.members.insert(peer) {
            let _ = route.tx.send(Frame::Joined(peer));
        }
        true
    }

    pub(crate) fn left(&self, topic: TopicId, peer: PeerId) {
        let mut topics = self.lock();
        if let Some(route) = topics.get_mut(&topic)
            && route.members.remove(&peer)
        {
            let _ = route.tx.send(Frame::Left(peer));
        }
    }

    /// `peer` became unreachable: it leaves every topic.
    pub(crate) fn peer_gone(&self, peer: PeerId) {
        let mut topics = self.lock();
        for route in topics.values_mut() {
            if route.members.remove(&peer) {
                let _ = route.tx.send(Frame::Left(peer));
            }
        }
    }

    /// Hand `frame` to the channel open on `topic`.
    pub(crate) fn deliver(&self, topic: TopicId, frame: Frame) -> bool {
        self.lock()
            .get(&topic)
            .is_some_and(|route| route.tx.send(frame).is_ok())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TopicId, Route>> {
        self.topics.lock().expect("route table lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    endpoint: Endpoint,
    local: PeerId,
    routes: Routes,
    /// Known peers and how to reach them.
    address_book: Mutex<HashMap<PeerId, EndpointAddr>>,
    /// Outgoing connections. Held across connect so concurrent callers do
    /// not race to dial the same peer.
    connections: tokio::sync::Mutex<HashMap<PeerId, Connection>>,
}

impl Shared {
    pub(crate) fn local(&self) -> PeerId {
        self.local
    }

    pub(crate) fn routes(&self) -> &Routes {
        &self.routes
    }

    fn remember(&self, peer: PeerId, addr: EndpointAddr) {
        self.address_book
            .lock()
            .expect("address book lock poisoned")
            .entry(peer)
            .or_insert(addr);
    }

    pub(crate) fn known_peers(&self) -> Vec<PeerId> {
        self.address_book
            .lock()
            .expect("address book lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    fn addr_of(&self, peer: PeerId) -> Result<EndpointAddr, NetError> {
        if let Some(addr) = self
            .address_book
            .lock()
            .expect("address book lock poisoned")
            .get(&peer)
        {
            return Ok(addr.clone());
        }
        Ok(EndpointAddr::new(endpoint_of(peer)?))
    }

    async fn connection(&self, peer: PeerId) -> Result<Connection, NetError> {
        if peer == self.local {
            return Err(NetError::Unreachable(peer));
        }
        let mut cache = self.connections.lock().await;
        if let Some(conn) = cache.get(&peer)
            && conn.close_reason().is_none()
        {
            return Ok(conn.clone());
        }

        let addr = self.addr_of(peer)?;
        debug!(remote = %peer.fmt_short(), "connecting to peer");
        let conn = self
            .endpoint
            .connect(addr, TIDE_ALPN)
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;
        cache.insert(peer, conn.clone());
        Ok(conn)
    }

    async fn forget_connection(&self, peer: PeerId) {
        self.connections.lock().await.remove(&peer);
    }

    /// Send one envelope over a fresh uni stream.
    pub(crate) async fn send(&self, peer: PeerId, envelope: &Envelope) -> Result<(), NetError> {
        let payload = envelope.encode()?;
        let result = async {
            let conn = self.connection(peer).await?;
            let mut send = conn
                .open_uni()
                .await
                .map_err(|e| NetError::StreamOpen(e.to_string()))?;
            write_frame(&mut send, &payload).await?;
            send.finish().map_err(|e| NetError::Stream(e.to_string()))?;
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            debug!(remote = %peer.fmt_short(), %e, "send failed");
            self.forget_connection(peer).await;
        }
        result
    }

    /// Send a request over a fresh bi stream and read the answer.
    pub(crate) async fn request(
        &self,
        peer: PeerId,
        topic: TopicId,
        message: &LogMessage,
        timeout: Duration,
    ) -> Result<LogMessage, NetError> {
        let payload = Envelope::Request {
            topic,
            bytes: message.encode()?,
        }
        .encode()?;

        let exchange = async {
            let conn = self.connection(peer).await?;
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| NetError::StreamOpen(e.to_string()))?;
            write_frame(&mut send, &payload).await?;
            send.finish().map_err(|e| NetError::Stream(e.to_string()))?;
            // The responder finishes the stream without a frame when it has
            // no answer.
            let answer = read_frame(&mut recv, MAX_MESSAGE_SIZE)
                .await
                .map_err(|_| NetError::NoResponse(peer))?;
            LogMessage::decode(&answer)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => Err(NetError::Timeout(timeout)),
            Ok(Err(e @ (NetError::Connect(_) | NetError::StreamOpen(_) | NetError::Stream(_)))) => {
                self.forget_connection(peer).await;
                Err(e)
            }
            Ok(result) => result,
        }
    }

    /// Tell every known peer that we joined `topic`.
    pub(crate) async fn say_hello(&self, topic: TopicId) {
        for peer in self.known_peers() {
            if let Err(e) = self.send(peer, &Envelope::Hello(topic)).await {
                debug!(remote = %peer.fmt_short(), topic = %topic.fmt_short(), %e, "hello failed");
            }
        }
    }

    /// Tell `members` that we left `topic`.
    pub(crate) async fn say_goodbye(&self, topic: TopicId, members: Vec<PeerId>) {
        for peer in members {
            if let Err(e) = self.send(peer, &Envelope::Leave(topic)).await {
                debug!(remote = %peer.fmt_short(), %e, "leave notice failed");
            }
        }
    }

    /// Act on an envelope that arrived on a uni stream.
    async fn on_envelope(&self, from: PeerId, envelope: Envelope) {
        trace!(from = %from.fmt_short(), ?envelope, "envelope");
        match envelope {
            Envelope::Hello(topic) => {
                if self.routes.joined(topic, from)
                    && let Err(e) = self.send(from, &Envelope::Welcome(topic)).await
                {
                    debug!(remote = %from.fmt_short(), %e, "welcome failed");
                }
            }
            Envelope::Welcome(topic) => {
                self.routes.joined(topic, from);
            }
            Envelope::Leave(topic) => self.routes.left(topic, from),
            Envelope::Message { topic, bytes } => {
                if !self.routes.deliver(topic, Frame::Message { from, bytes }) {
                    trace!(topic = %topic.fmt_short(), "message for a closed topic");
                }
            }
            Envelope::Request { .. } => {
                warn!(from = %from.fmt_short(), "request on a uni stream, dropping");
            }
        }
    }

    /// Answer one request stream.
    async fn answer(&self, from: PeerId, mut send: SendStream, mut recv: RecvStream) {
        let max = MAX_MESSAGE_SIZE + ENVELOPE_OVERHEAD;
        let envelope = match read_frame(&mut recv, max).await.and_then(|b| Envelope::decode(&b)) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(from = %from.fmt_short(), %e, "unreadable request");
                return;
            }
        };
        let Envelope::Request { topic, bytes } = envelope else {
            warn!(from = %from.fmt_short(), "non-request on a bi stream, dropping");
            return;
        };

        let (reply, answer) = oneshot::channel();
        if self.routes.deliver(topic, Frame::Request { from, bytes, reply })
            && let Ok(bytes) = answer.await
            && let Err(e) = write_frame(&mut send, &bytes).await
        {
            debug!(from = %from.fmt_short(), %e, "failed to write answer");
        }
        let _ = send.finish();
    }
}

// ---------------------------------------------------------------------------
// Protocol handler
// ---------------------------------------------------------------------------

/// Serves incoming `tide/0` connections.
#[derive(Clone)]
struct TideProtocol {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TideProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TideProtocol")
            .field("local", &self.shared.local)
            .finish_non_exhaustive()
    }
}

impl iroh::protocol::ProtocolHandler for TideProtocol {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let remote_id = conn.remote_id();
        let remote = peer_of(remote_id);
        self.shared.remember(remote, EndpointAddr::new(remote_id));

        let conn_uni = conn.clone();
        let shared_uni = self.shared.clone();
        tokio::spawn(async move {
            let max = MAX_MESSAGE_SIZE + ENVELOPE_OVERHEAD;
            while let Ok(mut recv) = conn_uni.accept_uni().await {
                match read_frame(&mut recv, max).await.and_then(|b| Envelope::decode(&b)) {
                    Ok(envelope) => shared_uni.on_envelope(remote, envelope).await,
                    Err(e) => debug!(from = %remote.fmt_short(), %e, "unreadable envelope"),
                }
            }
            debug!(remote = %remote.fmt_short(), "connection closed");
            shared_uni.routes.peer_gone(remote);
        });

        let shared_bi = self.shared.clone();
        tokio::spawn(async move {
            while let Ok((send, recv)) = conn.accept_bi().await {
                let shared = shared_bi.clone();
                tokio::spawn(async move { shared.answer(remote, send, recv).await });
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// One peer's iroh endpoint, router and gossip instance.
///
/// Cheap to clone; every clone serves the same endpoint.
#[derive(Clone)]
pub struct IrohNetwork {
    shared: Arc<Shared>,
    gossip: Gossip,
    router: Arc<Router>,
}

impl IrohNetwork {
    /// Bind an endpoint whose identity is the ed25519 `seed`.
    ///
    /// Use [`iroh::RelayMode::Disabled`] for tests and local networks.
    pub async fn bind(seed: [u8; 32], relay_mode: iroh::RelayMode) -> Result<Self, NetError> {
        let endpoint = Endpoint::builder()
            .secret_key(SecretKey::from(seed))
            .alpns(vec![TIDE_ALPN.to_vec(), GOSSIP_ALPN.to_vec()])
            .relay_mode(relay_mode)
            .bind()
            .await
            .map_err(|e| NetError::Endpoint(e.to_string()))?;

        let gossip = Gossip::builder()
            .max_message_size(MAX_GOSSIP_MESSAGE_SIZE)
            .spawn(endpoint.clone());
        let shared = Arc::new(Shared {
            local: peer_of(endpoint.id()),
            endpoint: endpoint.clone(),
            routes: Routes::default(),
            address_book: Mutex::new(HashMap::new()),
            connections: tokio::sync::Mutex::new(HashMap::new()),
        });
        let router = Router::builder(endpoint)
            .accept(
                TIDE_ALPN,
                TideProtocol {
                    shared: shared.clone(),
                },
            )
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        debug!(local = %shared.local.fmt_short(), "iroh network bound");
        Ok(Self {
            shared,
            gossip,
            router: Arc::new(router),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.shared.local
    }

    /// Address (id plus direct and relay addresses) other peers dial.
    pub fn addr(&self) -> EndpointAddr {
        self.shared.endpoint.addr()
    }

    /// Learn how to reach a peer. Every open topic says hello to it, which
    /// also gives the endpoint a path gossip can later dial by id.
    pub async fn add_peer(&self, addr: EndpointAddr) {
        let peer = peer_of(addr.id);
        if peer == self.shared.local {
            return;
        }
        self.shared
            .address_book
            .lock()
            .expect("address book lock poisoned")
            .insert(peer, addr);
        for topic in self.shared.routes.topics() {
            if let Err(e) = self.shared.send(peer, &Envelope::Hello(topic)).await {
                debug!(remote = %peer.fmt_short(), %e, "hello failed");
            }
        }
    }

    /// Learn a peer by id alone; the endpoint's discovery finds its
    /// addresses.
    pub async fn add_peer_id(&self, peer: PeerId) -> Result<(), NetError> {
        self.add_peer(EndpointAddr::new(endpoint_of(peer)?)).await;
        Ok(())
    }

    /// A factory opening channels of `kind` on this endpoint.
    pub fn factory(&self, kind: ChannelKind) -> IrohChannelFactory {
        IrohChannelFactory {
            network: self.clone(),
            kind,
        }
    }

    /// Stop accepting connections and close the endpoint.
    pub async fn shutdown(&self) -> Result<(), NetError> {
        self.router
            .shutdown()
            .await
            .map_err(|e| NetError::Endpoint(e.to_string()))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    /// Endpoint ids to bootstrap a gossip topic from.
    pub(crate) fn bootstrap(&self) -> Vec<EndpointId> {
        self.shared
            .known_peers()
            .into_iter()
            .filter_map(|p| endpoint_of(p).ok())
            .collect()
    }
}

impl std::fmt::Debug for IrohNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohNetwork")
            .field("local", &self.shared.local)
            .field("topics", &self.shared.routes.topics().len())
            .finish_non_exhaustive()
    }
}

/// Opens iroh-backed channels: QUIC for [`ChannelKind::Direct`], gossip for
/// [`ChannelKind::Topic`].
#[derive(Debug, Clone)]
pub struct IrohChannelFactory {
    network: IrohNetwork,
    kind: ChannelKind,
}

impl IrohChannelFactory {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }
}

#[async_trait]
impl ChannelFactory for IrohChannelFactory {
    async fn open(&self, topic: TopicId) -> Result<Arc<dyn Channel>, NetError> {
        Ok(match self.kind {
            ChannelKind::Direct => Arc::new(DirectChannel::open(self.network.clone(), topic).await),
            ChannelKind::Topic => Arc::new(TopicChannel::open(self.network.clone(), topic).await?),
        })
    }
}
