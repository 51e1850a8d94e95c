//! Broadcast channel over an iroh-gossip topic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_lite::StreamExt;
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::proto::TopicId as GossipTopicId;
use tide_types::{PeerId, TopicId};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, Destination, Frame, Inbound};
use crate::error::NetError;
use crate::message::LogMessage;
use crate::quic::{Envelope, IrohNetwork, MAX_GOSSIP_MESSAGE_SIZE, Published, endpoint_of};

/// Channel where a send to [`Destination::All`] is a single gossip
/// broadcast.
///
/// Broadcasts are best effort and may travel several hops. Membership,
/// addressed sends and requests use the same direct QUIC path as a
/// [`DirectChannel`](crate::DirectChannel); every peer met that way is
/// also added to the gossip swarm.
pub struct TopicChannel {
    network: IrohNetwork,
    topic: TopicId,
    registration: u64,
    sender: Arc<GossipSender>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<Frame>>>,
    pump: JoinHandle<()>,
    closed: AtomicBool,
}

impl TopicChannel {
    /// Register `topic`, greet every known peer and subscribe to the gossip
    /// topic of the same id.
    pub(crate) async fn open(network: IrohNetwork, topic: TopicId) -> Result<Self, NetError> {
        let shared = network.shared();
        let (registration, routed) = shared.routes().register(topic);
        shared.say_hello(topic).await;

        let gossip_topic = match network
            .gossip()
            .subscribe(GossipTopicId::from_bytes(*topic.as_bytes()), network.bootstrap())
            .await
        {
            Ok(gossip_topic) => gossip_topic,
            Err(e) => {
                shared.routes().unregister(topic, registration);
                return Err(e.into());
            }
        };
        let (sender, receiver) = gossip_topic.split();
        let sender = Arc::new(sender);

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(
            network.local_id(),
            routed,
            receiver,
            sender.clone(),
            tx,
        ));

        Ok(Self {
            network,
            topic,
            registration,
            sender,
            inbound: Arc::new(Mutex::new(rx)),
            pump,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), NetError> {
        if self.closed.load(Ordering::Acquire) {
            Err(NetError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Merge routed frames and gossip broadcasts into one inbound queue.
///
/// Ends when the route is closed or the channel's inbound side is dropped.
async fn pump(
    local: PeerId,
    mut routed: mpsc::UnboundedReceiver<Frame>,
    mut gossip: GossipReceiver,
    sender: Arc<GossipSender>,
    inbound: mpsc::UnboundedSender<Frame>,
) {
    let mut gossip_open = true;
    loop {
        tokio::select! {
            frame = routed.recv() => {
                let Some(frame) = frame else { break };
                if let Frame::Joined(peer) = &frame
                    && let Ok(id) = endpoint_of(*peer)
                    && let Err(e) = sender.join_peers(vec![id]).await
                {
                    debug!(peer = %peer.fmt_short(), %e, "could not add peer to gossip swarm");
                }
                if inbound.send(frame).is_err() {
                    break;
                }
            }
            event = gossip.next(), if gossip_open => match event {
                Some(Ok(Event::Received(msg))) => {
                    match postcard::from_bytes::<Published>(&msg.content) {
                        Ok(published) if published.origin == local => {}
                        Ok(published) => {
                            let frame = Frame::Message {
                                from: published.origin,
                                bytes: published.bytes,
                            };
                            if inbound.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(%e, "dropping undecodable broadcast"),
                    }
                }
                Some(Ok(Event::NeighborUp(id))) => trace!(neighbor = %id.fmt_short(), "gossip neighbor up"),
                Some(Ok(Event::NeighborDown(id))) => trace!(neighbor = %id.fmt_short(), "gossip neighbor down"),
                Some(Ok(Event::Lagged)) => warn!("gossip receiver lagged, broadcasts were dropped"),
                Some(Err(e)) => {
                    warn!(%e, "gossip receive error");
                    gossip_open = false;
                }
                None => gossip_open = false,
            },
        }
    }
}

#[async_trait]
impl Channel for TopicChannel {
    fn local_id(&self) -> PeerId {
        self.network.local_id()
    }

    fn topic(&self) -> TopicId {
        self.topic
    }

    fn peers(&self) -> Vec<PeerId> {
        if self.closed.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.network.shared().routes().members(self.topic)
    }

    async fn send(&self, destination: Destination, message: &LogMessage) -> Result<(), NetError> {
        self.ensure_open()?;
        let bytes = message.encode()?;
        match destination {
            Destination::Peer(peer) => {
                let envelope = Envelope::Message {
                    topic: self.topic,
                    bytes,
                };
                self.network.shared().send(peer, &envelope).await
            }
            Destination::All => {
                let published = postcard::to_allocvec(&Published {
                    origin: self.network.local_id(),
                    bytes,
                })?;
                if published.len() > MAX_GOSSIP_MESSAGE_SIZE {
                    return Err(NetError::MessageTooLarge {
                        size: published.len(),
                        max: MAX_GOSSIP_MESSAGE_SIZE,
                    });
                }
                self.sender.broadcast(Bytes::from(published)).await?;
                trace!(kind = message.kind(), "broadcast");
                Ok(())
            }
        }
    }

    async fn request(
        &self,
        peer: PeerId,
        message: &LogMessage,
        timeout: Duration,
    ) -> Result<LogMessage, NetError> {
        self.ensure_open()?;
        self.network
            .shared()
            .request(peer, self.topic, message, timeout)
            .await
    }

    fn inbound(&self) -> Inbound {
        Inbound::new(self.inbound.clone())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.network.shared();
        let members = shared.routes().unregister(self.topic, self.registration);
        shared.say_goodbye(self.topic, members).await;
        debug!(topic = %self.topic.fmt_short(), "left gossip topic");
    }
}

impl Drop for TopicChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.network
                .shared()
                .routes()
                .unregister(self.topic, self.registration);
        }
        self.pump.abort();
    }
}
