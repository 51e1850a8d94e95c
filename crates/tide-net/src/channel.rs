//! The channel abstraction replication runs over.
//!
//! A [`Channel`] is one peer's membership in one log's topic. It can send
//! messages to a single peer or to everyone, issue request/response
//! exchanges, and yields an [`Inbound`] stream of deliveries and
//! membership changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tide_types::{PeerId, TopicId};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::warn;

use crate::error::NetError;
use crate::message::LogMessage;

/// Which channel flavour a factory hands out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Pairwise delivery; broadcasts are a loop over peers.
    #[default]
    Direct,
    /// Topic broadcast; one publish reaches every member.
    Topic,
}

/// Where a message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A single peer.
    Peer(PeerId),
    /// Every current peer on the channel.
    All,
}

/// Something that arrived on a channel.
#[derive(Debug)]
pub enum Delivery {
    /// A one-way message.
    Message { from: PeerId, message: LogMessage },
    /// A request awaiting an answer through `responder`.
    Request {
        from: PeerId,
        message: LogMessage,
        responder: Responder,
    },
    /// A peer became reachable.
    PeerJoined(PeerId),
    /// A peer left or became unreachable.
    PeerLeft(PeerId),
}

/// Reply handle for a [`Delivery::Request`].
///
/// Dropping it without responding makes the requester see
/// [`NetError::NoResponse`].
#[derive(Debug)]
pub struct Responder {
    reply: oneshot::Sender<Vec<u8>>,
}

impl Responder {
    pub(crate) fn new(reply: oneshot::Sender<Vec<u8>>) -> Self {
        Self { reply }
    }

    /// Answer the request.
    pub fn respond(self, message: &LogMessage) -> Result<(), NetError> {
        let bytes = message.encode()?;
        self.reply.send(bytes).map_err(|_| NetError::Closed)
    }
}

/// Raw frame as handed over by a transport, before decoding.
#[derive(Debug)]
pub(crate) enum Frame {
    Message {
        from: PeerId,
        bytes: Vec<u8>,
    },
    Request {
        from: PeerId,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Joined(PeerId),
    Left(PeerId),
}

/// Stream of [`Delivery`] values for one channel.
///
/// Every call to [`Channel::inbound`] returns a fresh handle over the same
/// underlying queue, so a consumer can stop and later resume reading
/// without losing frames. Undecodable frames are logged and skipped.
pub struct Inbound {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Frame>>>,
}

impl Inbound {
    pub(crate) fn new(rx: Arc<Mutex<mpsc::UnboundedReceiver<Frame>>>) -> Self {
        Self { rx }
    }

    /// Next delivery. Returns `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let frame = self.rx.lock().await.recv().await?;
            match frame {
                Frame::Message { from, bytes } => match LogMessage::decode(&bytes) {
                    Ok(message) => return Some(Delivery::Message { from, message }),
                    Err(e) => warn!(%from, %e, "dropping undecodable message"),
                },
                Frame::Request { from, bytes, reply } => match LogMessage::decode(&bytes) {
                    Ok(message) => {
                        return Some(Delivery::Request {
                            from,
                            message,
                            responder: Responder::new(reply),
                        });
                    }
                    Err(e) => warn!(%from, %e, "dropping undecodable request"),
                },
                Frame::Joined(peer) => return Some(Delivery::PeerJoined(peer)),
                Frame::Left(peer) => return Some(Delivery::PeerLeft(peer)),
            }
        }
    }
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound").finish_non_exhaustive()
    }
}

/// One peer's view of a log's topic.
#[async_trait]
pub trait Channel: Send + Sync {
    /// This peer's id.
    fn local_id(&self) -> PeerId;

    /// Topic this channel is subscribed to.
    fn topic(&self) -> TopicId;

    /// Currently reachable peers, excluding ourselves.
    fn peers(&self) -> Vec<PeerId>;

    /// Send a one-way message.
    async fn send(&self, destination: Destination, message: &LogMessage) -> Result<(), NetError>;

    /// Send a request to one peer and wait for its answer.
    async fn request(
        &self,
        peer: PeerId,
        message: &LogMessage,
        timeout: Duration,
    ) -> Result<LogMessage, NetError>;

    /// A handle on the inbound stream.
    fn inbound(&self) -> Inbound;

    /// Leave the topic. Pending and future sends fail with
    /// [`NetError::Closed`]; the inbound stream ends once drained.
    async fn close(&self);
}

/// Opens channels for topics.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Join `topic` and return the channel.
    async fn open(&self, topic: TopicId) -> Result<Arc<dyn Channel>, NetError>;
}
