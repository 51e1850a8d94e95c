//! Pairwise QUIC channel: every message is addressed to one peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tide_types::{PeerId, TopicId};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::channel::{Channel, Destination, Frame, Inbound};
use crate::error::NetError;
use crate::message::LogMessage;
use crate::quic::{Envelope, IrohNetwork};

/// Channel over direct QUIC connections.
///
/// Members are the peers that answered our hello on this topic or said
/// hello themselves. A send to [`Destination::All`] loops over them and
/// reports the first failure after trying all of them.
pub struct DirectChannel {
    network: IrohNetwork,
    topic: TopicId,
    registration: u64,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<Frame>>>,
    closed: AtomicBool,
}

impl DirectChannel {
    /// Register `topic` and greet every known peer.
    pub(crate) async fn open(network: IrohNetwork, topic: TopicId) -> Self {
        let (registration, rx) = network.shared().routes().register(topic);
        network.shared().say_hello(topic).await;
        Self {
            network,
            topic,
            registration,
            inbound: Arc::new(Mutex::new(rx)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), NetError> {
        if self.closed.load(Ordering::Acquire) {
            Err(NetError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send_to(&self, peer: PeerId, bytes: Vec<u8>) -> Result<(), NetError> {
        let envelope = Envelope::Message {
            topic: self.topic,
            bytes,
        };
        self.network.shared().send(peer, &envelope).await
    }
}

#[async_trait]
impl Channel for DirectChannel {
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
            Destination::Peer(peer) => self.send_to(peer, bytes).await,
            Destination::All => {
                let mut first_error = None;
                for peer in self.peers() {
                    if let Err(e) = self.send_to(peer, bytes.clone()).await {
                        debug!(peer = %peer.fmt_short(), %e, "direct send failed");
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
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
        debug!(topic = %self.topic.fmt_short(), "left topic");
    }
}

impl Drop for DirectChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.network
                .shared()
                .routes()
                .unregister(self.topic, self.registration);
        }
    }
}
