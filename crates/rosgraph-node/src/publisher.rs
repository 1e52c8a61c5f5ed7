//! Topic publishers.

use crate::manager::{LocalPublisher, Registration};
use async_trait::async_trait;
use rosgraph_message::{MessageCodec, TypeDescriptor};
use rosgraph_types::identity::IdSource;
use rosgraph_types::{GraphName, RosError, RosResult};
use rosgraph_wire::header::{CALLER_ID, LATCHING, MD5_CHECKSUM, MESSAGE_DEFINITION, TOPIC, TYPE};
use rosgraph_wire::{ConnectionHeader, OutgoingMessageQueue, TopicEndpoint};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

pub(crate) struct PublisherInner<M> {
    topic: GraphName,
    caller_id: GraphName,
    descriptor: Arc<TypeDescriptor>,
    queue: Arc<OutgoingMessageQueue<M>>,
    registration: Registration,
}

impl<M: MessageCodec> PublisherInner<M> {
    pub(crate) fn new(
        topic: GraphName,
        caller_id: GraphName,
        descriptor: Arc<TypeDescriptor>,
        latch: bool,
        write_timeout: Duration,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        let queue = OutgoingMessageQueue::new(topic.as_str(), write_timeout, ids);
        queue.set_latch(latch);
        Self {
            topic,
            caller_id,
            descriptor,
            queue: Arc::new(queue),
            registration: Registration::default(),
        }
    }
}

#[async_trait]
impl<M: MessageCodec> TopicEndpoint for PublisherInner<M> {
    fn header(&self) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(CALLER_ID, self.caller_id.as_str())
            .with(TOPIC, self.topic.as_str())
            .with(TYPE, self.descriptor.name())
            .with(MD5_CHECKSUM, self.descriptor.fingerprint())
            .with(MESSAGE_DEFINITION, self.descriptor.definition())
            .with(LATCHING, if self.queue.is_latched() { "1" } else { "0" })
    }

    async fn attach(&self, stream: TcpStream, peer: SocketAddr) -> RosResult<()> {
        let (mut read_half, write_half) = stream.into_split();
        let id = self
            .queue
            .add_socket(Box::new(write_half), peer.to_string())
            .await?;

        // Subscribers never write after the handshake; EOF means they left.
        let queue = Arc::clone(&self.queue);
        let topic = self.topic.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            if queue.remove_socket(id) {
                debug!(topic = %topic, peer = %peer, "Subscriber disconnected");
            }
        });
        Ok(())
    }
}

impl<M: MessageCodec> LocalPublisher for PublisherInner<M> {
    fn topic(&self) -> &GraphName {
        &self.topic
    }

    fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    fn registration(&self) -> &Registration {
        &self.registration
    }

    fn shutdown(&self) {
        self.queue.shutdown();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_endpoint(self: Arc<Self>) -> Arc<dyn TopicEndpoint> {
        self
    }
}

/// Publishes messages of type `M` on one topic.
///
/// Cloning yields another handle to the same publisher.
pub struct Publisher<M> {
    inner: Arc<PublisherInner<M>>,
}

impl<M> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: MessageCodec> Publisher<M> {
    pub(crate) fn from_inner(inner: Arc<PublisherInner<M>>) -> Self {
        Self { inner }
    }

    pub fn topic(&self) -> &GraphName {
        &self.inner.topic
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.inner.descriptor
    }

    pub fn is_latched(&self) -> bool {
        self.inner.queue.is_latched()
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Send `message` to every connected subscriber. Returns how many it
    /// reached.
    pub async fn publish(&self, message: &M) -> RosResult<usize> {
        let fingerprint = message.descriptor().fingerprint();
        if fingerprint != self.inner.descriptor.fingerprint() {
            return Err(RosError::mismatch(
                TYPE,
                self.inner.descriptor.name(),
                message.descriptor().name(),
            ));
        }
        self.inner.queue.publish(message).await
    }
}
