//! Topic subscribers.
//!
//! A subscriber keeps one link per known publisher. Each link asks the
//! publisher's node endpoint for a TCPROS address, connects, hands the
//! socket to the incoming queue and waits for it to close, reconnecting with
//! backoff until the registry says the publisher is gone. A publisher that
//! rejects the handshake is not retried.

use crate::manager::{LocalSubscriber, Registration};
use async_trait::async_trait;
use dashmap::DashMap;
use rosgraph_message::{MessageCodec, TypeDescriptor};
use rosgraph_types::identity::IdSource;
use rosgraph_types::{GraphName, RosError, RosResult, SlaveDescription, TCPROS};
use rosgraph_wire::header::{
    CALLER_ID, LATCHING, MD5_CHECKSUM, MESSAGE_DEFINITION, TCP_NODELAY, TOPIC, TYPE,
};
use rosgraph_wire::tcpros;
use rosgraph_wire::{
    ConnectionHeader, IncomingMessageQueue, ListenerHandle, MessageListener, ReaderHandle,
    SlaveClient,
};
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Settings a subscriber needs from its node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubscriberOptions {
    pub queue_capacity: usize,
    pub listener_capacity: usize,
    pub handshake_timeout: Duration,
    pub rpc_timeout: Duration,
}

struct LinkContext<M> {
    topic: GraphName,
    caller_id: GraphName,
    header: ConnectionHeader,
    queue: IncomingMessageQueue<M>,
    connected: watch::Sender<usize>,
    rejected: DashMap<GraphName, String>,
    options: SubscriberOptions,
}

struct PublisherLink {
    task: JoinHandle<()>,
    reader: Arc<Mutex<Option<u64>>>,
}

/// Decrements the connected count when a link's connection ends, including
/// when its task is aborted.
struct ConnectedGuard<'a>(&'a watch::Sender<usize>);

impl Drop for ConnectedGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn connect_once<M: MessageCodec>(
    ctx: &LinkContext<M>,
    publisher: &SlaveDescription,
) -> RosResult<ReaderHandle> {
    let slave = SlaveClient::new(
        publisher.address,
        ctx.caller_id.clone(),
        ctx.options.rpc_timeout,
    );
    let protocol = slave.request_topic(&ctx.topic).await?;
    if protocol.protocol != TCPROS {
        return Err(RosError::RegistryFault {
            code: 0,
            message: format!("unsupported protocol {}", protocol.protocol),
        });
    }
    let (stream, remote) =
        tcpros::connect(protocol.address, &ctx.header, ctx.options.handshake_timeout).await?;
    info!(
        topic = %ctx.topic,
        publisher = %publisher.name,
        addr = %protocol.address,
        latching = remote.flag(LATCHING),
        "Connected to publisher"
    );
    Ok(ctx.queue.add_socket(Box::new(stream), publisher.to_string()))
}

async fn maintain_link<M: MessageCodec>(
    ctx: Arc<LinkContext<M>>,
    publisher: SlaveDescription,
    reader: Arc<Mutex<Option<u64>>>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connect_once(&ctx, &publisher).await {
            Ok(handle) => {
                backoff = INITIAL_BACKOFF;
                *reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.id());
                ctx.connected.send_modify(|n| *n += 1);
                let guard = ConnectedGuard(&ctx.connected);
                handle.closed().await;
                drop(guard);
                reader.lock().unwrap_or_else(|e| e.into_inner()).take();
                debug!(topic = %ctx.topic, publisher = %publisher, "Publisher connection closed");
            }
            Err(e @ RosError::HandshakeMismatch { .. }) => {
                warn!(topic = %ctx.topic, publisher = %publisher, error = %e, "Publisher rejected connection");
                ctx.rejected.insert(publisher.name.clone(), e.to_string());
                return;
            }
            Err(e) => {
                warn!(topic = %ctx.topic, publisher = %publisher, error = %e, "Could not connect to publisher");
            }
        }
        if ctx.queue.is_shutdown() {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

pub(crate) struct SubscriberInner<M> {
    descriptor: Arc<TypeDescriptor>,
    ctx: Arc<LinkContext<M>>,
    links: DashMap<SlaveDescription, PublisherLink>,
    registration: Registration,
    closed: AtomicBool,
}

impl<M: MessageCodec> SubscriberInner<M> {
    /// Must be called inside a tokio runtime.
    pub(crate) fn new(
        topic: GraphName,
        caller_id: GraphName,
        descriptor: Arc<TypeDescriptor>,
        options: SubscriberOptions,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        let header = ConnectionHeader::new()
            .with(CALLER_ID, caller_id.as_str())
            .with(TOPIC, topic.as_str())
            .with(TYPE, descriptor.name())
            .with(MD5_CHECKSUM, descriptor.fingerprint())
            .with(MESSAGE_DEFINITION, descriptor.definition())
            .with(TCP_NODELAY, "1");
        let queue = IncomingMessageQueue::new(
            topic.as_str(),
            Arc::clone(&descriptor),
            options.queue_capacity,
            options.listener_capacity,
            ids,
        );
        let (connected, _) = watch::channel(0);
        Self {
            descriptor,
            ctx: Arc::new(LinkContext {
                topic,
                caller_id,
                header,
                queue,
                connected,
                rejected: DashMap::new(),
                options,
            }),
            links: DashMap::new(),
            registration: Registration::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn drop_link(&self, publisher: &SlaveDescription) {
        if let Some((_, link)) = self.links.remove(publisher) {
            link.task.abort();
            let reader = link.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(id) = reader {
                self.ctx.queue.remove_socket(id);
            }
            self.ctx.rejected.remove(&publisher.name);
            debug!(topic = %self.ctx.topic, publisher = %publisher, "Dropped publisher link");
        }
    }
}

#[async_trait]
impl<M: MessageCodec> LocalSubscriber for SubscriberInner<M> {
    fn topic(&self) -> &GraphName {
        &self.ctx.topic
    }

    fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    fn update_publishers(&self, publishers: Vec<SlaveDescription>, prune: bool) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if prune {
            let wanted: HashSet<&SlaveDescription> = publishers.iter().collect();
            let stale: Vec<SlaveDescription> = self
                .links
                .iter()
                .filter(|e| !wanted.contains(e.key()))
                .map(|e| e.key().clone())
                .collect();
            for publisher in stale {
                self.drop_link(&publisher);
            }
        }
        for publisher in publishers {
            self.links.entry(publisher.clone()).or_insert_with(|| {
                debug!(topic = %self.ctx.topic, publisher = %publisher, "New publisher link");
                let reader = Arc::new(Mutex::new(None));
                let task = tokio::spawn(maintain_link(
                    Arc::clone(&self.ctx),
                    publisher,
                    Arc::clone(&reader),
                ));
                PublisherLink { task, reader }
            });
        }
    }

    fn registration(&self) -> &Registration {
        &self.registration
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let publishers: Vec<SlaveDescription> =
            self.links.iter().map(|e| e.key().clone()).collect();
        for publisher in publishers {
            self.drop_link(&publisher);
        }
        self.ctx.queue.shutdown();
        self.ctx.queue.join().await;
        info!(topic = %self.ctx.topic, "Subscriber shut down");
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Receives messages of type `M` from every publisher of one topic.
///
/// Cloning yields another handle to the same subscription.
pub struct Subscriber<M> {
    inner: Arc<SubscriberInner<M>>,
}

impl<M> Clone for Subscriber<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: MessageCodec> Subscriber<M> {
    pub(crate) fn from_inner(inner: Arc<SubscriberInner<M>>) -> Self {
        Self { inner }
    }

    pub fn topic(&self) -> &GraphName {
        &self.inner.ctx.topic
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.inner.descriptor
    }

    /// Register a callback, run on its own delivery task.
    pub fn add_listener(&self, listener: impl MessageListener<M>) -> ListenerHandle {
        self.inner.ctx.queue.add_listener(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.ctx.queue.remove_listener(handle)
    }

    /// When on, the latest message is kept and handed to listeners added
    /// later.
    pub fn set_latch_mode(&self, enabled: bool) {
        self.inner.ctx.queue.set_latch(enabled);
    }

    /// Resize the incoming buffer; the oldest pending messages are dropped
    /// if it shrinks below its fill level.
    pub fn set_queue_limit(&self, limit: usize) {
        self.inner.ctx.queue.set_limit(limit);
    }

    /// Publishers whose handshake failed, with the cause. These links stay
    /// down until the registry drops and re-announces the publisher.
    pub fn rejected_publishers(&self) -> Vec<(GraphName, String)> {
        self.inner
            .ctx
            .rejected
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of publishers currently connected.
    pub fn publisher_count(&self) -> usize {
        *self.inner.ctx.connected.borrow()
    }

    /// Wait until at least `count` publishers are connected.
    pub async fn wait_for_publishers(&self, count: usize, timeout: Duration) -> RosResult<()> {
        let mut rx = self.inner.ctx.connected.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RosError::NotRunning(format!(
                "subscriber {}",
                self.inner.ctx.topic
            ))),
            Err(_) => Err(RosError::Timeout {
                operation: format!("waiting for {count} publisher(s) on {}", self.inner.ctx.topic),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
