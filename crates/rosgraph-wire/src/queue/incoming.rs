//! Receive side: socket readers feed a bounded buffer, a dispatcher decodes
//! and fans messages out to per-listener queues.

use super::circular::CircularBuffer;
use crate::frame::read_frame;
use dashmap::DashMap;
use rosgraph_message::{LazyMessage, MessageCodec, TypeDescriptor};
use rosgraph_types::identity::IdSource;
use rosgraph_types::RosError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read half of a connection owned by a queue.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Receives decoded messages on a delivery task.
pub trait MessageListener<M>: Send + Sync + 'static {
    fn on_new_message(&self, message: Arc<M>);
}

impl<M, F> MessageListener<M> for F
where
    F: Fn(Arc<M>) + Send + Sync + 'static,
{
    fn on_new_message(&self, message: Arc<M>) {
        self(message)
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// A reader task attached by [`IncomingMessageQueue::add_socket`].
#[derive(Debug)]
pub struct ReaderHandle {
    id: u64,
    closed: oneshot::Receiver<()>,
}

impl ReaderHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the reader has stopped, for whatever reason.
    pub async fn closed(self) {
        let _ = self.closed.await;
    }
}

struct Inner<M> {
    topic: String,
    descriptor: Arc<TypeDescriptor>,
    buffer: CircularBuffer<LazyMessage<M>>,
    listeners: DashMap<u64, Arc<CircularBuffer<Arc<M>>>>,
    readers: DashMap<u64, JoinHandle<()>>,
    latch: AtomicBool,
    latched: Mutex<Option<Arc<M>>>,
    listener_capacity: usize,
    ids: Arc<dyn IdSource>,
    shutdown: watch::Sender<bool>,
}

/// Incoming message pipeline for one subscription.
///
/// Messages nobody listens to (with latching off) are never decoded.
pub struct IncomingMessageQueue<M> {
    inner: Arc<Inner<M>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<M: MessageCodec> IncomingMessageQueue<M> {
    /// Create the queue and start its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(
        topic: impl Into<String>,
        descriptor: Arc<TypeDescriptor>,
        capacity: usize,
        listener_capacity: usize,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            topic: topic.into(),
            descriptor,
            buffer: CircularBuffer::new(capacity),
            listeners: DashMap::new(),
            readers: DashMap::new(),
            latch: AtomicBool::new(false),
            latched: Mutex::new(None),
            listener_capacity: listener_capacity.max(1),
            ids,
            shutdown,
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.inner.descriptor
    }

    /// When enabled, the last dispatched message is handed to listeners
    /// added later.
    pub fn set_latch(&self, enabled: bool) {
        self.inner.latch.store(enabled, Ordering::Release);
        if !enabled {
            *self.inner.latched.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    pub fn is_latched(&self) -> bool {
        self.inner.latch.load(Ordering::Acquire)
    }

    /// Change the capacity of the receive buffer.
    pub fn set_limit(&self, limit: usize) {
        let dropped = self.inner.buffer.set_limit(limit);
        if dropped > 0 {
            debug!(topic = %self.inner.topic, dropped, limit, "Buffer shrunk, oldest messages dropped");
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.buffer.limit()
    }

    /// Messages waiting for the dispatcher.
    pub fn pending(&self) -> usize {
        self.inner.buffer.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn reader_count(&self) -> usize {
        self.inner.readers.len()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Register a listener; with latching on it immediately receives the
    /// last message.
    pub fn add_listener(&self, listener: impl MessageListener<M>) -> ListenerHandle {
        let id = self.inner.ids.next_id();
        let queue = Arc::new(CircularBuffer::new(self.inner.listener_capacity));
        tokio::spawn(delivery_loop(
            Arc::clone(&queue),
            listener,
            self.inner.shutdown.subscribe(),
        ));
        if self.is_shutdown() {
            queue.close();
        }

        // Under the latch lock so the dispatcher cannot deliver the same
        // message twice to this listener.
        let latched = self.inner.latched.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_latched() {
            if let Some(message) = latched.as_ref() {
                queue.push(Arc::clone(message));
            }
        }
        self.inner.listeners.insert(id, queue);
        drop(latched);

        debug!(topic = %self.inner.topic, listener = id, "Listener added");
        ListenerHandle(id)
    }

    /// Remove a listener. Its current callback, if any, completes.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        match self.inner.listeners.remove(&handle.0) {
            Some((_, queue)) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Start a reader task that feeds frames from `reader` into the buffer.
    pub fn add_socket(&self, reader: BoxedReader, peer: impl Into<String>) -> ReaderHandle {
        let id = self.inner.ids.next_id();
        let (closed_tx, closed_rx) = oneshot::channel();
        let (registered_tx, registered_rx) = oneshot::channel();
        let task = tokio::spawn(read_loop(
            Arc::clone(&self.inner),
            id,
            reader,
            peer.into(),
            registered_rx,
            closed_tx,
        ));
        // The reader removes its own entry on exit, so it may only start once
        // the entry exists.
        self.inner.readers.insert(id, task);
        let _ = registered_tx.send(());
        ReaderHandle {
            id,
            closed: closed_rx,
        }
    }

    /// Stop a reader and close its socket.
    pub fn remove_socket(&self, id: u64) -> bool {
        match self.inner.readers.remove(&id) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Stop readers, the dispatcher and every delivery task.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.buffer.close();
        for entry in self.inner.listeners.iter() {
            entry.value().close();
        }
        self.inner.listeners.clear();
        let readers: Vec<u64> = self.inner.readers.iter().map(|e| *e.key()).collect();
        for id in readers {
            self.remove_socket(id);
        }
        debug!(topic = %self.inner.topic, "Incoming queue shut down");
    }

    /// Wait for the dispatcher to exit after [`IncomingMessageQueue::shutdown`].
    pub async fn join(&self) {
        let task = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl<M> Drop for IncomingMessageQueue<M> {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        self.inner.buffer.close();
        for entry in self.inner.listeners.iter() {
            entry.value().close();
        }
        for entry in self.inner.readers.iter() {
            entry.value().abort();
        }
    }
}

async fn read_loop<M: MessageCodec>(
    inner: Arc<Inner<M>>,
    id: u64,
    mut reader: BoxedReader,
    peer: String,
    registered: oneshot::Receiver<()>,
    _closed: oneshot::Sender<()>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    if registered.await.is_err() || *shutdown.borrow_and_update() {
        inner.readers.remove(&id);
        return;
    }
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(bytes) => {
                let message = LazyMessage::new(bytes, Arc::clone(&inner.descriptor));
                if let Some(notice) = inner.buffer.push(message) {
                    debug!(topic = %inner.topic, peer = %peer, evicted = notice.evicted, limit = notice.limit, "Incoming buffer full, dropped oldest");
                }
            }
            Err(RosError::ConnectionClosed) => {
                debug!(topic = %inner.topic, peer = %peer, "Publisher closed connection");
                break;
            }
            Err(e) => {
                warn!(topic = %inner.topic, peer = %peer, error = %e, "Read failed, closing connection");
                break;
            }
        }
    }
    inner.readers.remove(&id);
}

async fn dispatch_loop<M: MessageCodec>(inner: Arc<Inner<M>>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let lazy = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = inner.buffer.pop() => match next {
                Some(lazy) => lazy,
                None => break,
            },
        };
        dispatch(&inner, lazy);
    }
    debug!(topic = %inner.topic, "Dispatcher stopped");
}

fn dispatch<M: MessageCodec>(inner: &Inner<M>, lazy: LazyMessage<M>) {
    let latch = inner.latch.load(Ordering::Acquire);
    if inner.listeners.is_empty() && !latch {
        return;
    }
    let message = match lazy.get() {
        Ok(message) => message,
        Err(e) => {
            warn!(topic = %inner.topic, error = %e, "Dropping undecodable message");
            return;
        }
    };

    let mut latched = inner.latched.lock().unwrap_or_else(|e| e.into_inner());
    if latch {
        *latched = Some(Arc::clone(&message));
    }
    for entry in inner.listeners.iter() {
        if let Some(notice) = entry.value().push(Arc::clone(&message)) {
            debug!(topic = %inner.topic, listener = *entry.key(), evicted = notice.evicted, "Listener queue full, dropped oldest");
        }
    }
    drop(latched);
}

async fn delivery_loop<M, L>(
    queue: Arc<CircularBuffer<Arc<M>>>,
    listener: L,
    mut shutdown: watch::Receiver<bool>,
) where
    M: Send + Sync + 'static,
    L: MessageListener<M>,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = queue.pop() => match next {
                Some(message) => message,
                None => break,
            },
        };
        listener.on_new_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::write_frame;
    use rosgraph_message::{MessageRegistry, RuntimeMessage};
    use rosgraph_types::identity::SequentialIds;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry() -> MessageRegistry {
        MessageRegistry::with_std_msgs()
    }

    fn queue(registry: &MessageRegistry, capacity: usize) -> IncomingMessageQueue<RuntimeMessage> {
        IncomingMessageQueue::new(
            "/chatter",
            registry.get("std_msgs/String").unwrap(),
            capacity,
            16,
            Arc::new(SequentialIds::new()),
        )
    }

    fn payload(registry: &MessageRegistry, text: &str) -> Vec<u8> {
        registry
            .new_message("std_msgs/String")
            .unwrap()
            .with("data", text)
            .unwrap()
            .to_bytes()
            .unwrap()
            .to_vec()
    }

    fn text(message: &RuntimeMessage) -> String {
        message.get("data").unwrap().as_str().unwrap().to_string()
    }

    fn channel_listener(
        tx: mpsc::UnboundedSender<String>,
    ) -> impl Fn(Arc<RuntimeMessage>) + Send + Sync + 'static {
        move |message: Arc<RuntimeMessage>| {
            let _ = tx.send(text(&message));
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_reader_closed_at_once_leaves_no_entry() {
        let registry = registry();
        let queue = queue(&registry, 4);
        for _ in 0..32 {
            let handle = queue.add_socket(Box::new(tokio::io::empty()), "eof");
            handle.closed().await;
        }
        assert_eq!(queue.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_socket_added_after_shutdown_is_not_read() {
        let registry = registry();
        let queue = queue(&registry, 4);
        queue.shutdown();
        let (_writer, reader) = tokio::io::duplex(64);
        let handle = queue.add_socket(Box::new(reader), "late");
        tokio::time::timeout(Duration::from_secs(2), handle.closed())
            .await
            .expect("reader kept running after shutdown");
        assert_eq!(queue.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_delivers_to_every_listener_in_order() {
        let registry = registry();
        let queue = queue(&registry, 64);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        queue.add_listener(channel_listener(tx1));
        queue.add_listener(channel_listener(tx2));

        let (reader, mut writer) = tokio::io::duplex(4096);
        queue.add_socket(Box::new(reader), "pub");
        for word in ["a", "b", "c"] {
            write_frame(&mut writer, &payload(&registry, word)).await.unwrap();
        }
        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(recv(rx).await.as_deref(), Some("a"));
            assert_eq!(recv(rx).await.as_deref(), Some("b"));
            assert_eq!(recv(rx).await.as_deref(), Some("c"));
        }
    }

    #[tokio::test]
    async fn test_latch_redelivers_to_late_listener() {
        let registry = registry();
        let queue = queue(&registry, 64);
        queue.set_latch(true);
        let (reader, mut writer) = tokio::io::duplex(4096);
        queue.add_socket(Box::new(reader), "pub");
        write_frame(&mut writer, &payload(&registry, "old")).await.unwrap();
        write_frame(&mut writer, &payload(&registry, "latest")).await.unwrap();

        // Latched messages are decoded even with no listener attached.
        for _ in 0..100 {
            if queue.pending() == 0
                && queue.inner.latched.lock().unwrap().as_ref().map(|m| text(m))
                    == Some("latest".to_string())
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.add_listener(channel_listener(tx));
        assert_eq!(recv(&mut rx).await.as_deref(), Some("latest"));
    }

    #[tokio::test]
    async fn test_no_redelivery_without_latch() {
        let registry = registry();
        let queue = queue(&registry, 64);
        let (reader, mut writer) = tokio::io::duplex(4096);
        queue.add_socket(Box::new(reader), "pub");
        write_frame(&mut writer, &payload(&registry, "missed")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.add_listener(channel_listener(tx));
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_listener_does_not_starve_fast_one() {
        let registry = registry();
        let queue = queue(&registry, 64);
        let slow_calls = Arc::new(AtomicUsize::new(0));
        {
            let slow_calls = Arc::clone(&slow_calls);
            queue.add_listener(move |_m: Arc<RuntimeMessage>| {
                slow_calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
            });
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.add_listener(channel_listener(tx));

        let (reader, mut writer) = tokio::io::duplex(4096);
        queue.add_socket(Box::new(reader), "pub");
        for i in 0..5 {
            write_frame(&mut writer, &payload(&registry, &i.to_string()))
                .await
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(recv(&mut rx).await, Some(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let registry = registry();
        let queue = queue(&registry, 64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = queue.add_listener(channel_listener(tx));
        assert!(queue.remove_listener(handle));
        assert!(!queue.remove_listener(handle));
        assert_eq!(queue.listener_count(), 0);

        let (reader, mut writer) = tokio::io::duplex(4096);
        queue.add_socket(Box::new(reader), "pub");
        write_frame(&mut writer, &payload(&registry, "x")).await.unwrap();
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_reader_handle_reports_close() {
        let registry = registry();
        let queue = queue(&registry, 64);
        let (reader, writer) = tokio::io::duplex(4096);
        let handle = queue.add_socket(Box::new(reader), "pub");
        assert_eq!(queue.reader_count(), 1);
        drop(writer);
        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .unwrap();
        for _ in 0..50 {
            if queue.reader_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_set_limit_and_shutdown() {
        let registry = registry();
        let queue = queue(&registry, 64);
        queue.set_limit(4);
        assert_eq!(queue.limit(), 4);

        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.add_listener(channel_listener(tx));
        let (reader, mut writer) = tokio::io::duplex(4096);
        let handle = queue.add_socket(Box::new(reader), "pub");

        queue.shutdown();
        assert!(queue.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), queue.join())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .unwrap();
        let _ = write_frame(&mut writer, &payload(&registry, "late")).await;
        assert!(recv(&mut rx).await.is_none());
    }
}
