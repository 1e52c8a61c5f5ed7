//! Fan-out of published messages to every connected subscriber socket.

use crate::frame::encode_frame;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use rosgraph_message::MessageCodec;
use rosgraph_types::identity::IdSource;
use rosgraph_types::{RosError, RosResult};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Write half of a connection owned by a queue.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Channel {
    peer: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
}

impl Channel {
    async fn send(&self, frame: &Bytes, timeout: Duration) -> RosResult<()> {
        let mut writer = self.writer.lock().await;
        write_with_timeout(&mut writer, frame, timeout, &self.peer).await
    }
}

async fn write_with_timeout(
    writer: &mut BoxedWriter,
    frame: &Bytes,
    timeout: Duration,
    peer: &str,
) -> RosResult<()> {
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok::<(), RosError>(())
    };
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(RosError::Timeout {
            operation: format!("write to {peer}"),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Publishes messages of type `M` to a changing set of sockets.
///
/// Each publish serializes once and writes the same frame to every socket
/// from the caller's task. A socket whose write fails or times out is
/// dropped without affecting the others.
pub struct OutgoingMessageQueue<M> {
    topic: String,
    channels: DashMap<u64, Arc<Channel>>,
    latch: AtomicBool,
    latched: Mutex<Option<Bytes>>,
    write_timeout: Duration,
    ids: Arc<dyn IdSource>,
    _message: PhantomData<fn(&M)>,
}

impl<M: MessageCodec> OutgoingMessageQueue<M> {
    pub fn new(topic: impl Into<String>, write_timeout: Duration, ids: Arc<dyn IdSource>) -> Self {
        Self {
            topic: topic.into(),
            channels: DashMap::new(),
            latch: AtomicBool::new(false),
            latched: Mutex::new(None),
            write_timeout,
            ids,
            _message: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// When enabled, the last published message is written to each socket
    /// added afterwards.
    pub fn set_latch(&self, enabled: bool) {
        self.latch.store(enabled, Ordering::Release);
        if !enabled {
            *self.latched.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    pub fn is_latched(&self) -> bool {
        self.latch.load(Ordering::Acquire)
    }

    /// Number of attached sockets.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Attach a socket and return its id. With latching on, the last message
    /// is written to it first; if that write fails the socket is not kept.
    pub async fn add_socket(&self, writer: BoxedWriter, peer: impl Into<String>) -> RosResult<u64> {
        let id = self.ids.next_id();
        let channel = Arc::new(Channel {
            peer: peer.into(),
            writer: tokio::sync::Mutex::new(writer),
        });
        // Hold the writer until the latched frame is out so a concurrent
        // publish cannot overtake it.
        let mut writer = channel.writer.lock().await;
        self.channels.insert(id, Arc::clone(&channel));
        let latched = if self.is_latched() {
            self.latched.lock().unwrap_or_else(|e| e.into_inner()).clone()
        } else {
            None
        };
        if let Some(frame) = latched {
            if let Err(e) =
                write_with_timeout(&mut writer, &frame, self.write_timeout, &channel.peer).await
            {
                drop(writer);
                self.channels.remove(&id);
                warn!(topic = %self.topic, peer = %channel.peer, error = %e, "Latched write failed, dropping socket");
                return Err(e);
            }
        }
        drop(writer);
        debug!(topic = %self.topic, peer = %channel.peer, id, "Socket attached");
        Ok(id)
    }

    /// Detach and close a socket. Returns whether it was attached.
    pub fn remove_socket(&self, id: u64) -> bool {
        self.channels.remove(&id).is_some()
    }

    /// Serialize `message` once and write it to every socket.
    ///
    /// Returns the number of sockets the frame reached.
    pub async fn publish(&self, message: &M) -> RosResult<usize> {
        let payload = message.to_bytes()?;
        self.publish_payload(&payload).await
    }

    /// Write an already serialized payload to every socket.
    pub async fn publish_payload(&self, payload: &[u8]) -> RosResult<usize> {
        let frame = encode_frame(payload)?;
        if self.is_latched() {
            *self.latched.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame.clone());
        }

        let targets: Vec<(u64, Arc<Channel>)> = self
            .channels
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let timeout = self.write_timeout;
        let results = join_all(targets.iter().map(|(id, channel)| {
            let frame = &frame;
            async move { (*id, channel.send(frame, timeout).await) }
        }))
        .await;

        let mut delivered = 0;
        for ((id, channel), (_, result)) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(topic = %self.topic, peer = %channel.peer, error = %e, "Write failed, dropping socket");
                    self.channels.remove(id);
                }
            }
        }
        Ok(delivered)
    }

    /// Close every socket.
    pub fn shutdown(&self) {
        self.channels.clear();
        *self.latched.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use rosgraph_message::{MessageRegistry, RuntimeMessage};
    use rosgraph_types::identity::SequentialIds;

    fn queue() -> OutgoingMessageQueue<RuntimeMessage> {
        OutgoingMessageQueue::new(
            "/chatter",
            Duration::from_millis(200),
            Arc::new(SequentialIds::new()),
        )
    }

    fn message(text: &str) -> RuntimeMessage {
        MessageRegistry::with_std_msgs()
            .new_message("std_msgs/String")
            .unwrap()
            .with("data", text)
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_reaches_every_socket() {
        let queue = queue();
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);
        queue.add_socket(Box::new(a), "a").await.unwrap();
        queue.add_socket(Box::new(b), "b").await.unwrap();

        let msg = message("hi");
        assert_eq!(queue.publish(&msg).await.unwrap(), 2);
        let expected = msg.to_bytes().unwrap();
        assert_eq!(read_frame(&mut a_peer).await.unwrap(), expected);
        assert_eq!(read_frame(&mut b_peer).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_failed_socket_is_dropped_alone() {
        let queue = queue();
        let (good, mut good_peer) = tokio::io::duplex(1024);
        let (bad, bad_peer) = tokio::io::duplex(1024);
        queue.add_socket(Box::new(good), "good").await.unwrap();
        queue.add_socket(Box::new(bad), "bad").await.unwrap();
        drop(bad_peer);

        assert_eq!(queue.publish(&message("one")).await.unwrap(), 1);
        assert_eq!(queue.len(), 1);
        assert!(read_frame(&mut good_peer).await.is_ok());
    }

    #[tokio::test]
    async fn test_stalled_socket_times_out() {
        let queue = queue();
        // Too small to hold one frame and never drained.
        let (stalled, _stalled_peer) = tokio::io::duplex(4);
        queue.add_socket(Box::new(stalled), "stalled").await.unwrap();
        assert_eq!(queue.publish(&message("blocked")).await.unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_latch_replays_to_new_socket() {
        let queue = queue();
        queue.set_latch(true);
        queue.publish(&message("first")).await.unwrap();
        let last = message("last");
        queue.publish(&last).await.unwrap();

        let (late, mut late_peer) = tokio::io::duplex(1024);
        queue.add_socket(Box::new(late), "late").await.unwrap();
        assert_eq!(read_frame(&mut late_peer).await.unwrap(), last.to_bytes().unwrap());
    }

    #[tokio::test]
    async fn test_no_replay_without_latch() {
        let queue = queue();
        queue.publish(&message("gone")).await.unwrap();
        let (late, mut late_peer) = tokio::io::duplex(1024);
        queue.add_socket(Box::new(late), "late").await.unwrap();
        let read = tokio::time::timeout(Duration::from_millis(50), read_frame(&mut late_peer)).await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_remove_socket() {
        let queue = queue();
        let (a, _a_peer) = tokio::io::duplex(1024);
        let id = queue.add_socket(Box::new(a), "a").await.unwrap();
        assert!(queue.remove_socket(id));
        assert!(!queue.remove_socket(id));
        assert_eq!(queue.publish(&message("x")).await.unwrap(), 0);
    }
}
