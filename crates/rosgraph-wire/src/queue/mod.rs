//! Message queues between sockets and application code.

pub mod circular;
pub mod incoming;
pub mod outgoing;

pub use circular::{CircularBuffer, QueueOverflowNotice};
pub use incoming::{BoxedReader, IncomingMessageQueue, ListenerHandle, MessageListener, ReaderHandle};
pub use outgoing::{BoxedWriter, OutgoingMessageQueue};
