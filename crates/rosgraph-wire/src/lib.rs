//! Node-to-node plumbing for the rosgraph middleware.
//!
//! Connection headers and their handshake, message framing, the outgoing and
//! incoming message queues, the TCPROS server/client, and the JSON RPC
//! channel used to reach the registry and node endpoints.

pub mod frame;
pub mod handshake;
pub mod header;
pub mod queue;
pub mod rpc;
pub mod server;
pub mod tcpros;

pub use handshake::{verify, Handshake, HandshakeState};
pub use header::ConnectionHeader;
pub use queue::{
    BoxedReader, BoxedWriter, CircularBuffer, IncomingMessageQueue, ListenerHandle,
    MessageListener, OutgoingMessageQueue, QueueOverflowNotice, ReaderHandle,
};
pub use rpc::{MasterClient, RpcClient, RpcHandler, RpcServer, SlaveClient};
pub use server::{ConnectionHandler, TcpServer};
pub use tcpros::{connect, ConnectionRouter, ServiceEndpoint, TcpRosServer, TopicEndpoint};
