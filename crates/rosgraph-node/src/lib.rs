//! A node in the rosgraph: publishers, subscribers, service servers and
//! clients, and the endpoint the registry and other nodes call.
//!
//! [`Node::start`] brings up the node's TCPROS server and RPC endpoint;
//! everything else hangs off the returned handle.

pub mod manager;
pub mod node;
pub mod parameter;
pub mod publisher;
pub mod service;
mod slave;
pub mod subscriber;

pub use manager::{Managers, ServiceManager, TopicManager};
pub use node::Node;
pub use parameter::ParameterCache;
pub use publisher::Publisher;
pub use service::{ServiceClient, ServiceHandler, ServiceServer};
pub use subscriber::Subscriber;
