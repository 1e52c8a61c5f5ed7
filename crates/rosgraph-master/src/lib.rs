//! The graph registry and parameter server.
//!
//! Nodes register the topics they publish and subscribe to and the services
//! they provide; the registry answers lookups and pushes publisher changes
//! to subscribers. It also hosts the parameter tree.

pub mod parameter;
pub mod registry;
pub mod server;

pub use parameter::ParameterTree;
pub use registry::{Registry, SlaveNotifier};
pub use server::{MasterServer, MASTER_CALLER_ID};
