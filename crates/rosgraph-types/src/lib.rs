//! Core types shared by every rosgraph crate.
//!
//! Graph names and their resolution, the error taxonomy, records exchanged
//! with the registry, identity/time sources and configuration. No networking
//! lives here.

pub mod config;
pub mod error;
pub mod graph;
pub mod graph_name;
pub mod identity;

pub use error::{RosError, RosResult};
pub use graph::{GraphEntry, ProtocolDescription, SlaveDescription, SystemState, TopicType, TCPROS};
pub use graph_name::{GraphName, NameResolver};
