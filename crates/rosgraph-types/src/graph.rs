//! Records exchanged between nodes and the registry.

use crate::graph_name::GraphName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Name of the only transport protocol spoken between nodes.
pub const TCPROS: &str = "TCPROS";

/// Identity of a node: its name plus the address of its RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlaveDescription {
    pub name: GraphName,
    pub address: SocketAddr,
}

impl SlaveDescription {
    pub fn new(name: GraphName, address: SocketAddr) -> Self {
        Self { name, address }
    }
}

impl fmt::Display for SlaveDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// A negotiated transport returned by `requestTopic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescription {
    pub protocol: String,
    pub address: SocketAddr,
}

impl ProtocolDescription {
    pub fn tcpros(address: SocketAddr) -> Self {
        Self {
            protocol: TCPROS.to_string(),
            address,
        }
    }
}

/// A topic or service together with the names of the nodes attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEntry {
    pub name: GraphName,
    pub nodes: Vec<GraphName>,
}

/// Registry snapshot returned by `getSystemState`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub publishers: Vec<GraphEntry>,
    pub subscribers: Vec<GraphEntry>,
    pub services: Vec<GraphEntry>,
}

impl SystemState {
    /// Names of the nodes publishing `topic`, empty if none.
    pub fn publishers_of(&self, topic: &GraphName) -> Vec<GraphName> {
        find_nodes(&self.publishers, topic)
    }

    /// Names of the nodes subscribed to `topic`, empty if none.
    pub fn subscribers_of(&self, topic: &GraphName) -> Vec<GraphName> {
        find_nodes(&self.subscribers, topic)
    }

    /// Name of the node providing `service`, if any.
    pub fn provider_of(&self, service: &GraphName) -> Option<GraphName> {
        find_nodes(&self.services, service).into_iter().next()
    }
}

fn find_nodes(entries: &[GraphEntry], name: &GraphName) -> Vec<GraphName> {
    entries
        .iter()
        .find(|e| &e.name == name)
        .map(|e| e.nodes.clone())
        .unwrap_or_default()
}

/// A topic name and its declared message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicType {
    pub name: GraphName,
    pub type_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slave_description_equality() {
        let a = SlaveDescription::new(
            GraphName::new("/a").unwrap(),
            "127.0.0.1:1000".parse().unwrap(),
        );
        let same = a.clone();
        let moved = SlaveDescription::new(a.name.clone(), "127.0.0.1:1001".parse().unwrap());
        assert_eq!(a, same);
        assert_ne!(a, moved);
        assert_eq!(a.to_string(), "/a@127.0.0.1:1000");
    }

    #[test]
    fn test_system_state_lookup() {
        let topic = GraphName::new("/chatter").unwrap();
        let state = SystemState {
            publishers: vec![GraphEntry {
                name: topic.clone(),
                nodes: vec![GraphName::new("/talker").unwrap()],
            }],
            ..Default::default()
        };
        assert_eq!(state.publishers_of(&topic).len(), 1);
        assert!(state.subscribers_of(&topic).is_empty());
        assert!(state.provider_of(&topic).is_none());
    }
}
