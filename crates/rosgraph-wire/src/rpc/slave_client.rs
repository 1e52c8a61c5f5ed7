//! Typed client for a node endpoint.

use super::client::RpcClient;
use super::message::RpcRequest;
use rosgraph_types::{
    GraphName, ProtocolDescription, RosResult, SlaveDescription, TopicType, TCPROS,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Calls another node's RPC endpoint.
#[derive(Debug, Clone)]
pub struct SlaveClient {
    rpc: RpcClient,
    caller_id: GraphName,
}

impl SlaveClient {
    pub fn new(addr: SocketAddr, caller_id: GraphName, timeout: Duration) -> Self {
        Self {
            rpc: RpcClient::new(addr, timeout),
            caller_id,
        }
    }

    /// Ask the node for a TCPROS connection to `topic`.
    pub async fn request_topic(&self, topic: &GraphName) -> RosResult<ProtocolDescription> {
        self.rpc
            .call(RpcRequest::RequestTopic {
                caller_id: self.caller_id.clone(),
                topic: topic.clone(),
                protocols: vec![TCPROS.to_string()],
            })
            .await?
            .into_result()
    }

    /// Tell a subscriber the full current publisher set of `topic`.
    pub async fn publisher_update(
        &self,
        topic: &GraphName,
        publishers: Vec<SlaveDescription>,
    ) -> RosResult<()> {
        self.rpc
            .call(RpcRequest::PublisherUpdate {
                caller_id: self.caller_id.clone(),
                topic: topic.clone(),
                publishers,
            })
            .await?
            .into_result()
    }

    /// Tell a parameter subscriber that `key` now holds `value`; `null`
    /// means it was deleted.
    pub async fn param_update(&self, key: &GraphName, value: serde_json::Value) -> RosResult<()> {
        self.rpc
            .call(RpcRequest::ParamUpdate {
                caller_id: self.caller_id.clone(),
                key: key.clone(),
                value,
            })
            .await?
            .into_result()
    }

    pub async fn get_pid(&self) -> RosResult<u32> {
        self.rpc
            .call(RpcRequest::GetPid {
                caller_id: self.caller_id.clone(),
            })
            .await?
            .into_result()
    }

    pub async fn get_master_uri(&self) -> RosResult<SocketAddr> {
        self.rpc
            .call(RpcRequest::GetMasterUri {
                caller_id: self.caller_id.clone(),
            })
            .await?
            .into_result()
    }

    pub async fn get_publications(&self) -> RosResult<Vec<TopicType>> {
        self.rpc
            .call(RpcRequest::GetPublications {
                caller_id: self.caller_id.clone(),
            })
            .await?
            .into_result()
    }

    pub async fn get_subscriptions(&self) -> RosResult<Vec<TopicType>> {
        self.rpc
            .call(RpcRequest::GetSubscriptions {
                caller_id: self.caller_id.clone(),
            })
            .await?
            .into_result()
    }

    /// Ask the node to shut down.
    pub async fn shutdown(&self, reason: &str) -> RosResult<()> {
        self.rpc
            .call(RpcRequest::Shutdown {
                caller_id: self.caller_id.clone(),
                reason: reason.to_string(),
            })
            .await?
            .into_result()
    }
}
