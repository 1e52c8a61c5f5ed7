//! Typed client for the registry.

use super::client::RpcClient;
use super::message::RpcRequest;
use rosgraph_types::{GraphName, RosResult, SlaveDescription, SystemState, TopicType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Registry calls made on behalf of one node.
#[derive(Debug, Clone)]
pub struct MasterClient {
    rpc: RpcClient,
    caller_id: GraphName,
    caller_api: SocketAddr,
}

impl MasterClient {
    /// `caller_api` is the address of the calling node's own RPC endpoint.
    pub fn new(
        master_addr: SocketAddr,
        caller_id: GraphName,
        caller_api: SocketAddr,
        timeout: Duration,
    ) -> Self {
        Self {
            rpc: RpcClient::new(master_addr, timeout),
            caller_id,
            caller_api,
        }
    }

    pub fn master_addr(&self) -> SocketAddr {
        self.rpc.addr()
    }

    pub fn caller_id(&self) -> &GraphName {
        &self.caller_id
    }

    async fn call<T: DeserializeOwned>(&self, request: RpcRequest) -> RosResult<T> {
        self.rpc.call(request).await?.into_result()
    }

    /// Returns the topic's current subscribers.
    pub async fn register_publisher(
        &self,
        topic: &GraphName,
        topic_type: &str,
    ) -> RosResult<Vec<SlaveDescription>> {
        self.call(RpcRequest::RegisterPublisher {
            caller_id: self.caller_id.clone(),
            caller_api: self.caller_api,
            topic: topic.clone(),
            topic_type: topic_type.to_string(),
        })
        .await
    }

    /// Returns how many registrations were removed (0 or 1).
    pub async fn unregister_publisher(&self, topic: &GraphName) -> RosResult<u32> {
        self.call(RpcRequest::UnregisterPublisher {
            caller_id: self.caller_id.clone(),
            caller_api: self.caller_api,
            topic: topic.clone(),
        })
        .await
    }

    /// Returns the topic's current publishers.
    pub async fn register_subscriber(
        &self,
        topic: &GraphName,
        topic_type: &str,
    ) -> RosResult<Vec<SlaveDescription>> {
        self.call(RpcRequest::RegisterSubscriber {
            caller_id: self.caller_id.clone(),
            caller_api: self.caller_api,
            topic: topic.clone(),
            topic_type: topic_type.to_string(),
        })
        .await
    }

    pub async fn unregister_subscriber(&self, topic: &GraphName) -> RosResult<u32> {
        self.call(RpcRequest::UnregisterSubscriber {
            caller_id: self.caller_id.clone(),
            caller_api: self.caller_api,
            topic: topic.clone(),
        })
        .await
    }

    pub async fn register_service(
        &self,
        service: &GraphName,
        service_api: SocketAddr,
    ) -> RosResult<()> {
        self.call(RpcRequest::RegisterService {
            caller_id: self.caller_id.clone(),
            caller_api: self.caller_api,
            service: service.clone(),
            service_api,
        })
        .await
    }

    pub async fn unregister_service(
        &self,
        service: &GraphName,
        service_api: SocketAddr,
    ) -> RosResult<u32> {
        self.call(RpcRequest::UnregisterService {
            caller_id: self.caller_id.clone(),
            service: service.clone(),
            service_api,
        })
        .await
    }

    /// RPC address of the named node.
    pub async fn lookup_node(&self, node: &GraphName) -> RosResult<SocketAddr> {
        self.call(RpcRequest::LookupNode {
            caller_id: self.caller_id.clone(),
            node: node.clone(),
        })
        .await
    }

    /// TCPROS address of the named service's provider.
    pub async fn lookup_service(&self, service: &GraphName) -> RosResult<SocketAddr> {
        self.call(RpcRequest::LookupService {
            caller_id: self.caller_id.clone(),
            service: service.clone(),
        })
        .await
    }

    pub async fn get_system_state(&self) -> RosResult<SystemState> {
        self.call(RpcRequest::GetSystemState {
            caller_id: self.caller_id.clone(),
        })
        .await
    }

    pub async fn get_uri(&self) -> RosResult<SocketAddr> {
        self.call(RpcRequest::GetUri {
            caller_id: self.caller_id.clone(),
        })
        .await
    }

    pub async fn get_topic_types(&self) -> RosResult<Vec<TopicType>> {
        self.call(RpcRequest::GetTopicTypes {
            caller_id: self.caller_id.clone(),
        })
        .await
    }

    /// Topics with at least one publisher, optionally limited to `subgraph`.
    pub async fn get_published_topics(
        &self,
        subgraph: Option<&GraphName>,
    ) -> RosResult<Vec<TopicType>> {
        self.call(RpcRequest::GetPublishedTopics {
            caller_id: self.caller_id.clone(),
            subgraph: subgraph.cloned(),
        })
        .await
    }

    pub async fn set_param<T: Serialize>(&self, key: &GraphName, value: T) -> RosResult<()> {
        self.call(RpcRequest::SetParam {
            caller_id: self.caller_id.clone(),
            key: key.clone(),
            value: serde_json::to_value(value)?,
        })
        .await
    }

    /// The value at `key`; a namespace yields the whole sub-tree.
    pub async fn get_param(&self, key: &GraphName) -> RosResult<serde_json::Value> {
        self.call(RpcRequest::GetParam {
            caller_id: self.caller_id.clone(),
            key: key.clone(),
        })
        .await
    }

    pub async fn has_param(&self, key: &GraphName) -> RosResult<bool> {
        self.call(RpcRequest::HasParam {
            caller_id: self.caller_id.clone(),
            key: key.clone(),
        })
        .await
    }

    pub async fn delete_param(&self, key: &GraphName) -> RosResult<()> {
        self.call(RpcRequest::DeleteParam {
            caller_id: self.caller_id.clone(),
            key: key.clone(),
        })
        .await
    }

    /// The closest key named like `key`, searching from the caller's
    /// namespace upwards.
    pub async fn search_param(&self, key: &GraphName) -> RosResult<Option<GraphName>> {
        self.call(RpcRequest::SearchParam {
            caller_id: self.caller_id.clone(),
            key: key.clone(),
        })
        .await
    }

    pub async fn get_param_names(&self) -> RosResult<Vec<GraphName>> {
        self.call(RpcRequest::GetParamNames {
            caller_id: self.caller_id.clone(),
        })
        .await
    }

    /// Ask for `paramUpdate` calls whenever `key` or anything below it
    /// changes. Returns the current value, `null` if unset.
    pub async fn subscribe_param(&self, key: &GraphName) -> RosResult<serde_json::Value> {
        self.call(RpcRequest::SubscribeParam {
            caller_id: self.caller_id.clone(),
            caller_api: self.caller_api,
            key: key.clone(),
        })
        .await
    }

    /// Returns how many subscriptions were removed (0 or 1).
    pub async fn unsubscribe_param(&self, key: &GraphName) -> RosResult<u32> {
        self.call(RpcRequest::UnsubscribeParam {
            caller_id: self.caller_id.clone(),
            caller_api: self.caller_api,
            key: key.clone(),
        })
        .await
    }
}
