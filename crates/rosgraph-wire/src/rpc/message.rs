//! RPC message types.
//!
//! Calls to the registry and to node endpoints are JSON-framed messages over
//! TCP. Each message is prefixed with a 4-byte big-endian length header.

use rosgraph_types::{GraphName, RosError, RosResult, SlaveDescription};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Largest accepted RPC message body.
pub const MAX_RPC_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// An RPC message (envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Correlates a response with its request.
    pub id: String,
    #[serde(flatten)]
    pub kind: RpcMessageKind,
}

impl RpcMessage {
    /// A request with a fresh id.
    pub fn request(request: RpcRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: RpcMessageKind::Request(request),
        }
    }

    /// A response correlated with `id`.
    pub fn response(id: impl Into<String>, response: RpcResponse) -> Self {
        Self {
            id: id.into(),
            kind: RpcMessageKind::Response(response),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcMessageKind {
    #[serde(rename = "request")]
    Request(RpcRequest),
    #[serde(rename = "response")]
    Response(RpcResponse),
}

/// Every remote operation of the registry and of node endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum RpcRequest {
    // Registry: topics and services.
    RegisterPublisher {
        caller_id: GraphName,
        caller_api: SocketAddr,
        topic: GraphName,
        topic_type: String,
    },
    UnregisterPublisher {
        caller_id: GraphName,
        caller_api: SocketAddr,
        topic: GraphName,
    },
    RegisterSubscriber {
        caller_id: GraphName,
        caller_api: SocketAddr,
        topic: GraphName,
        topic_type: String,
    },
    UnregisterSubscriber {
        caller_id: GraphName,
        caller_api: SocketAddr,
        topic: GraphName,
    },
    RegisterService {
        caller_id: GraphName,
        caller_api: SocketAddr,
        service: GraphName,
        service_api: SocketAddr,
    },
    UnregisterService {
        caller_id: GraphName,
        service: GraphName,
        service_api: SocketAddr,
    },
    LookupNode {
        caller_id: GraphName,
        node: GraphName,
    },
    LookupService {
        caller_id: GraphName,
        service: GraphName,
    },
    GetSystemState {
        caller_id: GraphName,
    },
    GetUri {
        caller_id: GraphName,
    },
    GetTopicTypes {
        caller_id: GraphName,
    },
    GetPublishedTopics {
        caller_id: GraphName,
        #[serde(default)]
        subgraph: Option<GraphName>,
    },

    // Registry: parameters.
    SetParam {
        caller_id: GraphName,
        key: GraphName,
        value: serde_json::Value,
    },
    GetParam {
        caller_id: GraphName,
        key: GraphName,
    },
    HasParam {
        caller_id: GraphName,
        key: GraphName,
    },
    DeleteParam {
        caller_id: GraphName,
        key: GraphName,
    },
    SearchParam {
        caller_id: GraphName,
        key: GraphName,
    },
    GetParamNames {
        caller_id: GraphName,
    },
    SubscribeParam {
        caller_id: GraphName,
        caller_api: SocketAddr,
        key: GraphName,
    },
    UnsubscribeParam {
        caller_id: GraphName,
        caller_api: SocketAddr,
        key: GraphName,
    },

    // Node endpoint.
    RequestTopic {
        caller_id: GraphName,
        topic: GraphName,
        protocols: Vec<String>,
    },
    PublisherUpdate {
        caller_id: GraphName,
        topic: GraphName,
        publishers: Vec<SlaveDescription>,
    },
    GetPid {
        caller_id: GraphName,
    },
    GetMasterUri {
        caller_id: GraphName,
    },
    GetPublications {
        caller_id: GraphName,
    },
    GetSubscriptions {
        caller_id: GraphName,
    },
    ParamUpdate {
        caller_id: GraphName,
        key: GraphName,
        value: serde_json::Value,
    },
    Shutdown {
        caller_id: GraphName,
        #[serde(default)]
        reason: String,
    },
}

impl RpcRequest {
    /// The wire name of the method, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::RegisterPublisher { .. } => "registerPublisher",
            RpcRequest::UnregisterPublisher { .. } => "unregisterPublisher",
            RpcRequest::RegisterSubscriber { .. } => "registerSubscriber",
            RpcRequest::UnregisterSubscriber { .. } => "unregisterSubscriber",
            RpcRequest::RegisterService { .. } => "registerService",
            RpcRequest::UnregisterService { .. } => "unregisterService",
            RpcRequest::LookupNode { .. } => "lookupNode",
            RpcRequest::LookupService { .. } => "lookupService",
            RpcRequest::GetSystemState { .. } => "getSystemState",
            RpcRequest::GetUri { .. } => "getUri",
            RpcRequest::GetTopicTypes { .. } => "getTopicTypes",
            RpcRequest::GetPublishedTopics { .. } => "getPublishedTopics",
            RpcRequest::SetParam { .. } => "setParam",
            RpcRequest::GetParam { .. } => "getParam",
            RpcRequest::HasParam { .. } => "hasParam",
            RpcRequest::DeleteParam { .. } => "deleteParam",
            RpcRequest::SearchParam { .. } => "searchParam",
            RpcRequest::GetParamNames { .. } => "getParamNames",
            RpcRequest::SubscribeParam { .. } => "subscribeParam",
            RpcRequest::UnsubscribeParam { .. } => "unsubscribeParam",
            RpcRequest::RequestTopic { .. } => "requestTopic",
            RpcRequest::PublisherUpdate { .. } => "publisherUpdate",
            RpcRequest::GetPid { .. } => "getPid",
            RpcRequest::GetMasterUri { .. } => "getMasterUri",
            RpcRequest::GetPublications { .. } => "getPublications",
            RpcRequest::GetSubscriptions { .. } => "getSubscriptions",
            RpcRequest::ParamUpdate { .. } => "paramUpdate",
            RpcRequest::Shutdown { .. } => "shutdown",
        }
    }

    /// The node that issued the call.
    pub fn caller_id(&self) -> &GraphName {
        match self {
            RpcRequest::RegisterPublisher { caller_id, .. }
            | RpcRequest::UnregisterPublisher { caller_id, .. }
            | RpcRequest::RegisterSubscriber { caller_id, .. }
            | RpcRequest::UnregisterSubscriber { caller_id, .. }
            | RpcRequest::RegisterService { caller_id, .. }
            | RpcRequest::UnregisterService { caller_id, .. }
            | RpcRequest::LookupNode { caller_id, .. }
            | RpcRequest::LookupService { caller_id, .. }
            | RpcRequest::GetSystemState { caller_id }
            | RpcRequest::GetUri { caller_id }
            | RpcRequest::GetTopicTypes { caller_id }
            | RpcRequest::GetPublishedTopics { caller_id, .. }
            | RpcRequest::SetParam { caller_id, .. }
            | RpcRequest::GetParam { caller_id, .. }
            | RpcRequest::HasParam { caller_id, .. }
            | RpcRequest::DeleteParam { caller_id, .. }
            | RpcRequest::SearchParam { caller_id, .. }
            | RpcRequest::GetParamNames { caller_id }
            | RpcRequest::SubscribeParam { caller_id, .. }
            | RpcRequest::UnsubscribeParam { caller_id, .. }
            | RpcRequest::RequestTopic { caller_id, .. }
            | RpcRequest::PublisherUpdate { caller_id, .. }
            | RpcRequest::GetPid { caller_id }
            | RpcRequest::GetMasterUri { caller_id }
            | RpcRequest::GetPublications { caller_id }
            | RpcRequest::GetSubscriptions { caller_id }
            | RpcRequest::ParamUpdate { caller_id, .. }
            | RpcRequest::Shutdown { caller_id, .. } => caller_id,
        }
    }
}

/// Outcome of a call.
pub const CODE_SUCCESS: i32 = 1;
/// The call was understood but could not be carried out.
pub const CODE_FAILURE: i32 = 0;
/// The call itself was invalid.
pub const CODE_ERROR: i32 = -1;

/// Response to an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub code: i32,
    pub status_message: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl RpcResponse {
    /// A successful response carrying `value`.
    pub fn success<T: Serialize>(status: impl Into<String>, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self {
                code: CODE_SUCCESS,
                status_message: status.into(),
                value,
            },
            Err(e) => Self::error(format!("failed to encode result: {e}")),
        }
    }

    pub fn failure(status: impl Into<String>) -> Self {
        Self {
            code: CODE_FAILURE,
            status_message: status.into(),
            value: serde_json::Value::Null,
        }
    }

    pub fn error(status: impl Into<String>) -> Self {
        Self {
            code: CODE_ERROR,
            status_message: status.into(),
            value: serde_json::Value::Null,
        }
    }

    /// Map a library error to a response: malformed input is an error,
    /// anything else a failure.
    pub fn from_error(err: &RosError) -> Self {
        match err {
            RosError::InvalidGraphName(_) | RosError::Json(_) | RosError::UnknownType(_) => {
                Self::error(err.to_string())
            }
            _ => Self::failure(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Decode the value of a successful response; any other code becomes
    /// `RegistryFault`.
    pub fn into_result<T: DeserializeOwned>(self) -> RosResult<T> {
        if !self.is_success() {
            return Err(RosError::RegistryFault {
                code: self.code,
                message: self.status_message,
            });
        }
        Ok(serde_json::from_value(self.value)?)
    }
}

/// Encode a message as length-prefixed JSON.
pub fn encode_message(message: &RpcMessage) -> RosResult<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_RPC_MESSAGE_SIZE)
        .ok_or(RosError::FrameTooLarge {
            size: u32::try_from(body.len()).unwrap_or(u32::MAX),
            max: MAX_RPC_MESSAGE_SIZE,
        })?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode the JSON body of a message whose length prefix was already read.
pub fn decode_message(body: &[u8]) -> RosResult<RpcMessage> {
    Ok(serde_json::from_slice(body)?)
}
