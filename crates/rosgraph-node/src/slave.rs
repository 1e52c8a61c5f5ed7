//! The node's RPC endpoint, answering the registry and other nodes.

use crate::manager::Managers;
use async_trait::async_trait;
use rosgraph_types::{ProtocolDescription, TCPROS};
use rosgraph_wire::rpc::{RpcHandler, RpcRequest, RpcResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

pub(crate) struct SlaveHandler {
    managers: Arc<Managers>,
    master_addr: SocketAddr,
    tcpros_addr: SocketAddr,
    shutdown: watch::Sender<Option<String>>,
}

impl SlaveHandler {
    pub(crate) fn new(
        managers: Arc<Managers>,
        master_addr: SocketAddr,
        tcpros_addr: SocketAddr,
        shutdown: watch::Sender<Option<String>>,
    ) -> Self {
        Self {
            managers,
            master_addr,
            tcpros_addr,
            shutdown,
        }
    }
}

#[async_trait]
impl RpcHandler for SlaveHandler {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::RequestTopic {
                caller_id,
                topic,
                protocols,
            } => {
                let topic = topic.to_global();
                if !self.managers.topics.has_publisher(&topic) {
                    return RpcResponse::failure(format!("not a publisher of {topic}"));
                }
                if !protocols.iter().any(|p| p == TCPROS) {
                    return RpcResponse::failure(format!(
                        "no supported protocol in {protocols:?}"
                    ));
                }
                debug!(topic = %topic, caller = %caller_id, "Topic requested");
                RpcResponse::success(
                    format!("ready on {}", self.tcpros_addr),
                    ProtocolDescription::tcpros(self.tcpros_addr),
                )
            }
            RpcRequest::PublisherUpdate {
                topic, publishers, ..
            } => {
                let topic = topic.to_global();
                match self.managers.topics.subscriber(&topic) {
                    Some(subscriber) => {
                        debug!(topic = %topic, count = publishers.len(), "Publisher update");
                        subscriber.update_publishers(publishers, true);
                        RpcResponse::success("publishers updated", ())
                    }
                    None => RpcResponse::failure(format!("not subscribed to {topic}")),
                }
            }
            RpcRequest::GetPid { .. } => RpcResponse::success("pid", std::process::id()),
            RpcRequest::GetMasterUri { .. } => {
                RpcResponse::success("master uri", self.master_addr)
            }
            RpcRequest::GetPublications { .. } => {
                RpcResponse::success("publications", self.managers.topics.publications())
            }
            RpcRequest::GetSubscriptions { .. } => {
                RpcResponse::success("subscriptions", self.managers.topics.subscriptions())
            }
            RpcRequest::ParamUpdate { key, value, .. } => {
                let key = key.to_global();
                if self.managers.params.update(&key, value) {
                    RpcResponse::success("parameter updated", ())
                } else {
                    RpcResponse::failure(format!("not subscribed to {key}"))
                }
            }
            RpcRequest::Shutdown { caller_id, reason } => {
                info!(caller = %caller_id, reason = %reason, "Shutdown requested");
                self.shutdown.send_if_modified(|slot| {
                    if slot.is_some() {
                        return false;
                    }
                    *slot = Some(reason);
                    true
                });
                RpcResponse::success("shutting down", ())
            }
            other => RpcResponse::error(format!("{} is not a node method", other.method())),
        }
    }
}
