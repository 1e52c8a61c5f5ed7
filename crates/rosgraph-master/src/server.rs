//! The registry's RPC endpoint.

use crate::parameter::ParameterTree;
use crate::registry::{Registry, SlaveNotifier};
use async_trait::async_trait;
use futures::future::join_all;
use rosgraph_types::config::MasterConfig;
use rosgraph_types::identity::{Clock, SystemClock};
use rosgraph_types::{GraphName, NameResolver, RosResult, SlaveDescription};
use rosgraph_wire::rpc::{RpcHandler, RpcRequest, RpcResponse, RpcServer, SlaveClient};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Caller id the registry uses for its own outbound calls.
pub const MASTER_CALLER_ID: &str = "/master";

enum Notice {
    PublisherUpdate {
        topic: GraphName,
        subscribers: Vec<SlaveDescription>,
        publishers: Vec<SlaveDescription>,
    },
    Shutdown {
        node: SlaveDescription,
        reason: String,
    },
    ParamUpdate {
        subscriber: SlaveDescription,
        key: GraphName,
        value: serde_json::Value,
    },
}

/// Delivers registry notifications over RPC from one background task, in
/// the order they were raised.
struct RpcNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl RpcNotifier {
    fn spawn(caller_id: GraphName, timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                match notice {
                    Notice::PublisherUpdate {
                        topic,
                        subscribers,
                        publishers,
                    } => {
                        let calls = subscribers.iter().map(|subscriber| {
                            let client =
                                SlaveClient::new(subscriber.address, caller_id.clone(), timeout);
                            let topic = &topic;
                            let publishers = publishers.clone();
                            async move {
                                if let Err(e) = client.publisher_update(topic, publishers).await {
                                    warn!(topic = %topic, subscriber = %subscriber, error = %e, "publisherUpdate failed");
                                }
                            }
                        });
                        join_all(calls).await;
                    }
                    Notice::ParamUpdate {
                        subscriber,
                        key,
                        value,
                    } => {
                        let client = SlaveClient::new(subscriber.address, caller_id.clone(), timeout);
                        if let Err(e) = client.param_update(&key, value).await {
                            warn!(key = %key, subscriber = %subscriber, error = %e, "paramUpdate failed");
                        }
                    }
                    Notice::Shutdown { node, reason } => {
                        let client = SlaveClient::new(node.address, caller_id.clone(), timeout);
                        tokio::spawn(async move {
                            if let Err(e) = client.shutdown(&reason).await {
                                debug!(node = %node, error = %e, "Shutdown request not delivered");
                            }
                        });
                    }
                }
            }
        });
        Self { tx }
    }
}

impl SlaveNotifier for RpcNotifier {
    fn publisher_update(
        &self,
        topic: &GraphName,
        subscribers: Vec<SlaveDescription>,
        publishers: Vec<SlaveDescription>,
    ) {
        if subscribers.is_empty() {
            return;
        }
        let _ = self.tx.send(Notice::PublisherUpdate {
            topic: topic.clone(),
            subscribers,
            publishers,
        });
    }

    fn shutdown_node(&self, node: &SlaveDescription, reason: &str) {
        let _ = self.tx.send(Notice::Shutdown {
            node: node.clone(),
            reason: reason.to_string(),
        });
    }

    fn param_update(&self, subscriber: &SlaveDescription, key: &GraphName, value: &serde_json::Value) {
        let _ = self.tx.send(Notice::ParamUpdate {
            subscriber: subscriber.clone(),
            key: key.clone(),
            value: value.clone(),
        });
    }
}

struct MasterState {
    registry: Registry,
    params: ParameterTree,
    uri: OnceLock<SocketAddr>,
}

fn caller(caller_id: GraphName, caller_api: SocketAddr) -> SlaveDescription {
    SlaveDescription::new(caller_id, caller_api)
}

/// Resolve a parameter key the way the calling node would.
fn resolve_key(caller_id: &GraphName, key: &GraphName) -> GraphName {
    let namespace = caller_id.parent().unwrap_or_else(GraphName::root);
    NameResolver::new(namespace, caller_id).resolve(key)
}

fn respond<T: serde::Serialize>(result: RosResult<T>, status: &str) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::success(status, value),
        Err(e) => RpcResponse::from_error(&e),
    }
}

#[async_trait]
impl RpcHandler for MasterState {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::RegisterPublisher {
                caller_id,
                caller_api,
                topic,
                topic_type,
            } => {
                let subscribers = self.registry.register_publisher(
                    caller(caller_id, caller_api),
                    &topic.to_global(),
                    &topic_type,
                );
                RpcResponse::success(format!("Registered as publisher of {topic}"), subscribers)
            }
            RpcRequest::UnregisterPublisher {
                caller_id,
                caller_api,
                topic,
            } => {
                let removed = self
                    .registry
                    .unregister_publisher(&caller(caller_id, caller_api), &topic.to_global());
                RpcResponse::success(format!("Unregistered {removed} publisher(s)"), removed)
            }
            RpcRequest::RegisterSubscriber {
                caller_id,
                caller_api,
                topic,
                topic_type,
            } => {
                let publishers = self.registry.register_subscriber(
                    caller(caller_id, caller_api),
                    &topic.to_global(),
                    &topic_type,
                );
                RpcResponse::success(format!("Subscribed to {topic}"), publishers)
            }
            RpcRequest::UnregisterSubscriber {
                caller_id,
                caller_api,
                topic,
            } => {
                let removed = self
                    .registry
                    .unregister_subscriber(&caller(caller_id, caller_api), &topic.to_global());
                RpcResponse::success(format!("Unregistered {removed} subscriber(s)"), removed)
            }
            RpcRequest::RegisterService {
                caller_id,
                caller_api,
                service,
                service_api,
            } => {
                self.registry.register_service(
                    caller(caller_id, caller_api),
                    &service.to_global(),
                    service_api,
                );
                RpcResponse::success(format!("Registered provider of {service}"), ())
            }
            RpcRequest::UnregisterService {
                caller_id,
                service,
                service_api,
            } => {
                let removed =
                    self.registry
                        .unregister_service(&caller_id, &service.to_global(), service_api);
                RpcResponse::success(format!("Unregistered {removed} service(s)"), removed)
            }
            RpcRequest::LookupNode { node, .. } => {
                respond(self.registry.lookup_node(&node.to_global()), "node api")
            }
            RpcRequest::LookupService { service, .. } => {
                respond(self.registry.lookup_service(&service.to_global()), "service api")
            }
            RpcRequest::GetSystemState { .. } => {
                RpcResponse::success("current system state", self.registry.system_state())
            }
            RpcRequest::GetUri { .. } => match self.uri.get() {
                Some(uri) => RpcResponse::success("", uri),
                None => RpcResponse::failure("registry address not yet known"),
            },
            RpcRequest::GetTopicTypes { .. } => {
                RpcResponse::success("current topic types", self.registry.topic_types())
            }
            RpcRequest::GetPublishedTopics { subgraph, .. } => RpcResponse::success(
                "current topics",
                self.registry.published_topics(subgraph.as_ref()),
            ),
            RpcRequest::SetParam {
                caller_id,
                key,
                value,
            } => {
                let key = resolve_key(&caller_id, &key);
                respond(self.params.set(&key, value), &format!("parameter {key} set"))
            }
            RpcRequest::GetParam { caller_id, key } => {
                let key = resolve_key(&caller_id, &key);
                match self.params.get(&key) {
                    Some(value) => RpcResponse::success(format!("parameter {key}"), value),
                    None => RpcResponse::error(format!("parameter {key} is not set")),
                }
            }
            RpcRequest::HasParam { caller_id, key } => {
                let key = resolve_key(&caller_id, &key);
                RpcResponse::success(key.to_string(), self.params.has(&key))
            }
            RpcRequest::DeleteParam { caller_id, key } => {
                let key = resolve_key(&caller_id, &key);
                match self.params.delete(&key) {
                    Ok(()) => RpcResponse::success(format!("parameter {key} deleted"), ()),
                    Err(e) => RpcResponse::error(e.to_string()),
                }
            }
            RpcRequest::SearchParam { caller_id, key } => {
                let namespace = caller_id.parent().unwrap_or_else(GraphName::root);
                let found = if key.is_private() {
                    let key = resolve_key(&caller_id, &key);
                    self.params.has(&key).then_some(key)
                } else {
                    self.params.search(&namespace, &key)
                };
                RpcResponse::success("search result", found)
            }
            RpcRequest::GetParamNames { .. } => {
                RpcResponse::success("parameter names", self.params.names())
            }
            RpcRequest::SubscribeParam {
                caller_id,
                caller_api,
                key,
            } => {
                let key = resolve_key(&caller_id, &key);
                let value = self.params.subscribe(&key, caller(caller_id, caller_api));
                RpcResponse::success(format!("subscribed to {key}"), value)
            }
            RpcRequest::UnsubscribeParam {
                caller_id,
                caller_api,
                key,
            } => {
                let key = resolve_key(&caller_id, &key);
                let removed = self
                    .params
                    .unsubscribe(&key, &caller(caller_id, caller_api));
                RpcResponse::success(format!("Unsubscribed {removed} from {key}"), removed)
            }
            other => RpcResponse::error(format!("{} is not a registry method", other.method())),
        }
    }
}

/// A running registry: graph bookkeeping plus the parameter tree, served
/// over RPC.
pub struct MasterServer {
    state: Arc<MasterState>,
    rpc: RpcServer,
    addr: SocketAddr,
}

impl MasterServer {
    /// Bind and start serving.
    pub async fn start(config: MasterConfig) -> RosResult<Self> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(config: MasterConfig, clock: Arc<dyn Clock>) -> RosResult<Self> {
        let caller_id = GraphName::new(MASTER_CALLER_ID)?;
        let notifier = Arc::new(RpcNotifier::spawn(caller_id, config.rpc_timeout()));
        let state = Arc::new(MasterState {
            registry: Registry::new(notifier.clone(), clock),
            params: ParameterTree::with_notifier(notifier),
            uri: OnceLock::new(),
        });
        let rpc = RpcServer::new("master", config.bind_addr, state.clone());
        let addr = rpc.start().await?;
        let _ = state.uri.set(addr);
        info!(addr = %addr, "Registry started");
        Ok(Self { state, rpc, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    pub fn params(&self) -> &ParameterTree {
        &self.state.params
    }

    pub async fn shutdown(&self) -> RosResult<()> {
        self.rpc.shutdown().await?;
        info!(addr = %self.addr, "Registry stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosgraph_types::RosError;
    use rosgraph_wire::rpc::{MasterClient, RpcClient};
    use serde_json::json;

    fn gn(s: &str) -> GraphName {
        GraphName::new(s).unwrap()
    }

    async fn master() -> MasterServer {
        MasterServer::start(MasterConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            rpc_timeout_ms: 500,
        })
        .await
        .unwrap()
    }

    fn client(master: &MasterServer, name: &str, port: u16) -> MasterClient {
        MasterClient::new(
            master.addr(),
            gn(name),
            SocketAddr::from(([127, 0, 0, 1], port)),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_registration_over_rpc() {
        let master = master().await;
        let talker = client(&master, "/talker", 4001);
        let listener = client(&master, "/listener", 4002);
        let topic = gn("/chatter");

        assert!(talker.register_publisher(&topic, "std_msgs/String").await.unwrap().is_empty());
        let pubs = listener.register_subscriber(&topic, "std_msgs/String").await.unwrap();
        assert_eq!(pubs.len(), 1);
        assert_eq!(pubs[0].name, gn("/talker"));

        let state = listener.get_system_state().await.unwrap();
        assert_eq!(state.subscribers_of(&topic), vec![gn("/listener")]);
        assert_eq!(talker.get_uri().await.unwrap(), master.addr());
        assert_eq!(
            listener.lookup_node(&gn("/talker")).await.unwrap().port(),
            4001
        );
        assert!(matches!(
            listener.lookup_node(&gn("/ghost")).await,
            Err(RosError::RegistryFault { code: 0, .. })
        ));
        master.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_lookup() {
        let master = master().await;
        let server = client(&master, "/adder", 4003);
        let service = gn("/add_two_ints");
        let api: SocketAddr = "127.0.0.1:5003".parse().unwrap();
        tokio_test::assert_ok!(server.register_service(&service, api).await);
        assert_eq!(server.lookup_service(&service).await.unwrap(), api);

        // Only the registered provider address may unregister.
        let other: SocketAddr = "127.0.0.1:5999".parse().unwrap();
        assert_eq!(server.unregister_service(&service, other).await.unwrap(), 0);
        assert_eq!(server.unregister_service(&service, api).await.unwrap(), 1);
        tokio_test::assert_err!(server.lookup_service(&service).await);
    }

    #[tokio::test]
    async fn test_parameters_resolve_against_caller() {
        let master = master().await;
        let node = client(&master, "/robot/driver", 4004);

        node.set_param(&gn("speed"), 1.5).await.unwrap();
        node.set_param(&gn("~gain"), 3).await.unwrap();
        assert_eq!(node.get_param(&gn("/robot/speed")).await.unwrap(), json!(1.5));
        assert_eq!(
            node.get_param(&gn("/robot")).await.unwrap(),
            json!({"speed": 1.5, "driver": {"gain": 3}})
        );
        assert!(node.has_param(&gn("~gain")).await.unwrap());
        assert_eq!(
            node.search_param(&gn("speed")).await.unwrap(),
            Some(gn("/robot/speed"))
        );
        assert_eq!(
            node.get_param_names().await.unwrap(),
            vec![gn("/robot/driver/gain"), gn("/robot/speed")]
        );

        node.delete_param(&gn("speed")).await.unwrap();
        assert!(node.get_param(&gn("speed")).await.is_err());
        assert!(node.delete_param(&gn("speed")).await.is_err());
    }

    /// Stands in for a node endpoint and forwards every `paramUpdate`.
    struct ParamSink(mpsc::UnboundedSender<(GraphName, serde_json::Value)>);

    #[async_trait]
    impl RpcHandler for ParamSink {
        async fn handle(&self, request: RpcRequest) -> RpcResponse {
            match request {
                RpcRequest::ParamUpdate { key, value, .. } => {
                    let _ = self.0.send((key, value));
                    RpcResponse::success("", ())
                }
                other => RpcResponse::error(other.method()),
            }
        }
    }

    #[tokio::test]
    async fn test_param_subscription_pushes_updates() {
        let master = master().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = RpcServer::new("sink", "127.0.0.1:0".parse().unwrap(), Arc::new(ParamSink(tx)));
        let sink_addr = sink.start().await.unwrap();
        let watcher = MasterClient::new(master.addr(), gn("/robot/watcher"), sink_addr, Duration::from_secs(1));
        let writer = client(&master, "/writer", 4005);

        // Resolved against the caller: `gains` is /robot/gains.
        assert_eq!(
            watcher.subscribe_param(&gn("gains")).await.unwrap(),
            serde_json::Value::Null
        );
        writer.set_param(&gn("/robot/gains/p"), 0.5).await.unwrap();
        let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(pushed, Some((gn("/robot/gains/p"), json!(0.5))));

        writer.delete_param(&gn("/robot/gains")).await.unwrap();
        let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(pushed, Some((gn("/robot/gains"), serde_json::Value::Null)));

        assert_eq!(watcher.unsubscribe_param(&gn("gains")).await.unwrap(), 1);
        writer.set_param(&gn("/robot/gains/p"), 1.0).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err());
        sink.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_slave_methods_rejected() {
        let master = master().await;
        let rpc = RpcClient::new(master.addr(), Duration::from_secs(1));
        let response = rpc
            .call(RpcRequest::GetPid {
                caller_id: gn("/x"),
            })
            .await
            .unwrap();
        assert_eq!(response.code, -1);
    }
}
