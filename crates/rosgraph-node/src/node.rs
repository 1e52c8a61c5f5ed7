//! The node facade: one process's presence in the graph.

use crate::manager::{LocalPublisher, LocalService, LocalSubscriber, Managers};
use crate::publisher::{Publisher, PublisherInner};
use crate::service::{ServiceClient, ServiceHandler, ServiceServer, ServiceServerInner};
use crate::slave::SlaveHandler;
use crate::subscriber::{Subscriber, SubscriberInner, SubscriberOptions};
use rosgraph_message::{MessageCodec, MessageRegistry};
use rosgraph_types::config::NodeConfig;
use rosgraph_types::identity::{IdSource, SequentialIds};
use rosgraph_types::{GraphName, NameResolver, RosError, RosResult};
use rosgraph_wire::header::TYPE;
use rosgraph_wire::{MasterClient, RpcServer, TcpRosServer};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{info, warn};

struct NodeInner {
    config: NodeConfig,
    resolver: NameResolver,
    messages: Arc<MessageRegistry>,
    managers: Arc<Managers>,
    master: MasterClient,
    tcpros: TcpRosServer,
    rpc: RpcServer,
    tcpros_addr: SocketAddr,
    slave_addr: SocketAddr,
    ids: Arc<dyn IdSource>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<Option<String>>,
}

/// A running node. Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start the node's transport server and RPC endpoint.
    ///
    /// Nothing is registered until the first `advertise`/`subscribe`.
    pub async fn start(config: NodeConfig, messages: Arc<MessageRegistry>) -> RosResult<Self> {
        Self::start_with(config, messages, Arc::new(SequentialIds::new())).await
    }

    pub async fn start_with(
        config: NodeConfig,
        messages: Arc<MessageRegistry>,
        ids: Arc<dyn IdSource>,
    ) -> RosResult<Self> {
        config.validate()?;
        let resolver = NameResolver::new(config.namespace.clone(), &config.name);
        let name = resolver.node_name().clone();
        let managers = Arc::new(Managers::default());

        let tcpros = TcpRosServer::new(
            config.tcpros_bind,
            managers.clone(),
            config.handshake_timeout(),
        );
        let tcpros_addr = tcpros.start().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let slave = Arc::new(SlaveHandler::new(
            Arc::clone(&managers),
            config.master_addr,
            tcpros_addr,
            shutdown_tx.clone(),
        ));
        let rpc = RpcServer::new("slave", config.rpc_bind, slave);
        let slave_addr = match rpc.start().await {
            Ok(addr) => addr,
            Err(e) => {
                let _ = tcpros.shutdown().await;
                return Err(e);
            }
        };

        let master = MasterClient::new(
            config.master_addr,
            name.clone(),
            slave_addr,
            config.rpc_timeout(),
        );
        info!(node = %name, rpc = %slave_addr, tcpros = %tcpros_addr, "Node started");

        let inner = Arc::new(NodeInner {
            config,
            resolver,
            messages,
            managers,
            master,
            tcpros,
            rpc,
            tcpros_addr,
            slave_addr,
            ids,
            running: AtomicBool::new(true),
            shutdown_tx,
        });
        tokio::spawn(watch_shutdown_requests(Arc::downgrade(&inner), shutdown_rx));
        Ok(Self { inner })
    }

    /// Fully resolved node name.
    pub fn name(&self) -> &GraphName {
        self.inner.resolver.node_name()
    }

    /// Resolve `name` against this node's namespace.
    pub fn resolve(&self, name: &str) -> RosResult<GraphName> {
        self.inner.resolver.resolve_str(name)
    }

    pub fn master(&self) -> &MasterClient {
        &self.inner.master
    }

    pub fn messages(&self) -> &Arc<MessageRegistry> {
        &self.inner.messages
    }

    pub fn tcpros_addr(&self) -> SocketAddr {
        self.inner.tcpros_addr
    }

    pub fn slave_addr(&self) -> SocketAddr {
        self.inner.slave_addr
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> RosResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RosError::NotRunning(format!("node {}", self.name())))
        }
    }

    fn subscriber_options(&self) -> SubscriberOptions {
        let config = &self.inner.config;
        SubscriberOptions {
            queue_capacity: config.incoming_queue_capacity,
            listener_capacity: config.listener_queue_capacity,
            handshake_timeout: config.handshake_timeout(),
            rpc_timeout: config.rpc_timeout(),
        }
    }

    /// Publish `topic` with messages of `type_name`.
    ///
    /// Advertising a topic this node already publishes returns a handle to
    /// the existing publisher once its registration finishes; its type must
    /// match.
    pub async fn advertise<M: MessageCodec>(
        &self,
        topic: &str,
        type_name: &str,
        latch: bool,
    ) -> RosResult<Publisher<M>> {
        self.ensure_running()?;
        let topic = self.resolve(topic)?;
        let descriptor = self.inner.messages.get(type_name)?;

        let mut created = false;
        let local = self.inner.managers.topics.publisher_or_insert_with(&topic, || {
            created = true;
            let publisher: Arc<dyn LocalPublisher> = Arc::new(PublisherInner::<M>::new(
                topic.clone(),
                self.name().clone(),
                Arc::clone(&descriptor),
                latch,
                self.inner.config.write_timeout(),
                Arc::clone(&self.inner.ids),
            ));
            publisher
        });
        if local.type_name() != descriptor.name() {
            return Err(RosError::mismatch(TYPE, local.type_name(), descriptor.name()));
        }
        if !created {
            local.registration().wait().await?;
        }
        let inner = Arc::clone(&local).as_any().downcast::<PublisherInner<M>>().map_err(|_| {
            RosError::Config(format!("{topic} is already published with another message representation"))
        })?;

        if created {
            let result = self.inner.master.register_publisher(&topic, type_name).await;
            local.registration().complete(&result);
            if let Err(e) = result {
                if let Some(publisher) = self.inner.managers.topics.remove_publisher(&topic) {
                    publisher.shutdown();
                }
                return Err(e);
            }
            info!(topic = %topic, type_name, latch, "Advertised topic");
        }
        Ok(Publisher::from_inner(inner))
    }

    /// Subscribe to `topic`. Connections to its publishers are made in the
    /// background as the registry reports them.
    pub async fn subscribe<M: MessageCodec>(
        &self,
        topic: &str,
        type_name: &str,
    ) -> RosResult<Subscriber<M>> {
        self.ensure_running()?;
        let topic = self.resolve(topic)?;
        let descriptor = self.inner.messages.get(type_name)?;

        let mut created = false;
        let local = self.inner.managers.topics.subscriber_or_insert_with(&topic, || {
            created = true;
            let subscriber: Arc<dyn LocalSubscriber> = Arc::new(SubscriberInner::<M>::new(
                topic.clone(),
                self.name().clone(),
                Arc::clone(&descriptor),
                self.subscriber_options(),
                Arc::clone(&self.inner.ids),
            ));
            subscriber
        });
        if local.type_name() != descriptor.name() {
            return Err(RosError::mismatch(TYPE, local.type_name(), descriptor.name()));
        }
        if !created {
            local.registration().wait().await?;
        }
        let inner = Arc::clone(&local)
            .as_any()
            .downcast::<SubscriberInner<M>>()
            .map_err(|_| {
                RosError::Config(format!("{topic} is already subscribed with another message representation"))
            })?;

        if created {
            // Registered locally first so a push arriving before the return
            // value finds the subscriber.
            let result = self.inner.master.register_subscriber(&topic, type_name).await;
            local.registration().complete(&result);
            match result {
                Ok(publishers) => {
                    info!(topic = %topic, type_name, publishers = publishers.len(), "Subscribed to topic");
                    local.update_publishers(publishers, false);
                }
                Err(e) => {
                    if let Some(subscriber) = self.inner.managers.topics.remove_subscriber(&topic) {
                        subscriber.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(Subscriber::from_inner(inner))
    }

    /// Provide `service` with requests and responses of the service type
    /// `type_name`.
    pub async fn advertise_service<Req, Res>(
        &self,
        service: &str,
        type_name: &str,
        handler: impl ServiceHandler<Req, Res>,
    ) -> RosResult<ServiceServer<Req, Res>>
    where
        Req: MessageCodec,
        Res: MessageCodec,
    {
        self.ensure_running()?;
        let service = self.resolve(service)?;
        let descriptor = self.inner.messages.service(type_name)?;
        let inner = Arc::new(ServiceServerInner::<Req, Res>::new(
            service.clone(),
            self.name().clone(),
            descriptor,
            handler,
        ));
        let local: Arc<dyn LocalService> = inner.clone();
        if !self.inner.managers.services.insert(local) {
            return Err(RosError::AddressInUse(format!(
                "service {service} is already provided by this node"
            )));
        }
        if let Err(e) = self
            .inner
            .master
            .register_service(&service, self.inner.tcpros_addr)
            .await
        {
            self.inner.managers.services.remove(&service);
            return Err(e);
        }
        info!(service = %service, type_name, "Advertised service");
        Ok(ServiceServer::from_inner(inner))
    }

    /// A client for `service`. A `persistent` client keeps its connection
    /// open between calls.
    pub fn service_client<Req, Res>(
        &self,
        service: &str,
        type_name: &str,
        persistent: bool,
    ) -> RosResult<ServiceClient<Req, Res>>
    where
        Req: MessageCodec,
        Res: MessageCodec,
    {
        self.ensure_running()?;
        let service = self.resolve(service)?;
        let descriptor = self.inner.messages.service(type_name)?;
        Ok(ServiceClient::new(
            service,
            self.name().clone(),
            descriptor,
            self.inner.master.clone(),
            persistent,
            self.inner.config.handshake_timeout(),
        ))
    }

    /// Stop publishing `topic`. Returns false if it was not published.
    pub async fn unadvertise(&self, topic: &str) -> RosResult<bool> {
        let topic = self.resolve(topic)?;
        let Some(publisher) = self.inner.managers.topics.remove_publisher(&topic) else {
            return Ok(false);
        };
        let result = self.inner.master.unregister_publisher(&topic).await;
        publisher.shutdown();
        result.map(|_| true)
    }

    /// Stop subscribing to `topic`. Returns false if it was not subscribed.
    pub async fn unsubscribe(&self, topic: &str) -> RosResult<bool> {
        let topic = self.resolve(topic)?;
        let Some(subscriber) = self.inner.managers.topics.remove_subscriber(&topic) else {
            return Ok(false);
        };
        let result = self.inner.master.unregister_subscriber(&topic).await;
        subscriber.shutdown().await;
        result.map(|_| true)
    }

    /// Stop providing `service`. Returns false if it was not provided.
    pub async fn unadvertise_service(&self, service: &str) -> RosResult<bool> {
        let service = self.resolve(service)?;
        let Some(server) = self.inner.managers.services.remove(&service) else {
            return Ok(false);
        };
        server.shutdown();
        self.inner
            .master
            .unregister_service(&service, self.inner.tcpros_addr)
            .await
            .map(|_| true)
    }

    pub async fn set_param<T: Serialize>(&self, key: &str, value: T) -> RosResult<()> {
        self.inner.master.set_param(&self.resolve(key)?, value).await
    }

    pub async fn get_param(&self, key: &str) -> RosResult<serde_json::Value> {
        self.inner.master.get_param(&self.resolve(key)?).await
    }

    pub async fn has_param(&self, key: &str) -> RosResult<bool> {
        self.inner.master.has_param(&self.resolve(key)?).await
    }

    pub async fn delete_param(&self, key: &str) -> RosResult<()> {
        self.inner.master.delete_param(&self.resolve(key)?).await
    }

    /// Find the closest definition of `key`, searching from this node's
    /// namespace up to the root.
    pub async fn search_param(&self, key: &str) -> RosResult<Option<GraphName>> {
        self.inner.master.search_param(&GraphName::new(key)?).await
    }

    pub async fn param_names(&self) -> RosResult<Vec<GraphName>> {
        self.inner.master.get_param_names().await
    }

    /// Follow `key`: the receiver holds its current value (`null` if unset)
    /// and changes as the registry pushes updates for `key` or anything
    /// below it.
    pub async fn subscribe_param(&self, key: &str) -> RosResult<watch::Receiver<serde_json::Value>> {
        self.ensure_running()?;
        let key = self.resolve(key)?;
        let params = &self.inner.managers.params;
        let rx = params.track(&key);
        match self.inner.master.subscribe_param(&key).await {
            Ok(value) => {
                params.seed(&key, value);
                Ok(rx)
            }
            Err(e) => {
                params.remove(&key);
                Err(e)
            }
        }
    }

    /// Stop following `key`. Returns false if it was not followed.
    pub async fn unsubscribe_param(&self, key: &str) -> RosResult<bool> {
        let key = self.resolve(key)?;
        if !self.inner.managers.params.remove(&key) {
            return Ok(false);
        }
        self.inner.master.unsubscribe_param(&key).await.map(|_| true)
    }

    /// Resolves once the node has been asked to shut down, with the reason.
    pub async fn wait_for_shutdown(&self) -> String {
        let mut rx = self.inner.shutdown_tx.subscribe();
        let reason = rx.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
        reason.unwrap_or_default()
    }

    /// Unregister everything and stop both servers. Registry errors are
    /// logged, not returned; a second call fails with `NotRunning`.
    pub async fn shutdown(&self) -> RosResult<()> {
        self.shutdown_with("node shutdown").await
    }

    async fn shutdown_with(&self, reason: &str) -> RosResult<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Err(RosError::NotRunning(format!("node {}", self.name())));
        }
        let inner = &self.inner;
        info!(node = %self.name(), reason, "Node shutting down");

        for publisher in inner.managers.topics.drain_publishers() {
            if let Err(e) = inner.master.unregister_publisher(publisher.topic()).await {
                warn!(topic = %publisher.topic(), error = %e, "Could not unregister publisher");
            }
            publisher.shutdown();
        }
        for subscriber in inner.managers.topics.drain_subscribers() {
            if let Err(e) = inner.master.unregister_subscriber(subscriber.topic()).await {
                warn!(topic = %subscriber.topic(), error = %e, "Could not unregister subscriber");
            }
            subscriber.shutdown().await;
        }
        for key in inner.managers.params.keys() {
            inner.managers.params.remove(&key);
            if let Err(e) = inner.master.unsubscribe_param(&key).await {
                warn!(key = %key, error = %e, "Could not unsubscribe parameter");
            }
        }
        for server in inner.managers.services.drain() {
            server.shutdown();
            if let Err(e) = inner
                .master
                .unregister_service(server.name(), inner.tcpros_addr)
                .await
            {
                warn!(service = %server.name(), error = %e, "Could not unregister service");
            }
        }

        if let Err(e) = inner.rpc.shutdown().await {
            warn!(error = %e, "RPC endpoint did not stop cleanly");
        }
        if let Err(e) = inner.tcpros.shutdown().await {
            warn!(error = %e, "TCPROS server did not stop cleanly");
        }
        inner.shutdown_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.to_string());
            true
        });
        info!(node = %self.name(), "Node stopped");
        Ok(())
    }
}

/// Shuts the node down when its endpoint receives a `shutdown` call.
async fn watch_shutdown_requests(node: Weak<NodeInner>, mut rx: watch::Receiver<Option<String>>) {
    let reason = match rx.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone().unwrap_or_default(),
        Err(_) => return,
    };
    let Some(inner) = node.upgrade() else {
        return;
    };
    let node = Node { inner };
    if node.is_running() {
        let _ = node.shutdown_with(&reason).await;
    }
}
