//! Per-node bookkeeping of local publishers, subscribers and service
//! servers, and the routing the TCPROS server does through it.

use crate::parameter::ParameterCache;
use async_trait::async_trait;
use dashmap::DashMap;
use rosgraph_types::{GraphName, RosError, RosResult, SlaveDescription, TopicType};
use rosgraph_wire::{ConnectionRouter, ServiceEndpoint, TopicEndpoint};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome of registering a local publisher or subscriber with the
/// registry. Callers that find the endpoint already in place wait on it.
pub struct Registration {
    outcome: watch::Sender<Option<Result<(), String>>>,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            outcome: watch::channel(None).0,
        }
    }
}

impl Registration {
    pub fn complete<T>(&self, result: &RosResult<T>) {
        let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
        self.outcome.send_replace(Some(outcome));
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait for [`Registration::complete`]; a failed registration is
    /// reported as a registry fault.
    pub async fn wait(&self) -> RosResult<()> {
        let mut rx = self.outcome.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|o| o.clone());
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(RosError::RegistryFault { code: 0, message }),
            None => Err(RosError::NotRunning("registration abandoned".into())),
        }
    }
}

/// A topic this node publishes, independent of its message type.
pub trait LocalPublisher: TopicEndpoint {
    fn topic(&self) -> &GraphName;
    fn type_name(&self) -> &str;
    fn registration(&self) -> &Registration;
    fn shutdown(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn as_endpoint(self: Arc<Self>) -> Arc<dyn TopicEndpoint>;
}

/// A topic this node subscribes to, independent of its message type.
#[async_trait]
pub trait LocalSubscriber: Send + Sync {
    fn topic(&self) -> &GraphName;
    fn type_name(&self) -> &str;

    /// Connect to publishers not yet linked. With `prune`, links to
    /// publishers absent from `publishers` are dropped.
    fn update_publishers(&self, publishers: Vec<SlaveDescription>, prune: bool);
    fn registration(&self) -> &Registration;

    async fn shutdown(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A service this node provides, independent of its request/response types.
pub trait LocalService: ServiceEndpoint {
    fn name(&self) -> &GraphName;
    fn type_name(&self) -> &str;
    fn shutdown(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn as_endpoint(self: Arc<Self>) -> Arc<dyn ServiceEndpoint>;
}

/// Local publishers and subscribers by topic name.
#[derive(Default)]
pub struct TopicManager {
    publishers: DashMap<GraphName, Arc<dyn LocalPublisher>>,
    subscribers: DashMap<GraphName, Arc<dyn LocalSubscriber>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self, topic: &GraphName) -> Option<Arc<dyn LocalPublisher>> {
        self.publishers.get(topic).map(|e| Arc::clone(e.value()))
    }

    /// The publisher for `topic`, created with `make` if there is none.
    pub fn publisher_or_insert_with(
        &self,
        topic: &GraphName,
        make: impl FnOnce() -> Arc<dyn LocalPublisher>,
    ) -> Arc<dyn LocalPublisher> {
        Arc::clone(self.publishers.entry(topic.clone()).or_insert_with(make).value())
    }

    pub fn remove_publisher(&self, topic: &GraphName) -> Option<Arc<dyn LocalPublisher>> {
        self.publishers.remove(topic).map(|(_, p)| p)
    }

    pub fn has_publisher(&self, topic: &GraphName) -> bool {
        self.publishers.contains_key(topic)
    }

    pub fn subscriber(&self, topic: &GraphName) -> Option<Arc<dyn LocalSubscriber>> {
        self.subscribers.get(topic).map(|e| Arc::clone(e.value()))
    }

    pub fn subscriber_or_insert_with(
        &self,
        topic: &GraphName,
        make: impl FnOnce() -> Arc<dyn LocalSubscriber>,
    ) -> Arc<dyn LocalSubscriber> {
        Arc::clone(self.subscribers.entry(topic.clone()).or_insert_with(make).value())
    }

    pub fn remove_subscriber(&self, topic: &GraphName) -> Option<Arc<dyn LocalSubscriber>> {
        self.subscribers.remove(topic).map(|(_, s)| s)
    }

    pub fn publications(&self) -> Vec<TopicType> {
        let mut out: Vec<TopicType> = self
            .publishers
            .iter()
            .map(|e| TopicType {
                name: e.key().clone(),
                type_name: e.value().type_name().to_string(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn subscriptions(&self) -> Vec<TopicType> {
        let mut out: Vec<TopicType> = self
            .subscribers
            .iter()
            .map(|e| TopicType {
                name: e.key().clone(),
                type_name: e.value().type_name().to_string(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Remove and return every publisher.
    pub fn drain_publishers(&self) -> Vec<Arc<dyn LocalPublisher>> {
        let names: Vec<GraphName> = self.publishers.iter().map(|e| e.key().clone()).collect();
        names
            .iter()
            .filter_map(|name| self.remove_publisher(name))
            .collect()
    }

    /// Remove and return every subscriber.
    pub fn drain_subscribers(&self) -> Vec<Arc<dyn LocalSubscriber>> {
        let names: Vec<GraphName> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        names
            .iter()
            .filter_map(|name| self.remove_subscriber(name))
            .collect()
    }
}

/// Local service servers by name.
#[derive(Default)]
pub struct ServiceManager {
    servers: DashMap<GraphName, Arc<dyn LocalService>>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &GraphName) -> Option<Arc<dyn LocalService>> {
        self.servers.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Add a server; `false` if one is already registered under `name`.
    pub fn insert(&self, server: Arc<dyn LocalService>) -> bool {
        match self.servers.entry(server.name().clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(server);
                true
            }
        }
    }

    pub fn remove(&self, name: &GraphName) -> Option<Arc<dyn LocalService>> {
        self.servers.remove(name).map(|(_, s)| s)
    }

    pub fn drain(&self) -> Vec<Arc<dyn LocalService>> {
        let names: Vec<GraphName> = self.servers.iter().map(|e| e.key().clone()).collect();
        names.iter().filter_map(|name| self.remove(name)).collect()
    }
}

/// Everything the node's servers route to.
#[derive(Default)]
pub struct Managers {
    pub topics: TopicManager,
    pub services: ServiceManager,
    pub params: ParameterCache,
}

impl ConnectionRouter for Managers {
    fn topic(&self, name: &GraphName) -> Option<Arc<dyn TopicEndpoint>> {
        self.topics.publisher(name).map(|p| p.as_endpoint())
    }

    fn service(&self, name: &GraphName) -> Option<Arc<dyn ServiceEndpoint>> {
        self.services.get(name).map(|s| s.as_endpoint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_see_registration_outcome() {
        let registration = Arc::new(Registration::default());
        assert!(!registration.is_complete());

        let waiter = {
            let registration = Arc::clone(&registration);
            tokio::spawn(async move { registration.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registration.complete::<()>(&Err(RosError::Timeout {
            operation: "registerPublisher".into(),
            timeout_ms: 10,
        }));
        match waiter.await.unwrap() {
            Err(RosError::RegistryFault { message, .. }) => {
                assert!(message.contains("registerPublisher"))
            }
            other => panic!("expected registry fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completed_registration_returns_at_once() {
        let registration = Registration::default();
        registration.complete(&Ok::<_, RosError>(()));
        assert!(registration.is_complete());
        tokio_test::assert_ok!(registration.wait().await);
    }
}
