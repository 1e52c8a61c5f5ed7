//! Topic, service and node bookkeeping for the registry.
//!
//! Every topic and service name maps to a record behind its own lock.
//! Records are created on first registration and removed once empty; a
//! removed record is marked retired so a caller that fetched it just before
//! removal retries against a fresh one instead of updating a dead entry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rosgraph_types::identity::Clock;
use rosgraph_types::{
    GraphEntry, GraphName, RosError, RosResult, SlaveDescription, SystemState, TopicType,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outbound calls the registry makes to node endpoints.
///
/// Implementations must not block; calls are made while a record lock is
/// held, so their order matches the order of the state changes.
pub trait SlaveNotifier: Send + Sync {
    /// `topic`'s publisher set changed; tell every subscriber.
    fn publisher_update(
        &self,
        topic: &GraphName,
        subscribers: Vec<SlaveDescription>,
        publishers: Vec<SlaveDescription>,
    );

    /// Ask a replaced node to exit.
    fn shutdown_node(&self, node: &SlaveDescription, reason: &str);

    /// A subscribed parameter changed; `null` means it is no longer set.
    fn param_update(&self, subscriber: &SlaveDescription, key: &GraphName, value: &serde_json::Value);
}

#[derive(Debug, Clone)]
struct NodeRecord {
    address: SocketAddr,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TopicRecord {
    type_name: Option<String>,
    publishers: Vec<SlaveDescription>,
    subscribers: Vec<SlaveDescription>,
    retired: bool,
}

impl TopicRecord {
    fn is_empty(&self) -> bool {
        self.publishers.is_empty() && self.subscribers.is_empty()
    }
}

#[derive(Debug, Default)]
struct ServiceRecord {
    provider: Option<(SlaveDescription, SocketAddr)>,
    retired: bool,
}

trait Retirable: Default {
    fn retired(&self) -> bool;
    fn retire(&mut self);
    fn is_unused(&self) -> bool;
}

impl Retirable for TopicRecord {
    fn retired(&self) -> bool {
        self.retired
    }
    fn retire(&mut self) {
        self.retired = true;
    }
    fn is_unused(&self) -> bool {
        self.is_empty()
    }
}

impl Retirable for ServiceRecord {
    fn retired(&self) -> bool {
        self.retired
    }
    fn retire(&mut self) {
        self.retired = true;
    }
    fn is_unused(&self) -> bool {
        self.provider.is_none()
    }
}

type Records<R> = DashMap<GraphName, Arc<Mutex<R>>>;

/// Run `f` on the record for `name` under its lock.
///
/// With `create` a missing record is made; without it `None` is returned.
/// A record left unused by `f` is retired and removed.
fn with_record<R: Retirable, T>(
    records: &Records<R>,
    name: &GraphName,
    create: bool,
    f: impl FnOnce(&mut R) -> T,
) -> Option<T> {
    loop {
        let record = if create {
            Arc::clone(
                records
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(R::default())))
                    .value(),
            )
        } else {
            Arc::clone(records.get(name)?.value())
        };
        let mut guard = record.lock().unwrap_or_else(|e| e.into_inner());
        if guard.retired() {
            continue;
        }
        let out = f(&mut *guard);
        if guard.is_unused() {
            guard.retire();
            records.remove_if(name, |_, current| Arc::ptr_eq(current, &record));
        }
        return Some(out);
    }
}

fn snapshot<R>(records: &Records<R>) -> Vec<(GraphName, Arc<Mutex<R>>)> {
    let mut all: Vec<_> = records
        .iter()
        .map(|e| (e.key().clone(), Arc::clone(e.value())))
        .collect();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    all
}

fn names(slaves: &[SlaveDescription]) -> Vec<GraphName> {
    slaves.iter().map(|s| s.name.clone()).collect()
}

/// Insert `slave`, replacing an entry of the same name. Returns whether the
/// set changed.
fn upsert(slaves: &mut Vec<SlaveDescription>, slave: SlaveDescription) -> bool {
    match slaves.iter_mut().find(|s| s.name == slave.name) {
        Some(existing) if *existing == slave => false,
        Some(existing) => {
            *existing = slave;
            true
        }
        None => {
            slaves.push(slave);
            true
        }
    }
}

fn remove(slaves: &mut Vec<SlaveDescription>, slave: &SlaveDescription) -> u32 {
    let before = slaves.len();
    slaves.retain(|s| s != slave);
    (before - slaves.len()) as u32
}

/// The graph registry.
pub struct Registry {
    nodes: DashMap<GraphName, NodeRecord>,
    topics: Records<TopicRecord>,
    services: Records<ServiceRecord>,
    notifier: Arc<dyn SlaveNotifier>,
    clock: Arc<dyn Clock>,
}

impl Registry {
    pub fn new(notifier: Arc<dyn SlaveNotifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            nodes: DashMap::new(),
            topics: DashMap::new(),
            services: DashMap::new(),
            notifier,
            clock,
        }
    }

    /// Record the caller's endpoint. A node re-registering from a new
    /// address replaces the old one: the old endpoint is asked to shut down
    /// and its registrations are dropped.
    fn register_node(&self, caller: &SlaveDescription) {
        let now = self.clock.now();
        let previous = {
            let mut entry = self
                .nodes
                .entry(caller.name.clone())
                .or_insert_with(|| NodeRecord {
                    address: caller.address,
                    registered_at: now,
                });
            if entry.address == caller.address {
                return;
            }
            let previous = entry.clone();
            *entry = NodeRecord {
                address: caller.address,
                registered_at: now,
            };
            previous
        };

        let old = SlaveDescription::new(caller.name.clone(), previous.address);
        warn!(
            node = %caller.name,
            old = %previous.address,
            new = %caller.address,
            registered_at = %previous.registered_at,
            "Node replaced by a new registration"
        );
        self.notifier
            .shutdown_node(&old, &format!("new node registered with same name at {}", caller.address));
        self.purge(&old);
    }

    fn purge(&self, node: &SlaveDescription) {
        for (topic, _) in snapshot(&self.topics) {
            with_record(&self.topics, &topic, false, |record| {
                let dropped_pub = remove(&mut record.publishers, node);
                remove(&mut record.subscribers, node);
                if dropped_pub > 0 {
                    self.notifier.publisher_update(
                        &topic,
                        record.subscribers.clone(),
                        record.publishers.clone(),
                    );
                }
            });
        }
        for (service, _) in snapshot(&self.services) {
            with_record(&self.services, &service, false, |record| {
                if matches!(&record.provider, Some((provider, _)) if provider == node) {
                    record.provider = None;
                }
            });
        }
    }

    /// Returns the topic's current subscribers.
    pub fn register_publisher(
        &self,
        caller: SlaveDescription,
        topic: &GraphName,
        topic_type: &str,
    ) -> Vec<SlaveDescription> {
        self.register_node(&caller);
        let subscribers = with_record(&self.topics, topic, true, |record| {
            record.type_name = Some(topic_type.to_string());
            if upsert(&mut record.publishers, caller.clone()) {
                self.notifier.publisher_update(
                    topic,
                    record.subscribers.clone(),
                    record.publishers.clone(),
                );
            }
            record.subscribers.clone()
        })
        .unwrap_or_default();
        info!(topic = %topic, node = %caller.name, topic_type, "Publisher registered");
        subscribers
    }

    /// Returns how many registrations were removed.
    pub fn unregister_publisher(&self, caller: &SlaveDescription, topic: &GraphName) -> u32 {
        let removed = with_record(&self.topics, topic, false, |record| {
            let removed = remove(&mut record.publishers, caller);
            if removed > 0 {
                self.notifier.publisher_update(
                    topic,
                    record.subscribers.clone(),
                    record.publishers.clone(),
                );
            }
            removed
        })
        .unwrap_or(0);
        debug!(topic = %topic, node = %caller.name, removed, "Publisher unregistered");
        removed
    }

    /// Returns the topic's current publishers.
    pub fn register_subscriber(
        &self,
        caller: SlaveDescription,
        topic: &GraphName,
        topic_type: &str,
    ) -> Vec<SlaveDescription> {
        self.register_node(&caller);
        let publishers = with_record(&self.topics, topic, true, |record| {
            if record.type_name.is_none() {
                record.type_name = Some(topic_type.to_string());
            }
            upsert(&mut record.subscribers, caller.clone());
            record.publishers.clone()
        })
        .unwrap_or_default();
        info!(topic = %topic, node = %caller.name, topic_type, "Subscriber registered");
        publishers
    }

    pub fn unregister_subscriber(&self, caller: &SlaveDescription, topic: &GraphName) -> u32 {
        let removed = with_record(&self.topics, topic, false, |record| {
            remove(&mut record.subscribers, caller)
        })
        .unwrap_or(0);
        debug!(topic = %topic, node = %caller.name, removed, "Subscriber unregistered");
        removed
    }

    /// Last registration wins.
    pub fn register_service(
        &self,
        caller: SlaveDescription,
        service: &GraphName,
        service_api: SocketAddr,
    ) {
        self.register_node(&caller);
        with_record(&self.services, service, true, |record| {
            if let Some((previous, _)) = &record.provider {
                if previous.name != caller.name {
                    debug!(service = %service, previous = %previous.name, "Service provider replaced");
                }
            }
            record.provider = Some((caller.clone(), service_api));
        });
        info!(service = %service, node = %caller.name, addr = %service_api, "Service registered");
    }

    /// Removes the registration only if `service_api` is still the one on
    /// record.
    pub fn unregister_service(
        &self,
        caller: &GraphName,
        service: &GraphName,
        service_api: SocketAddr,
    ) -> u32 {
        with_record(&self.services, service, false, |record| {
            match &record.provider {
                Some((provider, api)) if &provider.name == caller && *api == service_api => {
                    record.provider = None;
                    1
                }
                _ => 0,
            }
        })
        .unwrap_or(0)
    }

    /// RPC address of a registered node.
    pub fn lookup_node(&self, node: &GraphName) -> RosResult<SocketAddr> {
        self.nodes
            .get(node)
            .map(|record| record.address)
            .ok_or_else(|| RosError::NotRunning(format!("unknown node {node}")))
    }

    /// TCPROS address of a service's provider.
    pub fn lookup_service(&self, service: &GraphName) -> RosResult<SocketAddr> {
        with_record(&self.services, service, false, |record| {
            record.provider.as_ref().map(|(_, api)| *api)
        })
        .flatten()
        .ok_or_else(|| RosError::NotRunning(format!("no provider for service {service}")))
    }

    pub fn system_state(&self) -> SystemState {
        let mut state = SystemState::default();
        for (name, record) in snapshot(&self.topics) {
            let record = record.lock().unwrap_or_else(|e| e.into_inner());
            if record.retired {
                continue;
            }
            if !record.publishers.is_empty() {
                state.publishers.push(GraphEntry {
                    name: name.clone(),
                    nodes: names(&record.publishers),
                });
            }
            if !record.subscribers.is_empty() {
                state.subscribers.push(GraphEntry {
                    name,
                    nodes: names(&record.subscribers),
                });
            }
        }
        for (name, record) in snapshot(&self.services) {
            let record = record.lock().unwrap_or_else(|e| e.into_inner());
            if let (false, Some((provider, _))) = (record.retired, &record.provider) {
                state.services.push(GraphEntry {
                    name,
                    nodes: vec![provider.name.clone()],
                });
            }
        }
        state
    }

    /// Every known topic and its type.
    pub fn topic_types(&self) -> Vec<TopicType> {
        self.collect_topics(|_| true)
    }

    /// Topics with at least one publisher, under `subgraph` if given.
    pub fn published_topics(&self, subgraph: Option<&GraphName>) -> Vec<TopicType> {
        self.collect_topics(|record| !record.publishers.is_empty())
            .into_iter()
            .filter(|t| subgraph.map_or(true, |ns| t.name.is_within(&ns.to_global())))
            .collect()
    }

    fn collect_topics(&self, keep: impl Fn(&TopicRecord) -> bool) -> Vec<TopicType> {
        snapshot(&self.topics)
            .into_iter()
            .filter_map(|(name, record)| {
                let record = record.lock().unwrap_or_else(|e| e.into_inner());
                if record.retired || !keep(&record) {
                    return None;
                }
                record.type_name.clone().map(|type_name| TopicType { name, type_name })
            })
            .collect()
    }
}
