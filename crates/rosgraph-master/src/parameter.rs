//! Hierarchical parameter store.
//!
//! Keys are global graph names; every namespace on the way to a key is a
//! JSON object. Setting `/a/b` turns `/a` into a namespace, replacing any
//! plain value stored there.
//!
//! Nodes may subscribe to a key. A change at or below a subscribed key is
//! pushed as the changed key and its new value; a change above it (setting
//! or deleting a whole namespace) is pushed as the subscribed key and its
//! resulting value. `null` stands for "not set".

use crate::registry::SlaveNotifier;
use rosgraph_types::{GraphName, RosError, RosResult, SlaveDescription};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

#[derive(Default)]
pub struct ParameterTree {
    root: RwLock<Map<String, Value>>,
    subscribers: Mutex<BTreeMap<GraphName, Vec<SlaveDescription>>>,
    notifier: Option<Arc<dyn SlaveNotifier>>,
}

fn segments(key: &GraphName) -> Vec<&str> {
    key.segments().collect()
}

fn lookup(root: &Map<String, Value>, key: &GraphName) -> Option<Value> {
    let path = segments(key);
    let Some((last, parents)) = path.split_last() else {
        return Some(Value::Object(root.clone()));
    };
    let mut node = root;
    for segment in parents {
        node = node.get(*segment)?.as_object()?;
    }
    node.get(*last).cloned()
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tree that pushes changes to subscribers through `notifier`.
    pub fn with_notifier(notifier: Arc<dyn SlaveNotifier>) -> Self {
        Self {
            notifier: Some(notifier),
            ..Self::default()
        }
    }

    /// Store `value` at `key`. Setting the root requires an object and
    /// replaces the whole tree.
    pub fn set(&self, key: &GraphName, value: Value) -> RosResult<()> {
        let path = segments(key);
        let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
        let Some((last, parents)) = path.split_last() else {
            return match value {
                Value::Object(map) => {
                    *root = map;
                    self.notify(&root, key);
                    Ok(())
                }
                _ => Err(RosError::Config(
                    "the root parameter namespace only accepts a dictionary".into(),
                )),
            };
        };
        let mut node = &mut *root;
        for segment in parents {
            let child = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            let Value::Object(map) = child else {
                return Err(RosError::Config(format!("parameter namespace {segment} is not a dictionary")));
            };
            node = map;
        }
        node.insert(last.to_string(), value);
        debug!(key = %key, "Parameter set");
        self.notify(&root, key);
        Ok(())
    }

    /// The value at `key`; a namespace yields its whole sub-tree.
    pub fn get(&self, key: &GraphName) -> Option<Value> {
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        lookup(&root, key)
    }

    pub fn has(&self, key: &GraphName) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key` and everything below it.
    pub fn delete(&self, key: &GraphName) -> RosResult<()> {
        let path = segments(key);
        let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
        let Some((last, parents)) = path.split_last() else {
            root.clear();
            self.notify(&root, key);
            return Ok(());
        };
        let mut node = &mut *root;
        for segment in parents {
            node = node
                .get_mut(*segment)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| RosError::Config(format!("parameter {key} is not set")))?;
        }
        node.remove(*last)
            .ok_or_else(|| RosError::Config(format!("parameter {key} is not set")))?;
        debug!(key = %key, "Parameter deleted");
        self.notify(&root, key);
        Ok(())
    }

    /// Subscribe `subscriber` to `key`; returns the current value, `null`
    /// if unset. Subscribing twice keeps one subscription.
    pub fn subscribe(&self, key: &GraphName, subscriber: SlaveDescription) -> Value {
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = subscribers.entry(key.clone()).or_default();
        match entry.iter_mut().find(|s| s.name == subscriber.name) {
            Some(existing) => *existing = subscriber,
            None => entry.push(subscriber),
        }
        debug!(key = %key, "Parameter subscribed");
        lookup(&root, key).unwrap_or(Value::Null)
    }

    /// Returns how many subscriptions were removed.
    pub fn unsubscribe(&self, key: &GraphName, subscriber: &SlaveDescription) -> u32 {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = subscribers.get_mut(key) else {
            return 0;
        };
        let before = entry.len();
        entry.retain(|s| s != subscriber);
        let removed = (before - entry.len()) as u32;
        if entry.is_empty() {
            subscribers.remove(key);
        }
        removed
    }

    /// Every subscribed key and its subscribers.
    pub fn subscriptions(&self) -> Vec<(GraphName, Vec<SlaveDescription>)> {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers
            .iter()
            .map(|(key, slaves)| (key.clone(), slaves.clone()))
            .collect()
    }

    /// Called with the root lock held so pushes follow the order of changes.
    fn notify(&self, root: &Map<String, Value>, changed: &GraphName) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for (subscribed, slaves) in subscribers.iter() {
            let key = if changed.is_within(subscribed) {
                changed
            } else if subscribed.is_within(changed) {
                subscribed
            } else {
                continue;
            };
            let value = lookup(root, key).unwrap_or(Value::Null);
            for slave in slaves {
                notifier.param_update(slave, key, &value);
            }
        }
    }

    /// Find `key` by walking from `namespace` up to the root.
    ///
    /// A global key is returned if set. Otherwise, at each level the first
    /// segment of `key` is looked up; the first level holding it gives the
    /// result, even if the remainder of `key` is not set there.
    pub fn search(&self, namespace: &GraphName, key: &GraphName) -> Option<GraphName> {
        if key.is_global() {
            return self.has(key).then(|| key.clone());
        }
        let head = GraphName::new(key.segments().next()?).ok()?;
        let mut level = Some(namespace.to_global());
        while let Some(ns) = level {
            if self.has(&ns.join(&head)) {
                return Some(ns.join(key));
            }
            level = ns.parent();
        }
        None
    }

    /// Every leaf key, sorted.
    pub fn names(&self) -> Vec<GraphName> {
        fn walk(prefix: &GraphName, map: &Map<String, Value>, out: &mut Vec<GraphName>) {
            for (name, value) in map {
                let Ok(segment) = GraphName::new(name) else {
                    continue;
                };
                let key = prefix.join(&segment);
                match value {
                    Value::Object(child) if !child.is_empty() => walk(&key, child, out),
                    _ => out.push(key),
                }
            }
        }
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        walk(&GraphName::root(), &root, &mut out);
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gn(s: &str) -> GraphName {
        GraphName::new(s).unwrap()
    }

    #[test]
    fn test_set_creates_namespaces() {
        let params = ParameterTree::new();
        params.set(&gn("/robot/arm/joints"), json!(6)).unwrap();
        params.set(&gn("/robot/name"), json!("r2")).unwrap();

        assert_eq!(params.get(&gn("/robot/arm/joints")), Some(json!(6)));
        assert_eq!(
            params.get(&gn("/robot")),
            Some(json!({"arm": {"joints": 6}, "name": "r2"}))
        );
        assert!(params.has(&gn("/robot/arm")));
        assert!(!params.has(&gn("/robot/leg")));
    }

    #[test]
    fn test_value_replaced_by_namespace() {
        let params = ParameterTree::new();
        params.set(&gn("/a"), json!(1)).unwrap();
        params.set(&gn("/a/b"), json!(2)).unwrap();
        assert_eq!(params.get(&gn("/a")), Some(json!({"b": 2})));
    }

    #[test]
    fn test_delete_subtree() {
        let params = ParameterTree::new();
        params.set(&gn("/a/b/c"), json!(true)).unwrap();
        params.set(&gn("/a/d"), json!(false)).unwrap();
        params.delete(&gn("/a/b")).unwrap();
        assert!(!params.has(&gn("/a/b/c")));
        assert!(params.has(&gn("/a/d")));
        assert!(params.delete(&gn("/a/b")).is_err());
        assert!(params.delete(&gn("/x/y")).is_err());
    }

    #[test]
    fn test_root_set_and_get() {
        let params = ParameterTree::new();
        assert!(params.set(&GraphName::root(), json!(3)).is_err());
        params.set(&GraphName::root(), json!({"k": 1})).unwrap();
        assert_eq!(params.get(&GraphName::root()), Some(json!({"k": 1})));
    }

    #[test]
    fn test_search_walks_up() {
        let params = ParameterTree::new();
        params.set(&gn("/robot/rate"), json!(10)).unwrap();
        params.set(&gn("/rate"), json!(1)).unwrap();
        params.set(&gn("/gains/p"), json!(0.5)).unwrap();

        assert_eq!(
            params.search(&gn("/robot/arm"), &gn("rate")),
            Some(gn("/robot/rate"))
        );
        assert_eq!(params.search(&gn("/other"), &gn("rate")), Some(gn("/rate")));
        assert_eq!(
            params.search(&gn("/robot"), &gn("gains/p")),
            Some(gn("/gains/p"))
        );
        assert_eq!(params.search(&gn("/robot"), &gn("missing")), None);
        assert_eq!(params.search(&gn("/robot"), &gn("/rate")), Some(gn("/rate")));
    }

    #[derive(Default)]
    struct Pushes(Mutex<Vec<(GraphName, GraphName, Value)>>);

    impl SlaveNotifier for Pushes {
        fn publisher_update(&self, _: &GraphName, _: Vec<SlaveDescription>, _: Vec<SlaveDescription>) {}

        fn shutdown_node(&self, _: &SlaveDescription, _: &str) {}

        fn param_update(&self, subscriber: &SlaveDescription, key: &GraphName, value: &Value) {
            self.0
                .lock()
                .unwrap()
                .push((subscriber.name.clone(), key.clone(), value.clone()));
        }
    }

    impl Pushes {
        fn take(&self) -> Vec<(GraphName, GraphName, Value)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn slave(name: &str, port: u16) -> SlaveDescription {
        SlaveDescription::new(gn(name), std::net::SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_subscribe_returns_current_value() {
        let params = ParameterTree::new();
        assert_eq!(params.subscribe(&gn("/rate"), slave("/a", 1)), Value::Null);
        params.set(&gn("/rate"), json!(10)).unwrap();
        assert_eq!(params.subscribe(&gn("/rate"), slave("/a", 1)), json!(10));
        assert_eq!(params.subscriptions().len(), 1);
        assert_eq!(params.subscriptions()[0].1.len(), 1);
    }

    #[test]
    fn test_changes_pushed_to_subscribers() {
        let pushes = Arc::new(Pushes::default());
        let params = ParameterTree::with_notifier(pushes.clone());
        params.subscribe(&gn("/robot"), slave("/watcher", 1));
        params.subscribe(&gn("/robot/arm/speed"), slave("/arm", 2));

        // Below the watcher's key: the changed key is pushed.
        params.set(&gn("/robot/name"), json!("r2")).unwrap();
        assert_eq!(
            pushes.take(),
            vec![(gn("/watcher"), gn("/robot/name"), json!("r2"))]
        );

        // Above the arm's key: the arm gets its own key's new value.
        params.set(&gn("/robot/arm"), json!({"speed": 3})).unwrap();
        let mut got = pushes.take();
        got.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            got,
            vec![
                (gn("/arm"), gn("/robot/arm/speed"), json!(3)),
                (gn("/watcher"), gn("/robot/arm"), json!({"speed": 3})),
            ]
        );

        // Deletion is pushed as null.
        params.delete(&gn("/robot/arm")).unwrap();
        let mut got = pushes.take();
        got.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            got,
            vec![
                (gn("/arm"), gn("/robot/arm/speed"), Value::Null),
                (gn("/watcher"), gn("/robot/arm"), Value::Null),
            ]
        );

        // Unrelated keys and sibling prefixes are not pushed.
        params.set(&gn("/robotics"), json!(1)).unwrap();
        assert!(pushes.take().is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_pushes() {
        let pushes = Arc::new(Pushes::default());
        let params = ParameterTree::with_notifier(pushes.clone());
        let watcher = slave("/watcher", 1);
        params.subscribe(&gn("/rate"), watcher.clone());
        assert_eq!(params.unsubscribe(&gn("/rate"), &slave("/watcher", 9)), 0);
        assert_eq!(params.unsubscribe(&gn("/rate"), &watcher), 1);
        assert_eq!(params.unsubscribe(&gn("/rate"), &watcher), 0);
        params.set(&gn("/rate"), json!(5)).unwrap();
        assert!(pushes.take().is_empty());
        assert!(params.subscriptions().is_empty());
    }

    #[test]
    fn test_names_lists_leaves() {
        let params = ParameterTree::new();
        params.set(&gn("/a/b"), json!(1)).unwrap();
        params.set(&gn("/a/c/d"), json!([1, 2])).unwrap();
        params.set(&gn("/e"), json!({})).unwrap();
        assert_eq!(
            params.names(),
            vec![gn("/a/b"), gn("/a/c/d"), gn("/e")]
        );
    }
}
