//! Parameters this node subscribed to, kept current by `paramUpdate` pushes.

use dashmap::DashMap;
use rosgraph_types::GraphName;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

struct CachedParam {
    tx: watch::Sender<Value>,
    pushed: AtomicBool,
}

/// Subscribed parameter values by key. `null` means not set.
#[derive(Default)]
pub struct ParameterCache {
    entries: DashMap<GraphName, CachedParam>,
}

/// Write `value` at `path` below `target`; `null` removes the entry.
fn apply(target: &mut Value, path: &[&str], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *target = value;
        return;
    };
    if !target.is_object() {
        if value.is_null() {
            return;
        }
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    if rest.is_empty() {
        if value.is_null() {
            map.remove(*first);
        } else {
            map.insert(first.to_string(), value);
        }
        return;
    }
    if value.is_null() && !map.contains_key(*first) {
        return;
    }
    let child = map
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    apply(child, rest, value);
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `key`. Call before asking the registry, so pushes that
    /// race the registry's answer are kept.
    pub fn track(&self, key: &GraphName) -> watch::Receiver<Value> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| CachedParam {
                tx: watch::channel(Value::Null).0,
                pushed: AtomicBool::new(false),
            })
            .tx
            .subscribe()
    }

    /// Seed `key` with the registry's answer unless a push already arrived.
    pub fn seed(&self, key: &GraphName, value: Value) {
        if let Some(entry) = self.entries.get(key) {
            let pushed = &entry.pushed;
            entry.tx.send_if_modified(|current| {
                if pushed.load(Ordering::Acquire) {
                    return false;
                }
                *current = value;
                true
            });
        }
    }

    /// Apply a pushed change to every tracked key at or above `key`.
    /// Returns whether any tracked key was affected.
    pub fn update(&self, key: &GraphName, value: Value) -> bool {
        let mut matched = false;
        for entry in self.entries.iter() {
            let Some(path) = relative_path(entry.key(), key) else {
                continue;
            };
            let pushed = &entry.pushed;
            let value = value.clone();
            entry.tx.send_modify(|current| {
                apply(current, &path, value);
                pushed.store(true, Ordering::Release);
            });
            matched = true;
        }
        debug!(key = %key, matched, "Parameter update");
        matched
    }

    /// The latest value of a tracked key.
    pub fn get(&self, key: &GraphName) -> Option<Value> {
        self.entries.get(key).map(|e| e.tx.borrow().clone())
    }

    pub fn remove(&self, key: &GraphName) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Every tracked key.
    pub fn keys(&self) -> Vec<GraphName> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

/// Segments of `key` below `tracked`, or `None` if `key` is not at or below it.
fn relative_path<'a>(tracked: &GraphName, key: &'a GraphName) -> Option<Vec<&'a str>> {
    if !key.is_within(tracked) {
        return None;
    }
    let depth = tracked.segments().count();
    Some(key.segments().skip(depth).collect())
}
