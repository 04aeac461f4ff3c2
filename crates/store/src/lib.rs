//! kreflect store: the locally cached view of one collection and the reflector keeping it current.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use metrics::gauge;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use kreflect_core::{is_older, EntityList, EventType, ObjectKey, Resource, WatchEvent};

mod backoff;
mod config;
mod reflector;

pub use backoff::Backoff;
pub use config::{ReflectorConfig, MAX_BACKOFF, MAX_EVENT_CHANNEL_CAP};
pub use reflector::{FailureKind, Reflector, ReflectorEvent, ReflectorHandle, ReflectorPhase};

/// What an applied event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entry inserted or replaced.
    Applied,
    /// Entry removed.
    Removed,
    /// Only the cursor moved (bookmarks, deletes of absent keys).
    CursorAdvanced,
    /// Nothing changed: stale, duplicate, or unkeyed event.
    Unchanged,
    /// Server reported an error; the collection must be listed again.
    Relist,
}

#[derive(Debug, Clone)]
struct Entry {
    resource: Resource,
    resource_version: String,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: FxHashMap<ObjectKey, Entry>,
    /// Insertion order for `list`.
    order: BTreeMap<u64, ObjectKey>,
    next_seq: u64,
    resource_version: String,
}

impl Inner {
    fn upsert(&mut self, key: ObjectKey, resource: Resource) {
        let resource_version = resource.resource_version().unwrap_or_default().to_string();
        match self.entries.get_mut(&key) {
            Some(e) => {
                e.resource = resource;
                e.resource_version = resource_version;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.order.insert(seq, key.clone());
                self.entries.insert(key, Entry { resource, resource_version, seq });
            }
        }
    }

    fn remove(&mut self, key: &ObjectKey) -> bool {
        match self.entries.remove(key) {
            Some(e) => {
                self.order.remove(&e.seq);
                true
            }
            None => false,
        }
    }

    /// Move the cursor forward; never backwards.
    fn advance(&mut self, rv: &str) -> bool {
        if rv.is_empty() || rv == self.resource_version || is_older(rv, &self.resource_version) {
            return false;
        }
        self.resource_version = rv.to_string();
        true
    }
}

/// Thread-safe keyed cache of one collection plus its sync cursor.
///
/// A single writer (the reflector) mutates it; any number of readers take snapshots. Every
/// mutation happens under one write lock, so readers never see half an event or half a relist.
pub struct Store {
    inner: RwLock<Inner>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { inner: RwLock::new(Inner::default()), epoch_tx }
    }

    fn bump(&self, len: usize) {
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
        gauge!("kreflect_store_items", len as f64);
    }

    /// Replace contents and cursor with a fresh listing. Nothing of the previous state survives.
    pub fn replace_all(&self, list: EntityList) {
        let mut next = Inner { resource_version: list.resource_version, ..Inner::default() };
        let mut unkeyed = 0usize;
        for item in list.items {
            match item.key() {
                Some(key) => next.upsert(key, item),
                None => unkeyed += 1,
            }
        }
        if unkeyed > 0 {
            warn!(unkeyed, "listing contained objects without name or uid; skipped");
        }
        let len = next.entries.len();
        *self.inner.write() = next;
        debug!(items = len, "store replaced");
        self.bump(len);
    }

    /// Apply one watch event.
    pub fn apply(&self, ev: &WatchEvent) -> ApplyOutcome {
        if ev.event_type == EventType::Error {
            return ApplyOutcome::Relist;
        }
        let mut inner = self.inner.write();
        let outcome = match ev.event_type {
            EventType::Added | EventType::Modified => match ev.object.key() {
                Some(key) => {
                    let stale = inner
                        .entries
                        .get(&key)
                        .map(|e| is_older(&ev.resource_version, &e.resource_version))
                        .unwrap_or(false);
                    if stale {
                        debug!(key = %key, rv = %ev.resource_version, "ignoring stale event");
                        ApplyOutcome::Unchanged
                    } else {
                        inner.upsert(key, ev.object.clone());
                        inner.advance(&ev.resource_version);
                        ApplyOutcome::Applied
                    }
                }
                None => {
                    warn!(event = %ev.event_type, "event object has no name or uid; ignored");
                    ApplyOutcome::Unchanged
                }
            },
            EventType::Deleted => {
                let removed = ev.object.key().map(|k| inner.remove(&k)).unwrap_or(false);
                let advanced = inner.advance(&ev.resource_version);
                match (removed, advanced) {
                    (true, _) => ApplyOutcome::Removed,
                    (false, true) => ApplyOutcome::CursorAdvanced,
                    (false, false) => ApplyOutcome::Unchanged,
                }
            }
            EventType::Bookmark => {
                if inner.advance(&ev.resource_version) { ApplyOutcome::CursorAdvanced } else { ApplyOutcome::Unchanged }
            }
            EventType::Error => ApplyOutcome::Relist,
        };
        if outcome != ApplyOutcome::Unchanged {
            let len = inner.entries.len();
            drop(inner);
            self.bump(len);
        }
        outcome
    }

    /// Look up by namespace and name; `None` namespace addresses cluster-scoped objects.
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Resource> {
        let inner = self.inner.read();
        match namespace {
            Some(ns) => inner
                .entries
                .get(&ObjectKey::Namespaced { namespace: ns.to_string(), name: name.to_string() })
                .map(|e| e.resource.clone()),
            None => inner.entries.get(&ObjectKey::Name(name.to_string())).map(|e| e.resource.clone()).or_else(|| {
                inner
                    .entries
                    .iter()
                    .find(|(k, e)| matches!(k, ObjectKey::Uid(_)) && e.resource.name() == Some(name))
                    .map(|(_, e)| e.resource.clone())
            }),
        }
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Resource> {
        self.inner.read().entries.get(key).map(|e| e.resource.clone())
    }

    /// Point-in-time copy of all entries in insertion order.
    pub fn list(&self) -> Vec<Resource> {
        let inner = self.inner.read();
        inner
            .order
            .values()
            .filter_map(|k| inner.entries.get(k))
            .map(|e| e.resource.clone())
            .collect()
    }

    /// Snapshot of entries and cursor taken under one lock.
    pub fn snapshot(&self) -> (String, Vec<Resource>) {
        let inner = self.inner.read();
        let items = inner.order.values().filter_map(|k| inner.entries.get(k)).map(|e| e.resource.clone()).collect();
        (inner.resource_version.clone(), items)
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.inner.read().order.values().cloned().collect()
    }

    pub fn resource_version(&self) -> String {
        self.inner.read().resource_version.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Drop all entries and the cursor.
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
        self.bump(0);
    }

    /// Counter bumped after every visible mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, rv: &str) -> Resource {
        Resource::new(json!({ "kind": "Pod", "metadata": { "name": name, "namespace": "d", "resourceVersion": rv } }))
    }

    fn ev(t: EventType, r: Resource) -> WatchEvent {
        WatchEvent::new(t, r)
    }

    #[test]
    fn stale_modification_is_ignored() {
        let s = Store::new();
        assert_eq!(s.apply(&ev(EventType::Added, pod("a", "10"))), ApplyOutcome::Applied);
        assert_eq!(s.apply(&ev(EventType::Modified, pod("a", "9"))), ApplyOutcome::Unchanged);
        assert_eq!(s.get(Some("d"), "a").unwrap().resource_version(), Some("10"));
        assert_eq!(s.resource_version(), "10");
    }

    #[test]
    fn cursor_never_rewinds() {
        let s = Store::new();
        s.apply(&ev(EventType::Bookmark, Resource::new(json!({ "metadata": { "resourceVersion": "50" } }))));
        assert_eq!(s.apply(&ev(EventType::Bookmark, Resource::new(json!({ "metadata": { "resourceVersion": "40" } })))), ApplyOutcome::Unchanged);
        assert_eq!(s.resource_version(), "50");
    }

    #[test]
    fn error_event_touches_nothing() {
        let s = Store::new();
        s.apply(&ev(EventType::Added, pod("a", "1")));
        let epoch = s.epoch();
        let err = ev(EventType::Error, Resource::new(json!({ "kind": "Status", "code": 500, "message": "internal" })));
        assert_eq!(s.apply(&err), ApplyOutcome::Relist);
        assert_eq!(s.len(), 1);
        assert_eq!(s.resource_version(), "1");
        assert_eq!(s.epoch(), epoch);
    }

    #[test]
    fn cluster_scoped_lookup_by_name() {
        let s = Store::new();
        let node = Resource::new(json!({ "kind": "Node", "metadata": { "name": "n1", "uid": "u-1", "resourceVersion": "3" } }));
        s.apply(&ev(EventType::Added, node));
        assert_eq!(s.keys(), vec![ObjectKey::Uid("u-1".into())]);
        assert!(s.get(None, "n1").is_some());
        assert!(s.get(Some("default"), "n1").is_none());
    }

    #[test]
    fn list_keeps_insertion_order_after_updates() {
        let s = Store::new();
        for (n, rv) in [("c", "1"), ("a", "2"), ("b", "3")] {
            s.apply(&ev(EventType::Added, pod(n, rv)));
        }
        s.apply(&ev(EventType::Modified, pod("c", "4")));
        let names: Vec<_> = s.list().iter().map(|r| r.name().unwrap().to_string()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn subscribers_see_epoch_changes() {
        let s = Store::new();
        let mut rx = s.subscribe();
        s.apply(&ev(EventType::Added, pod("a", "1")));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        s.clear();
        rx.changed().await.unwrap();
        assert!(s.is_empty());
        assert_eq!(s.resource_version(), "");
    }
}
