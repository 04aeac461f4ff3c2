#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use kreflect_core::{EntityList, Error, Resource, Result};
use kreflect_kubehub::{ListWatch, WatchCancel, WatchConnection, WatchOptions};
use kreflect_store::{ReflectorConfig, Store};

/// What the next `watch` call returns.
pub enum Body {
    /// Send these lines, then close.
    Lines(Vec<String>),
    /// Send these lines, then stay open forever.
    Hang(Vec<String>),
    Fail(Error),
}

/// Scripted list/watch backend. Once a script runs out the call never completes.
#[derive(Default)]
pub struct Scripted {
    lists: Mutex<VecDeque<Result<EntityList>>>,
    watches: Mutex<VecDeque<Body>>,
    pub watched_at: Mutex<Vec<String>>,
    pub cancels: Mutex<Vec<WatchCancel>>,
    pub list_calls: AtomicUsize,
}

impl Scripted {
    pub fn new(lists: Vec<Result<EntityList>>, watches: Vec<Body>) -> Self {
        Self { lists: Mutex::new(lists.into()), watches: Mutex::new(watches.into()), ..Default::default() }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ListWatch for Scripted {
    async fn list_page(&self, _limit: Option<u32>, _token: Option<&str>) -> Result<EntityList> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().pop_front();
        match next {
            Some(r) => r,
            None => futures::future::pending::<Result<EntityList>>().await,
        }
    }

    async fn watch(&self, resource_version: &str, _opts: WatchOptions) -> Result<WatchConnection> {
        self.watched_at.lock().push(resource_version.to_string());
        let next = self.watches.lock().pop_front();
        let (lines, hang) = match next {
            Some(Body::Fail(e)) => return Err(e),
            Some(Body::Lines(lines)) => (lines, false),
            Some(Body::Hang(lines)) => (lines, true),
            None => (Vec::new(), true),
        };
        let body = async_stream::stream! {
            for l in lines {
                yield Ok::<Bytes, Error>(Bytes::from(l));
            }
            if hang {
                futures::future::pending::<()>().await;
            }
        };
        let conn = WatchConnection::from_stream(body);
        self.cancels.lock().push(conn.canceller());
        Ok(conn)
    }

    fn describe(&self) -> String {
        "v1/Pod ns=d".into()
    }
}

pub fn pod(name: &str, rv: &str) -> Resource {
    Resource::new(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": "d", "resourceVersion": rv }
    }))
}

pub fn listing(rv: &str, names: &[&str]) -> EntityList {
    EntityList {
        entity_kind: "PodList".into(),
        resource_version: rv.into(),
        items: names.iter().map(|n| pod(n, rv)).collect(),
        continue_token: None,
    }
}

pub fn line(kind: &str, name: &str, rv: &str) -> String {
    let ev = serde_json::json!({ "type": kind, "object": pod(name, rv).as_json() });
    format!("{}\n", ev)
}

pub fn bookmark(rv: &str) -> String {
    format!("{}\n", serde_json::json!({ "type": "BOOKMARK", "object": { "kind": "Pod", "metadata": { "resourceVersion": rv } } }))
}

pub fn error_line(code: u16, reason: &str) -> String {
    let status = serde_json::json!({
        "kind": "Status", "apiVersion": "v1", "status": "Failure",
        "message": format!("{} ({})", reason, code), "reason": reason, "code": code
    });
    format!("{}\n", serde_json::json!({ "type": "ERROR", "object": status }))
}

pub fn fast_config() -> ReflectorConfig {
    ReflectorConfig::default()
        .with_page_size(None)
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
        .with_stop_timeout(Duration::from_secs(1))
}

pub fn names(store: &Store) -> Vec<String> {
    store.list().iter().filter_map(|r| r.name().map(str::to_string)).collect()
}

/// Wait until `cond` holds for the store, re-checking after every mutation.
pub async fn until(store: &Store, cond: impl Fn(&Store) -> bool) {
    let mut rx = store.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if cond(store) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "store never reached expected state: rv={} items={:?}", store.resource_version(), names(store));
}
