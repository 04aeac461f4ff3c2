#![forbid(unsafe_code)]

mod support;

use std::sync::Arc;

use kreflect_core::{EventType, Resource, WatchEvent};
use kreflect_store::{ApplyOutcome, Store};
use support::{listing, names, pod};

fn ev(t: EventType, name: &str, rv: &str) -> WatchEvent {
    WatchEvent::new(t, pod(name, rv))
}

#[test]
fn add_modify_delete_leaves_no_entry() {
    let s = Store::new();
    s.apply(&ev(EventType::Added, "a", "1"));
    s.apply(&ev(EventType::Modified, "a", "2"));
    assert_eq!(s.apply(&ev(EventType::Deleted, "a", "3")), ApplyOutcome::Removed);
    assert!(s.get(Some("d"), "a").is_none());
    assert!(s.is_empty());
    assert_eq!(s.resource_version(), "3");
}

#[test]
fn bookmark_moves_only_the_cursor() {
    let s = Store::new();
    s.replace_all(listing("10", &["a", "b"]));
    let before = s.list();
    let bm = WatchEvent::new(EventType::Bookmark, Resource::new(serde_json::json!({ "metadata": { "resourceVersion": "15" } })));
    assert_eq!(s.apply(&bm), ApplyOutcome::CursorAdvanced);
    assert_eq!(s.list(), before);
    assert_eq!(s.resource_version(), "15");
}

#[test]
fn replace_all_discards_previous_contents() {
    let s = Store::new();
    s.replace_all(listing("10", &["a", "b", "c"]));
    s.apply(&ev(EventType::Added, "z", "11"));
    s.replace_all(listing("20", &["b", "x"]));
    assert_eq!(names(&s), vec!["b", "x"]);
    assert_eq!(s.resource_version(), "20");
    assert_eq!(s.get(Some("d"), "b").unwrap().resource_version(), Some("20"));
}

#[test]
fn replace_all_can_rewind_the_cursor() {
    // a relist is authoritative even when its version is lower than a stale cursor
    let s = Store::new();
    s.replace_all(listing("500", &["a"]));
    s.replace_all(listing("42", &["b"]));
    assert_eq!(s.resource_version(), "42");
}

#[test]
fn duplicate_delete_is_idempotent() {
    let s = Store::new();
    s.replace_all(listing("1", &["a", "b"]));
    let del = ev(EventType::Deleted, "a", "2");
    assert_eq!(s.apply(&del), ApplyOutcome::Removed);
    let (rv, items) = s.snapshot();
    let epoch = s.epoch();
    assert_eq!(s.apply(&del), ApplyOutcome::Unchanged);
    assert_eq!(s.snapshot(), (rv, items));
    assert_eq!(s.epoch(), epoch);
}

#[test]
fn delete_of_absent_key_still_advances() {
    let s = Store::new();
    s.replace_all(listing("1", &["a"]));
    assert_eq!(s.apply(&ev(EventType::Deleted, "ghost", "7")), ApplyOutcome::CursorAdvanced);
    assert_eq!(names(&s), vec!["a"]);
    assert_eq!(s.resource_version(), "7");
}

#[test]
fn readers_never_see_half_a_relist() {
    let store = Arc::new(Store::new());
    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for n in 1..200usize {
                let names: Vec<String> = (0..n).map(|i| format!("p{}", i)).collect();
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                store.replace_all(listing(&n.to_string(), &refs));
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let (rv, items) = store.snapshot();
                    if rv.is_empty() {
                        continue;
                    }
                    let n: usize = rv.parse().unwrap();
                    assert_eq!(items.len(), n);
                    assert!(items.iter().all(|r| r.resource_version() == Some(rv.as_str())));
                }
            })
        })
        .collect();
    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
}
