//! kreflect core types: generic resource values, watch events, listings and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod descriptor;
mod error;
mod event;

pub use descriptor::{parse_gvk_key, ResourceDescriptor, Selector};
pub use error::{DecodeError, Error, Result};
pub use event::{EntityList, EventType, WatchEvent};

pub mod prelude {
    pub use super::{
        EntityList, Error, EventType, ObjectKey, Resource, ResourceDescriptor, Result, Selector, WatchEvent,
    };
}

/// Immutable, dynamically keyed JSON value as returned by the API server.
///
/// Cloning is cheap; the payload is shared and never mutated in place.
#[derive(Clone, PartialEq)]
pub struct Resource(Arc<serde_json::Value>);

impl Resource {
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Unwraps the JSON payload, cloning only if other owners still exist.
    pub fn into_json(self) -> serde_json::Value {
        Arc::try_unwrap(self.0).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Navigate a dotted path such as `metadata.name` or `spec.containers.0.image`.
    pub fn pointer(&self, path: &str) -> Option<&serde_json::Value> {
        let mut cur = self.0.as_ref();
        for seg in path.split('.').filter(|s| !s.is_empty()) {
            cur = match cur {
                serde_json::Value::Object(map) => map.get(seg)?,
                serde_json::Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    pub fn str_at(&self, path: &str) -> Option<&str> {
        self.pointer(path).and_then(|v| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.str_at("metadata.name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_at("metadata.namespace").filter(|s| !s.is_empty())
    }

    pub fn uid(&self) -> Option<&str> {
        self.str_at("metadata.uid").filter(|s| !s.is_empty())
    }

    pub fn kind(&self) -> Option<&str> {
        self.str_at("kind")
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.str_at("metadata.resourceVersion").filter(|s| !s.is_empty())
    }

    /// Labels as `(key, value)` pairs; non-string values are skipped.
    pub fn labels(&self) -> Vec<(&str, &str)> {
        self.pointer("metadata.labels")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.as_str(), s))).collect())
            .unwrap_or_default()
    }

    pub fn creation_timestamp(&self) -> Option<chrono::DateTime<chrono::FixedOffset>> {
        self.str_at("metadata.creationTimestamp")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
    }

    /// Store key for this object, if it carries enough identity to have one.
    pub fn key(&self) -> Option<ObjectKey> {
        ObjectKey::of(self)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &self.kind())
            .field("namespace", &self.namespace())
            .field("name", &self.name())
            .field("rv", &self.resource_version())
            .finish()
    }
}

impl From<serde_json::Value> for Resource {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

impl Serialize for Resource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Resource::new)
    }
}

/// Identity of a cached object.
///
/// Namespaced objects are keyed by `(namespace, name)`. Cluster-scoped objects are keyed by uid,
/// falling back to the bare name when the server did not send one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKey {
    Namespaced { namespace: String, name: String },
    Uid(String),
    Name(String),
}

impl ObjectKey {
    pub fn of(r: &Resource) -> Option<Self> {
        match (r.namespace(), r.name(), r.uid()) {
            (Some(ns), Some(name), _) => Some(Self::Namespaced { namespace: ns.to_string(), name: name.to_string() }),
            (None, _, Some(uid)) => Some(Self::Uid(uid.to_string())),
            (None, Some(name), None) => Some(Self::Name(name.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespaced { namespace, name } => write!(f, "{}/{}", namespace, name),
            Self::Uid(uid) => write!(f, "uid:{}", uid),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Returns true when `candidate` is provably older than `current`.
///
/// Resource versions are opaque. Only when both parse as integers can an ordering be established;
/// otherwise the candidate is treated as current.
pub fn is_older(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}
