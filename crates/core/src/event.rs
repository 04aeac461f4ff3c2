use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::{Deserialize, Serialize};

use crate::{DecodeError, Error, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl EventType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADDED" => Some(Self::Added),
            "MODIFIED" => Some(Self::Modified),
            "DELETED" => Some(Self::Deleted),
            "BOOKMARK" => Some(Self::Bookmark),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Bookmark => "BOOKMARK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of a watch stream.
///
/// For `Error` events `object` holds a `Status` payload rather than a resource and
/// `resource_version` is empty. Serializes to the wire shape; decode with [`WatchEvent::from_line`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: Resource,
    #[serde(skip)]
    pub resource_version: String,
}

impl WatchEvent {
    pub fn new(event_type: EventType, object: Resource) -> Self {
        let resource_version = match event_type {
            EventType::Error => String::new(),
            _ => object.resource_version().unwrap_or_default().to_string(),
        };
        Self { event_type, object, resource_version }
    }

    /// Parse a single line of the watch wire format: `{"type": "...", "object": {...}}`.
    pub fn from_line(line: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(line).map_err(|e| DecodeError::invalid_json(line, e))?;
        let mut map = match value {
            serde_json::Value::Object(map) => map,
            _ => return Err(DecodeError::MissingField("type")),
        };
        let event_type = match map.get("type") {
            Some(serde_json::Value::String(t)) => {
                EventType::parse(t).ok_or_else(|| DecodeError::UnknownType(t.clone()))?
            }
            _ => return Err(DecodeError::MissingField("type")),
        };
        let object = match map.remove("object") {
            Some(obj @ serde_json::Value::Object(_)) => obj,
            _ => return Err(DecodeError::MissingField("object")),
        };
        Ok(Self::new(event_type, Resource::new(object)))
    }

    /// Decoded server status for `Error` events.
    pub fn status(&self) -> Option<Status> {
        if self.event_type != EventType::Error {
            return None;
        }
        serde_json::from_value(self.object.as_json().clone()).ok()
    }

    pub fn status_code(&self) -> Option<i64> {
        self.object.pointer("code").and_then(|c| c.as_i64())
    }

    /// True for an `Error` event reporting that the watch's resource version is gone (410).
    pub fn is_expired(&self) -> bool {
        self.event_type == EventType::Error
            && (self.status_code() == Some(410)
                || matches!(self.object.str_at("reason"), Some("Expired") | Some("Gone")))
    }

    /// Human readable message for `Error` events.
    pub fn error_message(&self) -> String {
        self.object
            .str_at("message")
            .map(str::to_string)
            .unwrap_or_else(|| self.object.as_json().to_string())
    }
}

/// Result of a full (possibly paginated) listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityList {
    pub entity_kind: String,
    pub resource_version: String,
    pub items: Vec<Resource>,
    pub continue_token: Option<String>,
}

impl EntityList {
    /// Build from a list response body.
    ///
    /// The top-level `resourceVersion` wins over `metadata.resourceVersion` when both exist.
    pub fn from_json(value: serde_json::Value) -> Result<Self, Error> {
        let mut map = match value {
            serde_json::Value::Object(map) => map,
            other => return Err(Error::Listing(format!("list response is not an object: {}", other))),
        };
        let meta = map.remove("metadata").unwrap_or(serde_json::Value::Null);
        let resource_version = map
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .or_else(|| meta.get("resourceVersion").and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_string();
        let continue_token = meta
            .get("continue")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let entity_kind = map.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let items = match map.remove("items") {
            Some(serde_json::Value::Array(items)) => items.into_iter().map(Resource::new).collect(),
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(other) => return Err(Error::Listing(format!("`items` is not an array: {}", other))),
        };
        Ok(Self { entity_kind, resource_version, items, continue_token })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
