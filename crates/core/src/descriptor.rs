use serde::{Deserialize, Serialize};

use crate::Error;

/// A served resource collection as resolved by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name used in URLs (`pods`, `deployments`).
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `/api/v1` for the core group, `/apis/<group>/<version>` otherwise.
    pub fn api_prefix(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Split `v1/Kind` or `group/v1/Kind` into `(group, version, kind)`.
pub fn parse_gvk_key(key: &str) -> Result<(String, String, String), Error> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok((String::new(), (*version).to_string(), (*kind).to_string()))
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
            Ok(((*group).to_string(), (*version).to_string(), (*kind).to_string()))
        }
        _ => Err(Error::InvalidGvk(key.to_string())),
    }
}

/// Scope of one mirrored collection: optional namespace, selectors and single object name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub name: Option<String>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Field selector actually sent to the server; a single-name scope becomes
    /// `metadata.name=<name>` on listings since collections cannot be addressed by name.
    pub fn effective_field_selector(&self) -> Option<String> {
        let by_name = self.name.as_ref().map(|n| format!("metadata.name={}", n));
        match (self.field_selector.as_deref().filter(|s| !s.is_empty()), by_name) {
            (Some(f), Some(n)) => Some(format!("{},{}", f, n)),
            (Some(f), None) => Some(f.to_string()),
            (None, n) => n,
        }
    }
}
