use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use kube::discovery::{Discovery, Scope};
use tracing::info;

use kreflect_core::{parse_gvk_key, Error, ResourceDescriptor, Result};

/// Lookup table from `gvk` keys (and kind/plural aliases) to served resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    ordered: Vec<ResourceDescriptor>,
    by_gvk: HashMap<String, usize>,
    by_alias: HashMap<String, usize>,
}

impl ResourceTable {
    pub fn from_descriptors(mut descriptors: Vec<ResourceDescriptor>) -> Self {
        descriptors.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        let mut by_gvk = HashMap::with_capacity(descriptors.len());
        let mut by_alias = HashMap::new();
        for (i, d) in descriptors.iter().enumerate() {
            by_gvk.insert(d.gvk_key(), i);
            // first (core group sorts first) wins for bare aliases
            by_alias.entry(d.kind.to_ascii_lowercase()).or_insert(i);
            by_alias.entry(d.plural.to_ascii_lowercase()).or_insert(i);
        }
        Self { ordered: descriptors, by_gvk, by_alias }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.ordered.iter()
    }

    /// Resolve `v1/Pod`, `apps/v1/Deployment`, or a bare kind/plural such as `pods`.
    pub fn resolve(&self, key: &str) -> Result<&ResourceDescriptor> {
        let idx = if key.contains('/') {
            let (group, version, kind) = parse_gvk_key(key)?;
            let canonical = ResourceDescriptor::new(&group, &version, &kind, "", false).gvk_key();
            self.by_gvk.get(&canonical)
        } else {
            self.by_alias.get(&key.to_ascii_lowercase())
        };
        idx.map(|i| &self.ordered[*i])
            .ok_or_else(|| Error::NotFound(format!("resource {} is not served", key)))
    }
}

/// Discovery results shared by every caller of one client.
///
/// The first `ensure_discovered` runs discovery under a single lock; concurrent first callers wait
/// for it instead of discovering again. Later calls read the published table without locking.
pub struct Registry {
    client: Option<kube::Client>,
    table: ArcSwapOption<ResourceTable>,
    init: tokio::sync::Mutex<()>,
}

impl Registry {
    pub fn new(client: kube::Client) -> Self {
        Self { client: Some(client), table: ArcSwapOption::empty(), init: tokio::sync::Mutex::new(()) }
    }

    /// Registry with a fixed table and no discovery backend.
    pub fn from_descriptors(descriptors: Vec<ResourceDescriptor>) -> Self {
        Self {
            client: None,
            table: ArcSwapOption::from_pointee(ResourceTable::from_descriptors(descriptors)),
            init: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_discovered(&self) -> bool {
        self.table.load().is_some()
    }

    pub async fn ensure_discovered(&self) -> Result<Arc<ResourceTable>> {
        if let Some(table) = self.table.load_full() {
            return Ok(table);
        }
        let _guard = self.init.lock().await;
        if let Some(table) = self.table.load_full() {
            return Ok(table);
        }
        self.discover_locked().await
    }

    /// Re-run discovery, e.g. after CRDs were installed.
    pub async fn refresh(&self) -> Result<Arc<ResourceTable>> {
        let _guard = self.init.lock().await;
        self.discover_locked().await
    }

    pub async fn resolve(&self, key: &str) -> Result<ResourceDescriptor> {
        let table = self.ensure_discovered().await?;
        table.resolve(key).cloned()
    }

    pub async fn resources(&self) -> Result<Vec<ResourceDescriptor>> {
        Ok(self.ensure_discovered().await?.iter().cloned().collect())
    }

    async fn discover_locked(&self) -> Result<Arc<ResourceTable>> {
        let Some(client) = self.client.clone() else {
            return self.table.load_full().ok_or_else(|| Error::Discovery("no discovery backend".into()));
        };
        let t0 = Instant::now();
        let discovery = Discovery::new(client).run().await.map_err(|e| Error::Discovery(e.to_string()))?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                out.push(ResourceDescriptor::new(&ar.group, &ar.version, &ar.kind, &ar.plural, namespaced));
            }
        }
        let table = Arc::new(ResourceTable::from_descriptors(out));
        info!(count = table.len(), took_ms = %t0.elapsed().as_millis(), "discovery complete");
        self.table.store(Some(Arc::clone(&table)));
        Ok(table)
    }
}
