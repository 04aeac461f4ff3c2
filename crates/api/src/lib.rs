//! kreflect public API façade (in-process).
//!
//! Frontends (the CLI, embedding controllers) depend on this crate only: it resolves resource
//! keys through discovery, starts and stops reflectors, and exposes one-shot list/get.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use kreflect_core::{EntityList, Error, Resource, ResourceDescriptor, Selector, WatchEvent};
use kreflect_kubehub::{list_all, ApiClient, CollectionClient, ListWatch, Registry};
use kreflect_store::{FailureKind, Reflector, ReflectorConfig, ReflectorEvent, ReflectorHandle, ReflectorPhase, Store};

/// A served resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl From<ResourceDescriptor> for ResourceKind {
    fn from(d: ResourceDescriptor) -> Self {
        Self { group: d.group, version: d.version, kind: d.kind, plural: d.plural, namespaced: d.namespaced }
    }
}

impl ResourceKind {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Point-in-time view of one reflector's store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Snapshot {
    pub resource_version: String,
    pub items: Vec<Resource>,
}

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("capability: {0}")]
    Capability(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(m) => Self::NotFound(m),
            Error::InvalidGvk(_) => Self::Validation(e.to_string()),
            Error::Api { code: 401 | 403, message } => Self::Capability(message),
            Error::Api { code: 409, message } => Self::Conflict(message),
            Error::Api { code: 400 | 422, message } => Self::Validation(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Where reflectors and one-shot calls get their data from.
#[async_trait::async_trait]
pub trait Collections: Send + Sync {
    /// List/watch source for one collection scope.
    fn list_watch(&self, desc: &ResourceDescriptor, selector: &Selector) -> Arc<dyn ListWatch>;

    async fn get(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> kreflect_core::Result<Resource>;

    /// Namespace used by namespaced lookups that name none.
    fn default_namespace(&self) -> Option<String> {
        None
    }
}

#[async_trait::async_trait]
impl Collections for ApiClient {
    fn list_watch(&self, desc: &ResourceDescriptor, selector: &Selector) -> Arc<dyn ListWatch> {
        Arc::new(CollectionClient::new(self.clone(), desc.clone(), selector.clone()))
    }

    async fn get(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> kreflect_core::Result<Resource> {
        CollectionClient::new(self.clone(), desc.clone(), Selector::all()).get(namespace, name).await
    }

    fn default_namespace(&self) -> Option<String> {
        Some(ApiClient::default_namespace(self).to_string())
    }
}

/// A running reflector together with the scope it mirrors.
pub struct InformerHandle {
    desc: ResourceDescriptor,
    selector: Selector,
    inner: ReflectorHandle,
}

impl InformerHandle {
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.desc
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    pub fn phase(&self) -> ReflectorPhase {
        self.inner.phase()
    }

    pub fn store(&self) -> Arc<Store> {
        self.inner.store()
    }

    pub async fn wait_synced(&self) -> ApiResult<()> {
        self.inner
            .wait_synced()
            .await
            .map_err(|_| ApiError::Internal(format!("reflector for {} stopped before syncing", self.desc.gvk_key())))
    }
}

/// Observer task started by `on_event`/`on_error`.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Entry point: resolves keys, starts reflectors, runs one-shot reads.
pub struct Informers {
    backend: Arc<dyn Collections>,
    registry: Arc<Registry>,
    config: ReflectorConfig,
}

impl Informers {
    /// Connect using the inferred kube config and `KREFLECT_*` settings.
    pub async fn connect() -> ApiResult<Self> {
        let api = ApiClient::try_default().await.map_err(|e| ApiError::Capability(e.to_string()))?;
        let registry = Arc::new(Registry::new(api.kube_client()));
        Ok(Self::new(Arc::new(api), registry, ReflectorConfig::from_env()))
    }

    pub fn new(backend: Arc<dyn Collections>, registry: Arc<Registry>, config: ReflectorConfig) -> Self {
        Self { backend, registry, config }
    }

    pub fn config(&self) -> &ReflectorConfig {
        &self.config
    }

    pub async fn discover(&self) -> ApiResult<Vec<ResourceKind>> {
        let t0 = Instant::now();
        let kinds: Vec<ResourceKind> = self.registry.resources().await?.into_iter().map(ResourceKind::from).collect();
        info!(kinds = kinds.len(), took_ms = %t0.elapsed().as_millis(), "api: discover ok");
        Ok(kinds)
    }

    pub async fn resolve(&self, gvk_key: &str) -> ApiResult<ResourceDescriptor> {
        Ok(self.registry.resolve(gvk_key).await?)
    }

    /// Namespace to scope `selector` to: cluster-scoped kinds never carry one.
    fn scoped(desc: &ResourceDescriptor, mut selector: Selector) -> Selector {
        if !desc.namespaced {
            selector.namespace = None;
        }
        selector
    }

    /// Start mirroring `gvk_key` within `selector`. Returns immediately; use
    /// [`InformerHandle::wait_synced`] to wait for the first listing.
    pub async fn start_reflector(&self, gvk_key: &str, selector: Selector) -> ApiResult<InformerHandle> {
        let desc = self.resolve(gvk_key).await?;
        let selector = Self::scoped(&desc, selector);
        let lw = self.backend.list_watch(&desc, &selector);
        let inner = Reflector::new(lw, self.config.clone()).spawn();
        info!(gvk = %desc.gvk_key(), ns = ?selector.namespace, "api: start_reflector ok");
        Ok(InformerHandle { desc, selector, inner })
    }

    /// Stop the reflector and wait for its loop to exit.
    pub async fn stop_reflector(&self, handle: InformerHandle) {
        let gvk = handle.desc.gvk_key();
        let t0 = Instant::now();
        handle.inner.stop().await;
        info!(gvk = %gvk, took_ms = %t0.elapsed().as_millis(), "api: stop_reflector ok");
    }

    pub fn current_snapshot(&self, handle: &InformerHandle) -> Snapshot {
        let (resource_version, items) = handle.inner.store().snapshot();
        Snapshot { resource_version, items }
    }

    /// Call `f` for every watch event that changed the store or advanced its cursor, in order.
    /// Stale events the store ignored are not delivered.
    ///
    /// The callback runs on its own task; a slow callback that falls behind the event buffer
    /// misses events (logged) but never blocks the reflector.
    pub fn on_event<F>(&self, handle: &InformerHandle, mut f: F) -> CancelHandle
    where
        F: FnMut(&WatchEvent) + Send + 'static,
    {
        let mut rx = handle.inner.subscribe();
        let gvk = handle.desc.gvk_key();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ReflectorEvent::Event(ev)) => f(&ev),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(gvk = %gvk, skipped, "api: on_event observer lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        CancelHandle { task: Some(task) }
    }

    /// Call `f` for every failure the reflector recovered from.
    pub fn on_error<F>(&self, handle: &InformerHandle, mut f: F) -> CancelHandle
    where
        F: FnMut(FailureKind, &str) + Send + 'static,
    {
        let mut rx = handle.inner.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ReflectorEvent::Error { kind, message }) => f(kind, &message),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
        CancelHandle { task: Some(task) }
    }

    /// One-shot full listing. Errors propagate to the caller.
    pub async fn list(&self, gvk_key: &str, selector: Selector) -> ApiResult<EntityList> {
        let t0 = Instant::now();
        let desc = self.resolve(gvk_key).await?;
        let selector = Self::scoped(&desc, selector);
        let lw = self.backend.list_watch(&desc, &selector);
        let list = list_all(lw.as_ref(), self.config.page_size).await?;
        info!(gvk = %desc.gvk_key(), items = list.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(list)
    }

    pub async fn get(&self, gvk_key: &str, namespace: Option<&str>, name: &str) -> ApiResult<Resource> {
        let desc = self.resolve(gvk_key).await?;
        let fallback = self.backend.default_namespace();
        let ns = match (desc.namespaced, namespace) {
            (false, _) => None,
            (true, Some(ns)) => Some(ns),
            (true, None) => fallback.as_deref(),
        };
        if desc.namespaced && ns.is_none() {
            return Err(ApiError::Validation(format!("namespace required for {}", desc.gvk_key())));
        }
        Ok(self.backend.get(&desc, ns, name).await?)
    }
}
