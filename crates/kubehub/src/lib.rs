//! kreflect kubehub: discovery, paginated listing and streamed watches against the API server.

#![forbid(unsafe_code)]

use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use kreflect_core::{EntityList, Error, Resource, ResourceDescriptor, Result, Selector};

mod client;
mod decoder;
mod discovery;
mod stream;
mod watch;

pub use client::{collection_path, object_path, watch_path, ApiClient, ListParams, WatchParams};
pub use decoder::{EventDecoder, DEFAULT_MAX_LINE_BYTES};
pub use discovery::{Registry, ResourceTable};
pub use stream::WatchStream;
pub use watch::{ByteStream, WatchCancel, WatchConnection};

/// Per-watch request options that are not part of the collection scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub allow_bookmarks: bool,
    pub timeout_secs: Option<u32>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { allow_bookmarks: true, timeout_secs: None }
    }
}

/// The two calls a reflector needs from the server for one collection.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync {
    /// One page of the collection; `continue_token` resumes a paged listing.
    async fn list_page(&self, limit: Option<u32>, continue_token: Option<&str>) -> Result<EntityList>;

    /// Open a watch starting after `resource_version`.
    async fn watch(&self, resource_version: &str, opts: WatchOptions) -> Result<WatchConnection>;

    /// Label for logs.
    fn describe(&self) -> String {
        String::from("collection")
    }
}

/// Full listing following `continue` tokens.
///
/// Items of all pages are concatenated; the cursor is the first page's resource version, which
/// is the snapshot the whole paged listing is consistent with. If a continue token expires (410)
/// the listing restarts once from the beginning.
pub async fn list_all(lw: &dyn ListWatch, page_size: Option<u32>) -> Result<EntityList> {
    let t0 = Instant::now();
    let limit = page_size.filter(|l| *l > 0);
    let mut restarted = false;
    'listing: loop {
        let mut out = lw.list_page(limit, None).await?;
        let mut pages = 1usize;
        while let Some(token) = out.continue_token.take() {
            match lw.list_page(limit, Some(&token)).await {
                Ok(page) => {
                    pages += 1;
                    out.items.extend(page.items);
                    out.continue_token = page.continue_token;
                }
                Err(e) if e.is_expired() && !restarted => {
                    warn!(collection = %lw.describe(), error = %e, "continue token expired; restarting listing");
                    restarted = true;
                    continue 'listing;
                }
                Err(e) if e.is_expired() => return Err(Error::Listing(e.to_string())),
                Err(e) => return Err(e),
            }
        }
        histogram!("kreflect_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(collection = %lw.describe(), pages, items = out.items.len(), rv = %out.resource_version, "listing complete");
        return Ok(out);
    }
}

/// Verb set bound to one resolved collection and selector.
#[derive(Clone)]
pub struct CollectionClient {
    api: ApiClient,
    desc: ResourceDescriptor,
    selector: Selector,
}

impl CollectionClient {
    pub fn new(api: ApiClient, desc: ResourceDescriptor, selector: Selector) -> Self {
        Self { api, desc, selector }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.desc
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    fn ns(&self) -> Option<&str> {
        self.selector.namespace.as_deref()
    }

    /// Namespace for single-object verbs: explicit argument, else the selector's.
    fn object_ns<'a>(&'a self, namespace: Option<&'a str>) -> Result<Option<&'a str>> {
        match (self.desc.namespaced, namespace.or(self.ns())) {
            (true, None) => Err(Error::Api { code: 400, message: format!("namespace required for {}", self.desc.gvk_key()) }),
            (true, ns) => Ok(ns),
            (false, _) => Ok(None),
        }
    }

    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Resource> {
        let ns = self.object_ns(namespace)?;
        self.api.get(&self.desc, ns, name).await
    }

    /// One-shot full listing of the selector's scope.
    pub async fn list(&self, page_size: Option<u32>) -> Result<EntityList> {
        list_all(self, page_size).await
    }

    pub async fn create(&self, obj: &serde_json::Value) -> Result<Resource> {
        let embedded = obj.pointer("/metadata/namespace").and_then(|v| v.as_str());
        let ns = self.object_ns(embedded)?;
        self.api.create(&self.desc, ns, obj).await
    }

    pub async fn update(&self, namespace: Option<&str>, name: &str, obj: &serde_json::Value) -> Result<Resource> {
        let ns = self.object_ns(namespace)?;
        self.api.update(&self.desc, ns, name, obj).await
    }

    pub async fn patch(&self, namespace: Option<&str>, name: &str, patch: &serde_json::Value) -> Result<Resource> {
        let ns = self.object_ns(namespace)?;
        self.api.patch(&self.desc, ns, name, patch).await
    }

    pub async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<Resource> {
        let ns = self.object_ns(namespace)?;
        self.api.delete(&self.desc, ns, name).await
    }

    /// Raw watch stream from `resource_version` for callers iterating events themselves.
    pub async fn watch_stream(&self, resource_version: &str, opts: WatchOptions, decoder: EventDecoder) -> Result<WatchStream> {
        let conn = ListWatch::watch(self, resource_version, opts).await?;
        Ok(WatchStream::new(conn, decoder))
    }
}

#[async_trait::async_trait]
impl ListWatch for CollectionClient {
    async fn list_page(&self, limit: Option<u32>, continue_token: Option<&str>) -> Result<EntityList> {
        let params = ListParams {
            limit,
            continue_token: continue_token.map(str::to_string),
            ..ListParams::from_selector(&self.selector)
        };
        self.api.list_page(&self.desc, self.ns(), &params).await
    }

    async fn watch(&self, resource_version: &str, opts: WatchOptions) -> Result<WatchConnection> {
        let params = WatchParams {
            allow_bookmarks: opts.allow_bookmarks,
            timeout_secs: opts.timeout_secs,
            ..WatchParams::from_selector(&self.selector)
        }
        .at(resource_version);
        counter!("kreflect_watch_opens_total", 1);
        let conn = self.api.open_watch(&self.desc, self.ns(), self.selector.name.as_deref(), &params).await?;
        info!(gvk = %self.desc.gvk_key(), ns = ?self.ns(), rv = %resource_version, "watch established");
        Ok(conn)
    }

    fn describe(&self) -> String {
        match self.ns() {
            Some(ns) => format!("{} ns={}", self.desc.gvk_key(), ns),
            None => self.desc.gvk_key(),
        }
    }
}
