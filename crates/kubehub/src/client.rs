//! Raw HTTP plumbing on top of `kube::Client`: URL shaping, listing, verbs and watch opening.

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use tracing::{debug, info};
use url::form_urlencoded;

use kreflect_core::{EntityList, Error, Resource, ResourceDescriptor, Result, Selector};

use crate::watch::WatchConnection;

/// Query parameters of a collection listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

impl ListParams {
    pub fn from_selector(selector: &Selector) -> Self {
        Self {
            label_selector: selector.label_selector.clone(),
            field_selector: selector.effective_field_selector(),
            ..Self::default()
        }
    }

    pub fn query(&self) -> String {
        let mut q = form_urlencoded::Serializer::new(String::new());
        if let Some(l) = self.label_selector.as_deref().filter(|s| !s.is_empty()) {
            q.append_pair("labelSelector", l);
        }
        if let Some(f) = self.field_selector.as_deref().filter(|s| !s.is_empty()) {
            q.append_pair("fieldSelector", f);
        }
        if let Some(limit) = self.limit.filter(|l| *l > 0) {
            q.append_pair("limit", &limit.to_string());
        }
        if let Some(c) = self.continue_token.as_deref() {
            q.append_pair("continue", c);
        }
        q.finish()
    }
}

/// Query parameters of a watch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchParams {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub resource_version: Option<String>,
    pub allow_bookmarks: bool,
    /// Server side watch duration (`timeoutSeconds`); unset lets the server pick.
    pub timeout_secs: Option<u32>,
}

impl Default for WatchParams {
    fn default() -> Self {
        Self { label_selector: None, field_selector: None, resource_version: None, allow_bookmarks: true, timeout_secs: None }
    }
}

impl WatchParams {
    /// Watch params for a selector. A single-name scope is addressed by path, not by field selector.
    pub fn from_selector(selector: &Selector) -> Self {
        Self {
            label_selector: selector.label_selector.clone(),
            field_selector: selector.field_selector.clone(),
            ..Self::default()
        }
    }

    pub fn at(mut self, resource_version: &str) -> Self {
        self.resource_version = Some(resource_version.to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn query(&self) -> String {
        let mut q = form_urlencoded::Serializer::new(String::new());
        if let Some(l) = self.label_selector.as_deref().filter(|s| !s.is_empty()) {
            q.append_pair("labelSelector", l);
        }
        if let Some(f) = self.field_selector.as_deref().filter(|s| !s.is_empty()) {
            q.append_pair("fieldSelector", f);
        }
        if let Some(rv) = self.resource_version.as_deref() {
            q.append_pair("resourceVersion", rv);
        }
        if self.allow_bookmarks {
            q.append_pair("allowWatchBookmarks", "true");
        }
        if let Some(t) = self.timeout_secs {
            q.append_pair("timeoutSeconds", &t.to_string());
        }
        q.finish()
    }
}

/// `<prefix>/[namespaces/<ns>/]<plural>`
pub fn collection_path(desc: &ResourceDescriptor, namespace: Option<&str>) -> String {
    match namespace.filter(|_| desc.namespaced) {
        Some(ns) => format!("{}/namespaces/{}/{}", desc.api_prefix(), ns, desc.plural),
        None => format!("{}/{}", desc.api_prefix(), desc.plural),
    }
}

pub fn object_path(desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", collection_path(desc, namespace), name)
}

/// `<prefix>/watch/[namespaces/<ns>/]<plural>[/<name>]`
pub fn watch_path(desc: &ResourceDescriptor, namespace: Option<&str>, name: Option<&str>) -> String {
    let mut path = format!("{}/watch", desc.api_prefix());
    if let Some(ns) = namespace.filter(|_| desc.namespaced) {
        path.push_str("/namespaces/");
        path.push_str(ns);
    }
    path.push('/');
    path.push_str(&desc.plural);
    if let Some(name) = name {
        path.push('/');
        path.push_str(name);
    }
    path
}

fn with_query(path: String, query: String) -> String {
    if query.is_empty() { path } else { format!("{}?{}", path, query) }
}

/// Cluster client. Ordinary requests honour the configured read timeout; watches use a twin
/// client built from the same config with no read deadline so they may block on the next chunk
/// indefinitely.
#[derive(Clone)]
pub struct ApiClient {
    client: kube::Client,
    watch_client: kube::Client,
}

impl ApiClient {
    /// Infer cluster config (kubeconfig or in-cluster) the way kubectl does.
    pub async fn try_default() -> Result<Self> {
        let config = kube::Config::infer().await.map_err(|e| Error::Connection(e.to_string()))?;
        Self::from_config(config)
    }

    pub fn from_config(config: kube::Config) -> Result<Self> {
        let mut watch_config = config.clone();
        watch_config.read_timeout = None;
        let client = kube::Client::try_from(config).map_err(|e| Error::Connection(e.to_string()))?;
        let watch_client = kube::Client::try_from(watch_config).map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self { client, watch_client })
    }

    pub fn kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    async fn send(&self, client: &kube::Client, req: Request<Vec<u8>>) -> Result<Response<Body>> {
        client.send(req.map(Body::from)).await.map_err(|e| Error::Connection(e.to_string()))
    }

    /// Issue a request and decode the JSON body, mapping non-2xx statuses into the taxonomy.
    async fn request_json(&self, req: Request<Vec<u8>>) -> Result<serde_json::Value> {
        let res = self.send(&self.client, req).await?;
        let status = res.status();
        let body = collect(res.into_body()).await?;
        if !status.is_success() {
            return Err(Error::from_status(status.as_u16(), &body));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// One page of a collection listing.
    pub async fn list_page(&self, desc: &ResourceDescriptor, namespace: Option<&str>, params: &ListParams) -> Result<EntityList> {
        let uri = with_query(collection_path(desc, namespace), params.query());
        debug!(uri = %uri, "list page");
        let value = self.request_json(build(Method::GET, &uri, None)?).await.map_err(|e| match e {
            Error::Connection(m) => Error::Listing(m),
            Error::Api { code, message } => Error::Listing(format!("status {}: {}", code, message)),
            other => other,
        })?;
        EntityList::from_json(value)
    }

    pub async fn get(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<Resource> {
        let uri = object_path(desc, namespace, name);
        self.request_json(build(Method::GET, &uri, None)?).await.map(Resource::new)
    }

    pub async fn create(&self, desc: &ResourceDescriptor, namespace: Option<&str>, obj: &serde_json::Value) -> Result<Resource> {
        let uri = collection_path(desc, namespace);
        let body = serde_json::to_vec(obj)?;
        let res = self.request_json(build(Method::POST, &uri, Some((body, "application/json")))?).await?;
        info!(gvk = %desc.gvk_key(), ns = ?namespace, "created");
        Ok(Resource::new(res))
    }

    /// Full replace (PUT) of an existing object.
    pub async fn update(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str, obj: &serde_json::Value) -> Result<Resource> {
        let uri = object_path(desc, namespace, name);
        let body = serde_json::to_vec(obj)?;
        self.request_json(build(Method::PUT, &uri, Some((body, "application/json")))?).await.map(Resource::new)
    }

    /// JSON merge patch.
    pub async fn patch(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str, patch: &serde_json::Value) -> Result<Resource> {
        let uri = object_path(desc, namespace, name);
        let body = serde_json::to_vec(patch)?;
        self.request_json(build(Method::PATCH, &uri, Some((body, "application/merge-patch+json")))?)
            .await
            .map(Resource::new)
    }

    /// Returns the deleted object or the server's `Status`, whichever the server sent.
    pub async fn delete(&self, desc: &ResourceDescriptor, namespace: Option<&str>, name: &str) -> Result<Resource> {
        let uri = object_path(desc, namespace, name);
        let res = self.request_json(build(Method::DELETE, &uri, None)?).await?;
        info!(gvk = %desc.gvk_key(), ns = ?namespace, name = %name, "deleted");
        Ok(Resource::new(res))
    }

    /// Open a streamed watch. Any non-2xx answer fails the open; 410 maps to `SnapshotExpired`.
    pub async fn open_watch(
        &self,
        desc: &ResourceDescriptor,
        namespace: Option<&str>,
        name: Option<&str>,
        params: &WatchParams,
    ) -> Result<WatchConnection> {
        let uri = with_query(watch_path(desc, namespace, name), params.query());
        let res = self.send(&self.watch_client, build(Method::GET, &uri, None)?).await?;
        let status = res.status();
        if !status.is_success() {
            let body = collect(res.into_body()).await.unwrap_or_default();
            return Err(Error::from_status(status.as_u16(), &body));
        }
        debug!(uri = %uri, "watch opened");
        let body = res
            .into_body()
            .into_data_stream()
            .map_err(|e| Error::Connection(e.to_string()))
            .boxed();
        Ok(WatchConnection::new(uri, body))
    }
}

fn build(method: Method, uri: &str, body: Option<(Vec<u8>, &str)>) -> Result<Request<Vec<u8>>> {
    let mut req = Request::builder().method(method).uri(uri).header(http::header::ACCEPT, "application/json");
    let payload = match body {
        Some((bytes, content_type)) => {
            req = req.header(http::header::CONTENT_TYPE, content_type);
            bytes
        }
        None => Vec::new(),
    };
    req.body(payload).map_err(|e| Error::Connection(format!("building request for {}: {}", uri, e)))
}

async fn collect(body: Body) -> Result<Bytes> {
    body.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| Error::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ResourceDescriptor {
        ResourceDescriptor::new("", "v1", "Pod", "pods", true)
    }

    fn nodes() -> ResourceDescriptor {
        ResourceDescriptor::new("", "v1", "Node", "nodes", false)
    }

    #[test]
    fn collection_paths_respect_scope() {
        assert_eq!(collection_path(&pods(), Some("default")), "/api/v1/namespaces/default/pods");
        assert_eq!(collection_path(&pods(), None), "/api/v1/pods");
        assert_eq!(collection_path(&nodes(), Some("ignored")), "/api/v1/nodes");
        let deploy = ResourceDescriptor::new("apps", "v1", "Deployment", "deployments", true);
        assert_eq!(object_path(&deploy, Some("prod"), "web"), "/apis/apps/v1/namespaces/prod/deployments/web");
    }

    #[test]
    fn watch_paths_use_watch_prefix() {
        assert_eq!(watch_path(&pods(), Some("default"), None), "/api/v1/watch/namespaces/default/pods");
        assert_eq!(watch_path(&pods(), Some("default"), Some("x")), "/api/v1/watch/namespaces/default/pods/x");
        assert_eq!(watch_path(&nodes(), None, None), "/api/v1/watch/nodes");
    }

    #[test]
    fn watch_query_encodes_selectors_and_cursor() {
        let sel = Selector::all().labels("app=web,tier in (a,b)");
        let q = WatchParams::from_selector(&sel).at("100").query();
        assert_eq!(q, "labelSelector=app%3Dweb%2Ctier+in+%28a%2Cb%29&resourceVersion=100&allowWatchBookmarks=true");
        let bare = WatchParams { allow_bookmarks: false, ..WatchParams::default() }.at("");
        assert_eq!(bare.query(), "");
    }

    #[test]
    fn list_query_carries_limit_and_continue() {
        let p = ListParams { limit: Some(50), continue_token: Some("abc".into()), ..ListParams::from_selector(&Selector::all().name("x")) };
        assert_eq!(p.query(), "fieldSelector=metadata.name%3Dx&limit=50&continue=abc");
    }
}
