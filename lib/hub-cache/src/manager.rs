//! Cache admission, response caching and cache queries

use bytes::Bytes;
use futures::{Stream, StreamExt};
use hub_core::{JsonFrameDecoder, ListSelector, RequestContext, StorageKey, Verb};
use kube::core::{DynamicObject, TypeMeta, WatchEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::agents::CacheAgents;
use crate::wrapper::StorageWrapper;
use crate::{Result, StorageError};

/// Resources whose responses may be persisted
///
/// The built-in kinds edge agents read to keep running pods offline.
pub const CACHEABLE_RESOURCES: &[&str] = &[
    "configmaps",
    "csidrivers",
    "csinodes",
    "endpoints",
    "endpointslices",
    "events",
    "leases",
    "namespaces",
    "nodes",
    "persistentvolumeclaims",
    "persistentvolumes",
    "pods",
    "runtimeclasses",
    "secrets",
    "serviceaccounts",
    "services",
];

/// A list envelope as returned by the API server
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectList {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub items: Vec<DynamicObject>,
}

/// Answer produced from the cache
#[derive(Clone, Debug)]
pub enum CachedReply {
    Object(DynamicObject),
    List(ObjectList),
}

/// Admission and query policy over a [`StorageWrapper`]
pub struct CacheManager {
    storage: Arc<StorageWrapper>,
    agents: Arc<CacheAgents>,
    /// (component, resource) pairs with anything cached
    cached: RwLock<HashSet<(String, String)>>,
    /// Last observed list kind per resource: (apiVersion, kind)
    list_kinds: RwLock<HashMap<String, (String, String)>>,
    /// Selector of the last list that populated each collection root
    list_selectors: RwLock<HashMap<StorageKey, String>>,
}

impl CacheManager {
    /// Build a manager, indexing what is already on disk
    pub async fn load(storage: Arc<StorageWrapper>, agents: Arc<CacheAgents>) -> Result<Self> {
        let mut cached = HashSet::new();
        for component in storage.store().components().await? {
            for resource in storage.store().resources(&component).await? {
                cached.insert((component.clone(), resource));
            }
        }
        info!("Cache index loaded with {} component resources", cached.len());

        Ok(Self {
            storage,
            agents,
            cached: RwLock::new(cached),
            list_kinds: RwLock::new(HashMap::new()),
            list_selectors: RwLock::new(HashMap::new()),
        })
    }

    pub fn storage(&self) -> &Arc<StorageWrapper> {
        &self.storage
    }

    pub fn agents(&self) -> &Arc<CacheAgents> {
        &self.agents
    }

    /// Whether responses to this request are persisted and may be served back
    pub fn can_cache_for(&self, ctx: &RequestContext) -> bool {
        if !ctx.info.is_resource_request
            || !ctx.verb().is_read()
            || ctx.info.subresource.is_some()
            || ctx.component.is_empty()
            || !ctx.is_json()
            || !CACHEABLE_RESOURCES.contains(&ctx.resource())
        {
            return false;
        }
        match ctx.cache_hint {
            Some(hint) => hint,
            None => self.agents.contains(&ctx.component),
        }
    }

    /// Whether any component has cached this resource
    pub fn is_tracked(&self, resource: &str) -> bool {
        self.cached
            .read()
            .map(|cached| cached.iter().any(|(_, r)| r == resource))
            .unwrap_or(false)
    }

    /// Whether anything at all is cached
    pub fn has_cache(&self) -> bool {
        self.cached.read().map(|c| !c.is_empty()).unwrap_or(false)
    }

    /// Persist a response body streamed from upstream
    pub async fn cache_response<S>(&self, ctx: &RequestContext, body: S) -> Result<()>
    where
        S: Stream<Item = Bytes> + Send + Unpin,
    {
        match ctx.verb() {
            Verb::Get => {
                let content = collect(body).await;
                let obj: DynamicObject = serde_json::from_slice(&content)?;
                if is_status(&obj) {
                    return Ok(());
                }
                self.save_object(ctx, &obj).await
            }
            Verb::List => {
                let content = collect(body).await;
                let list: ObjectList = serde_json::from_slice(&content)?;
                self.save_list(ctx, list).await
            }
            Verb::Watch => self.save_watch(ctx, body).await,
            other => Err(StorageError::Unsupported(format!("cannot cache {} responses", other))),
        }
    }

    /// Store one object under the requesting component
    pub async fn save_object(&self, ctx: &RequestContext, obj: &DynamicObject) -> Result<()> {
        let key = StorageKey::for_request(ctx)?;
        let key = match key.name {
            Some(_) => key,
            None => object_key(&ctx.component, ctx.resource(), obj)?,
        };
        match self.storage.update(&key, obj).await {
            Ok(_) | Err(StorageError::Conflict { .. }) => {}
            Err(e) => return Err(e),
        }
        self.track(&ctx.component, ctx.resource());
        Ok(())
    }

    async fn save_list(&self, ctx: &RequestContext, list: ObjectList) -> Result<()> {
        let root = StorageKey::for_request(ctx)?;
        let item_kind = list.kind.strip_suffix("List").unwrap_or(&list.kind).to_string();

        let mut objects = HashMap::with_capacity(list.items.len());
        for mut item in list.items {
            if item.types.is_none() {
                item.types = Some(TypeMeta {
                    api_version: list.api_version.clone(),
                    kind: item_kind.clone(),
                });
            }
            let key = object_key(&ctx.component, ctx.resource(), &item)?;
            objects.insert(key, item);
        }

        if let Ok(mut kinds) = self.list_kinds.write() {
            kinds.insert(ctx.resource().to_string(), (list.api_version.clone(), list.kind.clone()));
        }

        // A list narrowed by a different selector than the one that
        // populated the collection only adds objects.
        let selector = ctx.list_selector.as_ref().map(ToString::to_string).unwrap_or_default();
        let replace = self
            .list_selectors
            .read()
            .map(|s| s.get(&root).map(|last| *last == selector).unwrap_or(true))
            .unwrap_or(true);

        let count = objects.len();
        if replace {
            self.storage.replace(&root, objects).await?;
            if let Ok(mut selectors) = self.list_selectors.write() {
                selectors.insert(root.clone(), selector);
            }
        } else {
            for (key, obj) in &objects {
                match self.storage.update(key, obj).await {
                    Ok(_) | Err(StorageError::Conflict { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.track(&ctx.component, ctx.resource());
        debug!("Cached list {} with {} items", root, count);
        Ok(())
    }

    async fn save_watch<S>(&self, ctx: &RequestContext, mut body: S) -> Result<()>
    where
        S: Stream<Item = Bytes> + Send + Unpin,
    {
        let mut decoder = JsonFrameDecoder::new();
        let mut applied = 0usize;
        while let Some(chunk) = body.next().await {
            for frame in decoder.push(&chunk)? {
                let event: WatchEvent<DynamicObject> = match serde_json::from_slice(&frame) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping undecodable watch event for {}: {}", ctx.resource(), e);
                        continue;
                    }
                };
                match event {
                    WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                        let key = object_key(&ctx.component, ctx.resource(), &obj)?;
                        match self.storage.update(&key, &obj).await {
                            Ok(_) => applied += 1,
                            Err(StorageError::Conflict { .. }) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    WatchEvent::Deleted(obj) => {
                        let key = object_key(&ctx.component, ctx.resource(), &obj)?;
                        self.storage.delete(&key).await?;
                        applied += 1;
                    }
                    WatchEvent::Bookmark(_) => {}
                    WatchEvent::Error(e) => {
                        debug!("Watch of {} ended with error: {}", ctx.resource(), e.message);
                        break;
                    }
                }
            }
        }
        if applied > 0 {
            self.track(&ctx.component, ctx.resource());
        }
        debug!("Cached {} watch events for {}/{}", applied, ctx.component, ctx.resource());
        Ok(())
    }

    /// Answer a read request from the cache
    pub async fn query_cache(&self, ctx: &RequestContext) -> Result<CachedReply> {
        let key = StorageKey::for_request(ctx)?;
        match ctx.verb() {
            Verb::Get => Ok(CachedReply::Object(self.storage.get(&key).await?)),
            Verb::List | Verb::Watch => {
                let items = match self.storage.list(&key).await {
                    Ok(items) => items,
                    Err(StorageError::NotFound(_)) if key.resource != "pods" && self.knows_kind(ctx) => {
                        Vec::new()
                    }
                    Err(e) => return Err(e),
                };
                let items: Vec<DynamicObject> = match &ctx.list_selector {
                    Some(selector) => items.into_iter().filter(|obj| selected(selector, obj)).collect(),
                    None => items,
                };
                let (api_version, kind) = self.list_kind(ctx, &items);
                Ok(CachedReply::List(ObjectList {
                    api_version,
                    kind,
                    metadata: serde_json::Map::new(),
                    items,
                }))
            }
            other => Err(StorageError::Unsupported(format!("cannot serve {} from cache", other))),
        }
    }

    /// Evict a resource kind from every component after the server dropped it
    pub async fn delete_kind_for(&self, ctx: &RequestContext) -> Result<()> {
        let resource = ctx.resource().to_string();
        let components: Vec<String> = self
            .cached
            .read()
            .map(|cached| {
                cached
                    .iter()
                    .filter(|(_, r)| *r == resource)
                    .map(|(c, _)| c.clone())
                    .collect()
            })
            .unwrap_or_default();

        for component in &components {
            let root = StorageKey::collection(component, &resource, None)?;
            self.storage.delete_collection(&root).await?;
            if let Ok(mut selectors) = self.list_selectors.write() {
                selectors.retain(|key, _| !root.contains(key));
            }
        }
        if let Ok(mut cached) = self.cached.write() {
            cached.retain(|(_, r)| *r != resource);
        }
        if let Ok(mut kinds) = self.list_kinds.write() {
            kinds.remove(&resource);
        }
        info!("Evicted resource {} from {} cached components", resource, components.len());
        Ok(())
    }

    /// Apply a new cache-agent list, deleting subtrees of dropped components
    ///
    /// Returns the components whose cache was removed.
    pub async fn apply_agents(&self, value: &str) -> Result<Vec<String>> {
        if !self.agents.apply(value) {
            return Ok(Vec::new());
        }
        let mut removed = Vec::new();
        for component in self.storage.store().components().await? {
            if self.agents.contains(&component) {
                continue;
            }
            let resources = self.storage.store().resources(&component).await?;
            if resources.is_empty() {
                continue;
            }
            self.delete_component(&component, &resources).await?;
            removed.push(component);
        }
        if !removed.is_empty() {
            info!("Removed cache of dropped agents {:?}", removed);
        }
        Ok(removed)
    }

    async fn delete_component(&self, component: &str, resources: &[String]) -> Result<()> {
        for resource in resources {
            let root = StorageKey::collection(component, resource, None)?;
            self.storage.delete_collection(&root).await?;
        }
        if let Ok(mut cached) = self.cached.write() {
            cached.retain(|(c, _)| c != component);
        }
        if let Ok(mut selectors) = self.list_selectors.write() {
            selectors.retain(|key, _| key.component != component);
        }
        Ok(())
    }

    fn track(&self, component: &str, resource: &str) {
        if let Ok(mut cached) = self.cached.write() {
            cached.insert((component.to_string(), resource.to_string()));
        }
    }

    fn knows_kind(&self, ctx: &RequestContext) -> bool {
        builtin_list_kind(ctx.resource()).is_some()
            || self
                .list_kinds
                .read()
                .map(|kinds| kinds.contains_key(ctx.resource()))
                .unwrap_or(false)
    }

    fn list_kind(&self, ctx: &RequestContext, items: &[DynamicObject]) -> (String, String) {
        let group_version = ctx.info.group_version();
        let recorded = self
            .list_kinds
            .read()
            .ok()
            .and_then(|kinds| kinds.get(ctx.resource()).cloned());
        if let Some(recorded) = recorded {
            return recorded;
        }
        if let Some(types) = items.first().and_then(|obj| obj.types.as_ref()) {
            return (types.api_version.clone(), format!("{}List", types.kind));
        }
        match builtin_list_kind(ctx.resource()) {
            Some(kind) => (group_version, kind.to_string()),
            None => (group_version, "List".to_string()),
        }
    }
}

/// Key under which an object of a response is stored
fn object_key(component: &str, resource: &str, obj: &DynamicObject) -> Result<StorageKey> {
    let name = obj
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| StorageError::InvalidKey(format!("{} object without a name", resource)))?;
    let namespace = match resource {
        "namespaces" => None,
        _ => obj.metadata.namespace.as_deref(),
    };
    Ok(StorageKey::object(component, resource, namespace, name)?)
}

fn is_status(obj: &DynamicObject) -> bool {
    obj.types.as_ref().map(|t| t.kind == "Status").unwrap_or(false)
}

async fn collect<S>(mut body: S) -> Vec<u8>
where
    S: Stream<Item = Bytes> + Send + Unpin,
{
    let mut content = Vec::new();
    while let Some(chunk) = body.next().await {
        content.extend_from_slice(&chunk);
    }
    content
}

fn selected(selector: &ListSelector, obj: &DynamicObject) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector.matches(&labels, |path| field_value(obj, path))
}

/// Resolve a field selector path against an object
fn field_value(obj: &DynamicObject, path: &str) -> Option<String> {
    match path {
        "metadata.name" => return obj.metadata.name.clone(),
        "metadata.namespace" => return obj.metadata.namespace.clone(),
        _ => {}
    }
    let mut current = &obj.data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// List kinds of resources edge components commonly cache
fn builtin_list_kind(resource: &str) -> Option<&'static str> {
    Some(match resource {
        "pods" => "PodList",
        "nodes" => "NodeList",
        "services" => "ServiceList",
        "endpoints" => "EndpointsList",
        "endpointslices" => "EndpointSliceList",
        "configmaps" => "ConfigMapList",
        "secrets" => "SecretList",
        "namespaces" => "NamespaceList",
        "leases" => "LeaseList",
        "events" => "EventList",
        "serviceaccounts" => "ServiceAccountList",
        "persistentvolumes" => "PersistentVolumeList",
        "persistentvolumeclaims" => "PersistentVolumeClaimList",
        "runtimeclasses" => "RuntimeClassList",
        "csidrivers" => "CSIDriverList",
        "csinodes" => "CSINodeList",
        "ingresses" => "IngressList",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DiskStore;
    use futures::stream;
    use hub_core::RequestInfo;
    use hyper::Method;

    fn context(method: Method, uri: &str, component: &str) -> RequestContext {
        let uri = uri.parse().unwrap();
        let mut ctx = RequestContext::new(RequestInfo::resolve(&method, &uri));
        ctx.component = component.to_string();
        ctx
    }

    async fn manager(dir: &tempfile::TempDir) -> CacheManager {
        let store = Arc::new(DiskStore::new(dir.path()).await.unwrap());
        CacheManager::load(Arc::new(StorageWrapper::new(store)), Arc::new(CacheAgents::default()))
            .await
            .unwrap()
    }

    fn body(chunks: Vec<&'static str>) -> impl Stream<Item = Bytes> + Send + Unpin {
        stream::iter(chunks.into_iter().map(|s| Bytes::from_static(s.as_bytes())))
    }

    const POD_LIST: &str = r#"{"apiVersion":"v1","kind":"PodList","metadata":{"resourceVersion":"100"},"items":[
        {"metadata":{"name":"web-0","namespace":"default","resourceVersion":"90","labels":{"app":"web"}},"spec":{"nodeName":"node-a"}},
        {"metadata":{"name":"db-0","namespace":"default","resourceVersion":"91","labels":{"app":"db"}},"spec":{"nodeName":"node-a"}}
    ]}"#;

    #[tokio::test]
    async fn test_can_cache_for() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        assert!(manager.can_cache_for(&context(Method::GET, "/api/v1/pods", "kubelet")));
        assert!(!manager.can_cache_for(&context(Method::POST, "/api/v1/namespaces/a/pods", "kubelet")));
        assert!(!manager.can_cache_for(&context(Method::GET, "/api/v1/pods", "kubectl")));
        assert!(!manager.can_cache_for(&context(Method::GET, "/version", "kubelet")));

        let mut ctx = context(Method::GET, "/api/v1/pods", "kubectl");
        ctx.cache_hint = Some(true);
        assert!(manager.can_cache_for(&ctx));

        let mut ctx = context(Method::GET, "/api/v1/pods", "kubelet");
        ctx.content_type = "application/vnd.kubernetes.protobuf".to_string();
        assert!(!manager.can_cache_for(&ctx));
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let widgets = "/apis/example.io/v1/namespaces/default/widgets";

        assert!(!manager.can_cache_for(&context(Method::GET, widgets, "kubelet")));

        // Neither a wildcard agent nor an explicit hint opens other kinds.
        manager.apply_agents("*").await.unwrap();
        assert!(manager.can_cache_for(&context(Method::GET, "/api/v1/secrets", "kubectl")));
        assert!(!manager.can_cache_for(&context(Method::GET, widgets, "kubectl")));

        let mut ctx = context(Method::GET, widgets, "kubelet");
        ctx.cache_hint = Some(true);
        assert!(!manager.can_cache_for(&ctx));
    }

    #[tokio::test]
    async fn test_list_round_trip_with_selector() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let ctx = context(Method::GET, "/api/v1/pods", "kubelet");
        manager.cache_response(&ctx, body(vec![POD_LIST])).await.unwrap();

        let mut query = context(Method::GET, "/api/v1/pods", "kubelet");
        query.list_selector = Some(ListSelector::parse(Some("app=web"), Some("spec.nodeName=node-a")).unwrap());
        match manager.query_cache(&query).await.unwrap() {
            CachedReply::List(list) => {
                assert_eq!(list.kind, "PodList");
                assert_eq!(list.items.len(), 1);
                assert_eq!(list.items[0].metadata.name.as_deref(), Some("web-0"));
                // Item type metadata is filled in from the list.
                assert_eq!(list.items[0].types.as_ref().unwrap().kind, "Pod");
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let get = context(Method::GET, "/api/v1/namespaces/default/pods/db-0", "kubelet");
        assert!(matches!(manager.query_cache(&get).await.unwrap(), CachedReply::Object(_)));
    }

    #[tokio::test]
    async fn test_list_replaces_collection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let ctx = context(Method::GET, "/api/v1/pods", "kubelet");
        manager.cache_response(&ctx, body(vec![POD_LIST])).await.unwrap();
        manager
            .cache_response(
                &ctx,
                body(vec![r#"{"apiVersion":"v1","kind":"PodList","metadata":{},"items":[{"metadata":{"name":"web-0","namespace":"default"}}]}"#]),
            )
            .await
            .unwrap();

        let get = context(Method::GET, "/api/v1/namespaces/default/pods/db-0", "kubelet");
        assert!(manager.query_cache(&get).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watch_events_applied() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let list = context(Method::GET, "/api/v1/pods", "kubelet");
        manager.cache_response(&list, body(vec![POD_LIST])).await.unwrap();

        let watch = context(Method::GET, "/api/v1/pods?watch=true", "kubelet");
        let events = body(vec![
            "{\"type\":\"ADDED\",\"object\":{\"apiVersion\":\"v1\",\"kind\":\"Pod\",\"metadata\":{\"name\":\"new-0\",\"namespace\":\"default\",\"resourceVersion\":\"101\"}}}\n{\"type\":\"DEL",
            "ETED\",\"object\":{\"apiVersion\":\"v1\",\"kind\":\"Pod\",\"metadata\":{\"name\":\"db-0\",\"namespace\":\"default\",\"resourceVersion\":\"102\"}}}\n",
        ]);
        manager.cache_response(&watch, events).await.unwrap();

        let reply = manager.query_cache(&list).await.unwrap();
        let CachedReply::List(list) = reply else {
            panic!("expected a list");
        };
        let mut names: Vec<_> = list.items.iter().filter_map(|o| o.metadata.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["new-0", "web-0"]);
    }

    #[tokio::test]
    async fn test_missing_collections() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let pods = context(Method::GET, "/api/v1/pods", "kubelet");
        assert!(manager.query_cache(&pods).await.unwrap_err().is_not_found());

        let services = context(Method::GET, "/api/v1/services", "kube-proxy");
        match manager.query_cache(&services).await.unwrap() {
            CachedReply::List(list) => {
                assert!(list.items.is_empty());
                assert_eq!(list.kind, "ServiceList");
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let custom = context(Method::GET, "/apis/example.io/v1/widgets", "kubelet");
        assert!(manager.query_cache(&custom).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_kind_for() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        let list = r#"{"apiVersion":"discovery.k8s.io/v1","kind":"EndpointSliceList","metadata":{},"items":[{"metadata":{"name":"w","namespace":"default"}}]}"#;
        for component in ["kubelet", "kube-proxy"] {
            let ctx = context(Method::GET, "/apis/discovery.k8s.io/v1/endpointslices", component);
            manager.cache_response(&ctx, body(vec![list])).await.unwrap();
        }
        assert!(manager.is_tracked("endpointslices"));

        let ctx = context(Method::GET, "/apis/discovery.k8s.io/v1/endpointslices", "kubelet");
        manager.delete_kind_for(&ctx).await.unwrap();
        assert!(!manager.is_tracked("endpointslices"));
        assert!(manager.query_cache(&ctx).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_apply_agents_removes_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        manager.apply_agents("nginx").await.unwrap();

        let ctx = context(Method::GET, "/api/v1/namespaces/default/configmaps/cfg", "nginx");
        let cm = r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"cfg","namespace":"default"}}"#;
        manager.cache_response(&ctx, body(vec![cm])).await.unwrap();
        assert!(manager.query_cache(&ctx).await.is_ok());

        let removed = manager.apply_agents("").await.unwrap();
        assert_eq!(removed, vec!["nginx".to_string()]);
        assert!(manager.query_cache(&ctx).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_field_value() {
        let obj: DynamicObject = serde_json::from_str(
            r#"{"metadata":{"name":"a"},"spec":{"nodeName":"node-a","replicas":2}}"#,
        )
        .unwrap();
        assert_eq!(field_value(&obj, "metadata.name").as_deref(), Some("a"));
        assert_eq!(field_value(&obj, "spec.nodeName").as_deref(), Some("node-a"));
        assert_eq!(field_value(&obj, "spec.replicas").as_deref(), Some("2"));
        assert_eq!(field_value(&obj, "status.phase"), None);
    }
}
