//! Object-level view over a byte [`Store`]
//!
//! Serializes Kubernetes objects as JSON, guards updates against stale
//! resource versions and keeps hot, frequently re-read kinds in memory.

use bytes::Bytes;
use hub_core::StorageKey;
use kube::core::DynamicObject;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::store::Store;
use crate::{Result, StorageError};

/// Resources served from memory after the first read
const IN_MEMORY_RESOURCES: &[&str] = &["nodes", "leases"];

const MEMORY_CAPACITY: usize = 1024;

pub struct StorageWrapper {
    store: Arc<dyn Store>,
    memory: Mutex<LruCache<StorageKey, DynamicObject>>,
}

impl StorageWrapper {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let capacity = NonZeroUsize::new(MEMORY_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            memory: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn create(&self, key: &StorageKey, obj: &DynamicObject) -> Result<()> {
        self.store.create(key, encode(obj)?).await?;
        self.remember(key, obj);
        Ok(())
    }

    pub async fn get(&self, key: &StorageKey) -> Result<DynamicObject> {
        if let Some(obj) = self.recall(key) {
            return Ok(obj);
        }
        let obj = decode(&self.store.get(key).await?)?;
        self.remember(key, &obj);
        Ok(obj)
    }

    /// Objects below a root
    ///
    /// An empty pod collection is reported as `NotFound`: an edge node
    /// always runs at least its static pods, so an empty pod list can only
    /// come from a wiped or corrupted cache and must not be served.
    pub async fn list(&self, root: &StorageKey) -> Result<Vec<DynamicObject>> {
        let entries = self.store.list(root).await?;
        if entries.is_empty() && root.resource == "pods" {
            return Err(StorageError::NotFound(root.to_string()));
        }
        entries.iter().map(|(_, content)| decode(content)).collect()
    }

    pub async fn list_keys(&self, root: &StorageKey) -> Result<Vec<StorageKey>> {
        self.store.list_keys(root).await
    }

    /// Write an object unless the stored copy is newer
    ///
    /// Returns the object now in storage.
    pub async fn update(&self, key: &StorageKey, obj: &DynamicObject) -> Result<DynamicObject> {
        match self.get(key).await {
            Ok(stored) => {
                if is_older(obj, &stored) {
                    return Err(StorageError::Conflict {
                        key: key.to_string(),
                        stored: resource_version(&stored).unwrap_or_default().to_string(),
                        incoming: resource_version(obj).unwrap_or_default().to_string(),
                    });
                }
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.store.update(key, encode(obj)?).await?;
        self.remember(key, obj);
        Ok(obj.clone())
    }

    pub async fn replace(&self, root: &StorageKey, objects: HashMap<StorageKey, DynamicObject>) -> Result<()> {
        let mut contents = HashMap::with_capacity(objects.len());
        for (key, obj) in &objects {
            contents.insert(key.clone(), encode(obj)?);
        }
        self.store.replace(root, contents).await?;

        self.forget_below(root);
        for (key, obj) in &objects {
            self.remember(key, obj);
        }
        Ok(())
    }

    pub async fn delete(&self, key: &StorageKey) -> Result<()> {
        self.store.delete(key).await?;
        if let Ok(mut memory) = self.memory.lock() {
            memory.pop(key);
        }
        Ok(())
    }

    pub async fn delete_collection(&self, root: &StorageKey) -> Result<()> {
        self.store.delete_collection(root).await?;
        self.forget_below(root);
        debug!("Deleted cached collection {}", root);
        Ok(())
    }

    fn recall(&self, key: &StorageKey) -> Option<DynamicObject> {
        if !IN_MEMORY_RESOURCES.contains(&key.resource.as_str()) {
            return None;
        }
        self.memory.lock().ok()?.get(key).cloned()
    }

    fn remember(&self, key: &StorageKey, obj: &DynamicObject) {
        if !IN_MEMORY_RESOURCES.contains(&key.resource.as_str()) {
            return;
        }
        if let Ok(mut memory) = self.memory.lock() {
            memory.put(key.clone(), obj.clone());
        }
    }

    fn forget_below(&self, root: &StorageKey) {
        if let Ok(mut memory) = self.memory.lock() {
            let stale: Vec<StorageKey> = memory
                .iter()
                .filter(|(key, _)| root.contains(key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                memory.pop(&key);
            }
        }
    }
}

pub(crate) fn encode(obj: &DynamicObject) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(obj)?))
}

pub(crate) fn decode(content: &[u8]) -> Result<DynamicObject> {
    Ok(serde_json::from_slice(content)?)
}

fn resource_version(obj: &DynamicObject) -> Option<&str> {
    obj.metadata.resource_version.as_deref()
}

/// Whether `incoming` carries a strictly older resource version
///
/// Resource versions are compared numerically when both parse; opaque
/// versions are never treated as older.
fn is_older(incoming: &DynamicObject, stored: &DynamicObject) -> bool {
    match (
        resource_version(incoming).and_then(|rv| rv.parse::<u64>().ok()),
        resource_version(stored).and_then(|rv| rv.parse::<u64>().ok()),
    ) {
        (Some(incoming), Some(stored)) => incoming < stored,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DiskStore;
    use serde_json::json;

    fn object(kind: &str, ns: Option<&str>, name: &str, rv: &str) -> DynamicObject {
        let mut metadata = json!({"name": name, "resourceVersion": rv});
        if let Some(ns) = ns {
            metadata["namespace"] = json!(ns);
        }
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": metadata,
        }))
        .unwrap()
    }

    async fn wrapper(dir: &tempfile::TempDir) -> StorageWrapper {
        StorageWrapper::new(Arc::new(DiskStore::new(dir.path()).await.unwrap()))
    }

    #[tokio::test]
    async fn test_object_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = wrapper(&dir).await;
        let key = StorageKey::object("kubelet", "configmaps", Some("kube-system"), "coredns").unwrap();
        let created = object("ConfigMap", Some("kube-system"), "coredns", "5");

        storage.create(&key, &created).await.unwrap();
        assert!(matches!(storage.create(&key, &created).await, Err(StorageError::KeyExists(_))));
        let stored = storage.get(&key).await.unwrap();
        assert_eq!(serde_json::to_value(&stored).unwrap(), serde_json::to_value(&created).unwrap());

        let updated = object("ConfigMap", Some("kube-system"), "coredns", "6");
        storage.update(&key, &updated).await.unwrap();
        // A fresh wrapper reads through to disk.
        let reopened = wrapper(&dir).await;
        let stored = reopened.get(&key).await.unwrap();
        assert_eq!(stored.metadata.resource_version.as_deref(), Some("6"));

        reopened.delete(&key).await.unwrap();
        assert!(reopened.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_rejects_older_version() {
        let dir = tempfile::tempdir().unwrap();
        let storage = wrapper(&dir).await;
        let key = StorageKey::object("kubelet", "pods", Some("default"), "web-0").unwrap();

        storage.update(&key, &object("Pod", Some("default"), "web-0", "10")).await.unwrap();
        let err = storage
            .update(&key, &object("Pod", Some("default"), "web-0", "9"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        storage.update(&key, &object("Pod", Some("default"), "web-0", "11")).await.unwrap();
        let stored = storage.get(&key).await.unwrap();
        assert_eq!(stored.metadata.resource_version.as_deref(), Some("11"));
    }

    #[tokio::test]
    async fn test_empty_pod_list_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = wrapper(&dir).await;
        let pods = StorageKey::collection("kubelet", "pods", None).unwrap();
        std::fs::create_dir_all(dir.path().join("kubelet/pods")).unwrap();
        assert!(storage.list(&pods).await.unwrap_err().is_not_found());

        let services = StorageKey::collection("kubelet", "services", None).unwrap();
        std::fs::create_dir_all(dir.path().join("kubelet/services")).unwrap();
        assert!(storage.list(&services).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_cache_tracks_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = wrapper(&dir).await;
        let key = StorageKey::object("kubelet", "nodes", None, "node-a").unwrap();

        storage.update(&key, &object("Node", None, "node-a", "1")).await.unwrap();
        // Served from memory even after the file is gone behind our back.
        std::fs::remove_file(dir.path().join("kubelet/nodes/node-a")).unwrap();
        assert!(storage.get(&key).await.is_ok());

        storage.delete(&key).await.unwrap();
        assert!(storage.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_collection_clears_memory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = wrapper(&dir).await;
        let key = StorageKey::object("kubelet", "leases", Some("kube-node-lease"), "node-a").unwrap();
        storage.update(&key, &object("Lease", Some("kube-node-lease"), "node-a", "1")).await.unwrap();

        storage
            .delete_collection(&StorageKey::collection("kubelet", "leases", None).unwrap())
            .await
            .unwrap();
        assert!(storage.get(&key).await.unwrap_err().is_not_found());
    }
}
