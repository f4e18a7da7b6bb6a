//! Garbage collection of cached objects the server no longer has

use async_trait::async_trait;
use hub_core::context::components;
use hub_core::StorageKey;
use kube::core::DynamicObject;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::wrapper::StorageWrapper;
use crate::{Result, StorageError};

/// Server-side existence check for a cached object
#[async_trait]
pub trait ObjectExistence: Send + Sync {
    /// `Ok(false)` only when the server positively reports the object gone
    async fn exists(&self, key: &StorageKey) -> anyhow::Result<bool>;
}

/// Keys under which kubelet caches the given live pods
pub fn pod_keys(pods: &[DynamicObject]) -> HashSet<StorageKey> {
    pods.iter()
        .filter_map(|pod| {
            let name = pod.metadata.name.as_deref()?;
            StorageKey::object(components::KUBELET, "pods", pod.metadata.namespace.as_deref(), name).ok()
        })
        .collect()
}

/// Delete cached pods that are absent from the live pod list
///
/// Skipped entirely when it would delete every cached pod; returns the
/// number of pods deleted.
pub async fn reconcile_pods(storage: &StorageWrapper, live: &HashSet<StorageKey>) -> Result<usize> {
    let root = StorageKey::collection(components::KUBELET, "pods", None)?;
    let local = match storage.list_keys(&root).await {
        Ok(keys) => keys,
        Err(StorageError::NotFound(_)) => return Ok(0),
        Err(e) => return Err(e),
    };

    let stale: Vec<&StorageKey> = local.iter().filter(|key| !live.contains(key)).collect();
    if stale.is_empty() {
        return Ok(0);
    }
    if stale.len() == local.len() {
        warn!(
            "Skipping pod cache reconciliation: all {} cached pods are absent from the live list",
            local.len()
        );
        return Ok(0);
    }

    for key in &stale {
        storage.delete(key).await?;
        debug!("Removed stale cached pod {}", key);
    }
    info!("Removed {} stale pods from the cache", stale.len());
    Ok(stale.len())
}

/// Delete cached events whose object the server no longer has
///
/// Errors from the existence check keep the event.
pub async fn collect_events(storage: &StorageWrapper, probe: &dyn ObjectExistence) -> Result<usize> {
    let mut removed = 0;
    for component in storage.store().components().await? {
        let root = StorageKey::collection(&component, "events", None)?;
        let keys = match storage.list_keys(&root).await {
            Ok(keys) => keys,
            Err(StorageError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        for key in keys {
            match probe.exists(&key).await {
                Ok(true) => {}
                Ok(false) => {
                    storage.delete(&key).await?;
                    removed += 1;
                }
                Err(e) => debug!("Keeping cached event {}: {}", key, e),
            }
        }
    }
    if removed > 0 {
        info!("Garbage collected {} cached events", removed);
    }
    Ok(removed)
}

/// A random period in `[base, 3 * base)`
pub fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor: f64 = rand::thread_rng().gen_range(1.0..3.0);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DiskStore;
    use serde_json::json;
    use std::sync::Arc;

    fn pod(ns: &str, name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": ns},
        }))
        .unwrap()
    }

    async fn storage_with_pods(dir: &tempfile::TempDir, pods: &[DynamicObject]) -> StorageWrapper {
        let storage = StorageWrapper::new(Arc::new(DiskStore::new(dir.path()).await.unwrap()));
        for key in pod_keys(pods) {
            let pod = pods
                .iter()
                .find(|p| p.metadata.name == key.name)
                .unwrap();
            storage.update(&key, pod).await.unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn test_reconcile_removes_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cached = vec![pod("default", "a"), pod("default", "b")];
        let storage = storage_with_pods(&dir, &cached).await;

        let live = pod_keys(&[pod("default", "a"), pod("default", "c")]);
        assert_eq!(reconcile_pods(&storage, &live).await.unwrap(), 1);

        let root = StorageKey::collection("kubelet", "pods", None).unwrap();
        let remaining = storage.list_keys(&root).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_reconcile_skips_total_wipe() {
        let dir = tempfile::tempdir().unwrap();
        let cached = vec![pod("default", "a"), pod("default", "b")];
        let storage = storage_with_pods(&dir, &cached).await;

        let live = pod_keys(&[pod("default", "x")]);
        assert_eq!(reconcile_pods(&storage, &live).await.unwrap(), 0);
        assert_eq!(reconcile_pods(&storage, &HashSet::new()).await.unwrap(), 0);

        let root = StorageKey::collection("kubelet", "pods", None).unwrap();
        assert_eq!(storage.list_keys(&root).await.unwrap().len(), 2);
    }

    struct KnownEvents(HashSet<String>);

    #[async_trait]
    impl ObjectExistence for KnownEvents {
        async fn exists(&self, key: &StorageKey) -> anyhow::Result<bool> {
            match key.name.as_deref() {
                Some("broken") => anyhow::bail!("connection refused"),
                Some(name) => Ok(self.0.contains(name)),
                None => Ok(true),
            }
        }
    }

    #[tokio::test]
    async fn test_collect_events() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageWrapper::new(Arc::new(DiskStore::new(dir.path()).await.unwrap()));
        for name in ["live", "gone", "broken"] {
            let key = StorageKey::object("kubelet", "events", Some("default"), name).unwrap();
            let event: DynamicObject = serde_json::from_value(json!({
                "apiVersion": "v1", "kind": "Event",
                "metadata": {"name": name, "namespace": "default"},
            }))
            .unwrap();
            storage.update(&key, &event).await.unwrap();
        }

        let probe = KnownEvents(["live".to_string()].into_iter().collect());
        assert_eq!(collect_events(&storage, &probe).await.unwrap(), 1);
        let root = StorageKey::collection("kubelet", "events", None).unwrap();
        assert_eq!(storage.list_keys(&root).await.unwrap().len(), 2);
    }

    #[test]
    fn test_jittered_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let period = jittered(base);
            assert!(period >= base && period < base * 3);
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
