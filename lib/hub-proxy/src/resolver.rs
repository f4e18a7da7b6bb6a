//! Service lookups for response filters
//!
//! Services are read from the components that cache them; when none has the
//! service it is fetched from a healthy server.

use async_trait::async_trait;
use hub_cache::CacheManager;
use hub_core::context::components;
use hub_core::{RemoteServer, StorageKey};
use hub_filter::ServiceResolver;
use k8s_openapi::api::core::v1::Service;
use std::sync::Arc;
use tracing::debug;

use crate::api_client::ApiClient;
use crate::health_check::HealthChecker;

const SERVICE_CACHERS: &[&str] = &[components::KUBE_PROXY, components::COREDNS, components::KUBELET];

pub struct CachedServiceResolver {
    cache: Option<Arc<CacheManager>>,
    api: Arc<ApiClient>,
    servers: Vec<Arc<RemoteServer>>,
    checker: Arc<dyn HealthChecker>,
}

impl CachedServiceResolver {
    pub fn new(
        cache: Option<Arc<CacheManager>>,
        api: Arc<ApiClient>,
        servers: Vec<Arc<RemoteServer>>,
        checker: Arc<dyn HealthChecker>,
    ) -> Self {
        Self {
            cache,
            api,
            servers,
            checker,
        }
    }

    async fn cached(&self, namespace: &str, name: &str) -> Option<Service> {
        let cache = self.cache.as_ref()?;
        for component in SERVICE_CACHERS {
            let Ok(key) = StorageKey::object(component, "services", Some(namespace), name) else {
                continue;
            };
            if let Ok(obj) = cache.storage().get(&key).await {
                match serde_json::to_value(obj).and_then(serde_json::from_value) {
                    Ok(service) => return Some(service),
                    Err(e) => debug!("Cached service {} is unreadable: {}", key, e),
                }
            }
        }
        None
    }
}

#[async_trait]
impl ServiceResolver for CachedServiceResolver {
    async fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        if let Some(service) = self.cached(namespace, name).await {
            return Some(service);
        }
        let server = self
            .servers
            .iter()
            .find(|s| self.checker.is_healthy(s.address()))?;
        let path = format!("/api/v1/namespaces/{}/services/{}", namespace, name);
        match self.api.get_json::<Service>(server, &path).await {
            Ok(service) => service,
            Err(e) => {
                debug!("Service {}/{} lookup failed: {}", namespace, name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health_check::FakeHealthChecker;
    use crate::transport::TransportManager;
    use hub_cache::{CacheAgents, DiskStore, StorageWrapper};
    use hub_core::identity::StaticCertificateManager;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_service_read_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageWrapper::new(Arc::new(DiskStore::new(dir.path()).await.unwrap())));
        let key = StorageKey::object("coredns", "services", Some("default"), "web").unwrap();
        let svc = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web", "namespace": "default", "annotations": {"edgehub.io/topology-keys": "kubernetes.io/hostname"}},
        }))
        .unwrap();
        storage.update(&key, &svc).await.unwrap();
        let cache = Arc::new(CacheManager::load(storage, Arc::new(CacheAgents::new(&[]))).await.unwrap());

        let transports =
            Arc::new(TransportManager::new(Arc::new(StaticCertificateManager::default()), Duration::from_secs(1)).unwrap());
        let resolver = CachedServiceResolver::new(
            Some(cache),
            Arc::new(ApiClient::new(transports, Duration::from_secs(1))),
            Vec::new(),
            Arc::new(FakeHealthChecker::new(false)),
        );

        let service = resolver.service("default", "web").await.unwrap();
        assert_eq!(
            service.metadata.annotations.unwrap()["edgehub.io/topology-keys"],
            "kubernetes.io/hostname"
        );
        assert!(resolver.service("default", "missing").await.is_none());
    }
}
