//! Minimal control-plane client used by the hub's own background work
//!
//! Requests go through the certificate transport so they share connection
//! tracking and rotation with proxied traffic.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hub_cache::gc::ObjectExistence;
use hub_core::{RemoteServer, StorageKey, HUB_COMPONENT};
use hyper::header::{HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::load_balancer::HealthGate;
use crate::responses::{empty, full};
use crate::transport::TransportManager;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Object not found")]
    NotFound,

    #[error("Conflicting update")]
    Conflict,

    #[error("Unexpected status {0}")]
    Status(u16),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl ApiError {
    /// Failures worth retrying after a backoff
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(serde::Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<DynamicObject>,
}

pub struct ApiClient {
    transports: Arc<TransportManager>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(transports: Arc<TransportManager>, timeout: Duration) -> Self {
        Self { transports, timeout }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            transports: self.transports.clone(),
            timeout,
        }
    }

    /// One request; non-2xx statuses become errors
    pub async fn send(
        &self,
        server: &RemoteServer,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ApiResult<Bytes> {
        let uri = server.join(path).map_err(|e| ApiError::Transport(e.to_string()))?;
        let has_body = body.is_some();
        let mut req = Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(body.map(full).unwrap_or_else(empty))
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let headers = req.headers_mut();
        headers.insert(USER_AGENT, HeaderValue::from_static(HUB_COMPONENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if has_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let client = self.transports.cert_client();
        let exchange = async {
            let response = client
                .request(req)
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, ApiError>((status, body))
        };
        let (status, body) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ApiError::Transport(format!("{} {} timed out", method, path)))??;

        debug!("{} {}{} -> {}", method, server.address(), path, status.as_u16());
        match status {
            s if s.is_success() => Ok(body),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            StatusCode::CONFLICT => Err(ApiError::Conflict),
            s => Err(ApiError::Status(s.as_u16())),
        }
    }

    /// GET and decode; a missing object is `None`
    pub async fn get_json<T: DeserializeOwned>(&self, server: &RemoteServer, path: &str) -> ApiResult<Option<T>> {
        match self.send(server, Method::GET, path, None).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(ApiError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write_json<T: Serialize, R: DeserializeOwned>(
        &self,
        server: &RemoteServer,
        method: Method,
        path: &str,
        value: &T,
    ) -> ApiResult<R> {
        let body = serde_json::to_vec(value)?;
        let reply = self.send(server, method, path, Some(body)).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Pods bound to a node
    pub async fn node_pods(&self, server: &RemoteServer, node: &str) -> ApiResult<Vec<DynamicObject>> {
        let path = format!("/api/v1/pods?fieldSelector=spec.nodeName%3D{}", node);
        let list: Option<PodList> = self.get_json(server, &path).await?;
        Ok(list.map(|l| l.items).unwrap_or_default())
    }

    pub async fn config_map(&self, server: &RemoteServer, namespace: &str, name: &str) -> ApiResult<Option<ConfigMap>> {
        self.get_json(server, &format!("/api/v1/namespaces/{}/configmaps/{}", namespace, name))
            .await
    }
}

fn lease_path(namespace: &str, name: Option<&str>) -> String {
    let base = format!("/apis/coordination.k8s.io/v1/namespaces/{}/leases", namespace);
    match name {
        Some(name) => format!("{}/{}", base, name),
        None => base,
    }
}

/// Node lease operations used by the health checker
#[async_trait]
pub trait LeaseClient: Send + Sync {
    async fn get(&self, server: &RemoteServer, namespace: &str, name: &str) -> ApiResult<Option<Lease>>;
    async fn create(&self, server: &RemoteServer, lease: &Lease) -> ApiResult<Lease>;
    async fn update(&self, server: &RemoteServer, lease: &Lease) -> ApiResult<Lease>;
}

#[async_trait]
impl LeaseClient for ApiClient {
    async fn get(&self, server: &RemoteServer, namespace: &str, name: &str) -> ApiResult<Option<Lease>> {
        self.get_json(server, &lease_path(namespace, Some(name))).await
    }

    async fn create(&self, server: &RemoteServer, lease: &Lease) -> ApiResult<Lease> {
        let namespace = lease.metadata.namespace.as_deref().unwrap_or_default();
        self.write_json(server, Method::POST, &lease_path(namespace, None), lease)
            .await
    }

    async fn update(&self, server: &RemoteServer, lease: &Lease) -> ApiResult<Lease> {
        let namespace = lease.metadata.namespace.as_deref().unwrap_or_default();
        let name = lease.metadata.name.as_deref().unwrap_or_default();
        self.write_json(server, Method::PUT, &lease_path(namespace, Some(name)), lease)
            .await
    }
}

/// Existence of cached events, checked against a healthy server
pub struct RemoteObjectExistence {
    api: Arc<ApiClient>,
    gate: Arc<dyn HealthGate>,
}

impl RemoteObjectExistence {
    pub fn new(api: Arc<ApiClient>, gate: Arc<dyn HealthGate>) -> Self {
        Self { api, gate }
    }
}

#[async_trait]
impl ObjectExistence for RemoteObjectExistence {
    async fn exists(&self, key: &StorageKey) -> anyhow::Result<bool> {
        let server = self
            .gate
            .healthy_server()
            .ok_or_else(|| anyhow::anyhow!("no healthy server"))?;
        let (Some(namespace), Some(name)) = (&key.namespace, &key.name) else {
            anyhow::bail!("{} is not a namespaced object", key);
        };
        let path = format!("/api/v1/namespaces/{}/{}/{}", namespace, key.resource, name);
        match self.api.send(&server, Method::GET, &path, None).await {
            Ok(_) => Ok(true),
            Err(ApiError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Transport("reset".into()).is_transient());
        assert!(ApiError::Status(503).is_transient());
        assert!(ApiError::Status(429).is_transient());
        assert!(!ApiError::Status(403).is_transient());
        assert!(!ApiError::Conflict.is_transient());
        assert!(!ApiError::NotFound.is_transient());
        assert!(!ApiError::Cancelled.is_transient());
    }

    #[test]
    fn test_lease_paths() {
        assert_eq!(
            lease_path("kube-node-lease", Some("node-a")),
            "/apis/coordination.k8s.io/v1/namespaces/kube-node-lease/leases/node-a"
        );
        assert_eq!(
            lease_path("kube-node-lease", None),
            "/apis/coordination.k8s.io/v1/namespaces/kube-node-lease/leases"
        );
    }
}
