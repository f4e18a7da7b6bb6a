//! Narrows endpoint slices to the node or node pool of this hub
//!
//! Services opt in through the [`TOPOLOGY_ANNOTATION`] annotation. With
//! `kubernetes.io/hostname` only endpoints on this node are kept; with
//! [`NODE_POOL_KEY`] (or the standard zone label) only endpoints in this
//! node's pool.

use async_trait::async_trait;
use hub_core::context::components;
use hub_core::Verb;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::filter::{FilterSettings, FilterTarget, ObjectFilter, ServiceResolver};

pub const NAME: &str = "servicetopology";

pub const TOPOLOGY_ANNOTATION: &str = "edgehub.io/topology-keys";
pub const HOSTNAME_KEY: &str = "kubernetes.io/hostname";
pub const NODE_POOL_KEY: &str = "edgehub.io/nodepool";
pub const ZONE_KEY: &str = "topology.kubernetes.io/zone";

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

static TARGETS: &[FilterTarget] = &[
    FilterTarget {
        component: components::KUBE_PROXY,
        resource: "endpointslices",
        verbs: &[Verb::List, Verb::Watch],
    },
    FilterTarget {
        component: components::COREDNS,
        resource: "endpointslices",
        verbs: &[Verb::List, Verb::Watch],
    },
];

#[derive(Debug, PartialEq)]
enum Scope {
    Node,
    Pool,
}

pub struct ServiceTopologyFilter {
    node_name: String,
    node_pool: Option<String>,
    services: Arc<dyn ServiceResolver>,
}

impl ServiceTopologyFilter {
    pub fn new(settings: &FilterSettings, services: Arc<dyn ServiceResolver>) -> Self {
        Self {
            node_name: settings.node_name.clone(),
            node_pool: settings.node_pool.clone(),
            services,
        }
    }

    async fn scope_of(&self, slice: &EndpointSlice) -> Option<Scope> {
        let namespace = slice.metadata.namespace.as_deref()?;
        let service = slice.metadata.labels.as_ref()?.get(SERVICE_NAME_LABEL)?;
        let svc = self.services.service(namespace, service).await?;
        let keys = svc.metadata.annotations.as_ref()?.get(TOPOLOGY_ANNOTATION)?.clone();
        match keys.as_str() {
            HOSTNAME_KEY => Some(Scope::Node),
            NODE_POOL_KEY | ZONE_KEY => Some(Scope::Pool),
            _ => None,
        }
    }

    fn keep(&self, scope: &Scope, endpoint: &Endpoint) -> bool {
        match scope {
            Scope::Node => endpoint.node_name.as_deref() == Some(self.node_name.as_str()),
            Scope::Pool => match &self.node_pool {
                Some(pool) => endpoint.zone.as_deref() == Some(pool.as_str()),
                // Without a pool the node is its own pool.
                None => endpoint.node_name.as_deref() == Some(self.node_name.as_str()),
            },
        }
    }
}

#[async_trait]
impl ObjectFilter for ServiceTopologyFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn targets(&self) -> &'static [FilterTarget] {
        TARGETS
    }

    async fn filter(&self, obj: Value) -> Option<Value> {
        let Ok(mut slice) = serde_json::from_value::<EndpointSlice>(obj.clone()) else {
            return Some(obj);
        };
        let Some(scope) = self.scope_of(&slice).await else {
            return Some(obj);
        };

        let before = slice.endpoints.len();
        slice.endpoints.retain(|endpoint| self.keep(&scope, endpoint));
        debug!(
            "Topology {:?} kept {}/{} endpoints of {}",
            scope,
            slice.endpoints.len(),
            before,
            slice.metadata.name.as_deref().unwrap_or_default()
        );
        Some(serde_json::to_value(&slice).unwrap_or(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use serde_json::json;
    use std::collections::HashMap;

    struct Services(HashMap<String, String>);

    #[async_trait]
    impl ServiceResolver for Services {
        async fn service(&self, namespace: &str, name: &str) -> Option<Service> {
            let keys = self.0.get(&format!("{}/{}", namespace, name))?;
            serde_json::from_value(json!({
                "metadata": {
                    "name": name,
                    "namespace": namespace,
                    "annotations": {TOPOLOGY_ANNOTATION: keys}
                }
            }))
            .ok()
        }
    }

    fn filter(pool: Option<&str>) -> ServiceTopologyFilter {
        let services: HashMap<String, String> = [
            ("default/local".to_string(), HOSTNAME_KEY.to_string()),
            ("default/pooled".to_string(), NODE_POOL_KEY.to_string()),
        ]
        .into_iter()
        .collect();
        ServiceTopologyFilter::new(
            &FilterSettings {
                node_name: "node-a".to_string(),
                node_pool: pool.map(str::to_string),
                ..FilterSettings::default()
            },
            Arc::new(Services(services)),
        )
    }

    fn slice(service: &str) -> Value {
        json!({
            "apiVersion": "discovery.k8s.io/v1",
            "kind": "EndpointSlice",
            "metadata": {
                "name": format!("{}-abc", service),
                "namespace": "default",
                "labels": {SERVICE_NAME_LABEL: service}
            },
            "addressType": "IPv4",
            "endpoints": [
                {"addresses": ["10.0.0.1"], "nodeName": "node-a", "zone": "hangzhou"},
                {"addresses": ["10.0.0.2"], "nodeName": "node-b", "zone": "hangzhou"},
                {"addresses": ["10.0.0.3"], "nodeName": "node-c", "zone": "beijing"}
            ]
        })
    }

    fn addresses(obj: &Value) -> Vec<String> {
        obj["endpoints"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["addresses"][0].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_hostname_scope() {
        let out = filter(None).filter(slice("local")).await.unwrap();
        assert_eq!(addresses(&out), vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_pool_scope() {
        let out = filter(Some("hangzhou")).filter(slice("pooled")).await.unwrap();
        assert_eq!(addresses(&out), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_unannotated_service_untouched() {
        let input = slice("other");
        let out = filter(Some("hangzhou")).filter(input.clone()).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_unparseable_passes_through() {
        let input = json!({"metadata": "not-an-object"});
        let out = filter(None).filter(input.clone()).await.unwrap();
        assert_eq!(out, input);
    }
}
