//! Points the `default/kubernetes` service at the hub

use async_trait::async_trait;
use hub_core::context::components;
use hub_core::Verb;
use k8s_openapi::api::core::v1::Service;
use serde_json::Value;
use tracing::debug;

use crate::filter::{FilterSettings, FilterTarget, ObjectFilter};

pub const NAME: &str = "masterservice";

const MASTER_SERVICE_NAMESPACE: &str = "default";
const MASTER_SERVICE_NAME: &str = "kubernetes";
const MASTER_SERVICE_PORT_NAME: &str = "https";

static TARGETS: &[FilterTarget] = &[FilterTarget {
    component: components::KUBELET,
    resource: "services",
    verbs: &[Verb::List, Verb::Watch],
}];

pub struct MasterServiceFilter {
    host: String,
    port: i32,
}

impl MasterServiceFilter {
    pub fn new(settings: &FilterSettings) -> Self {
        Self {
            host: settings.master_host.clone(),
            port: settings.master_port,
        }
    }

    fn rewrite(&self, svc: &mut Service) -> bool {
        let is_master = svc.metadata.namespace.as_deref() == Some(MASTER_SERVICE_NAMESPACE)
            && svc.metadata.name.as_deref() == Some(MASTER_SERVICE_NAME);
        if !is_master {
            return false;
        }
        let Some(spec) = svc.spec.as_mut() else {
            return false;
        };
        spec.cluster_ip = Some(self.host.clone());
        spec.cluster_ips = Some(vec![self.host.clone()]);
        for port in spec.ports.iter_mut().flatten() {
            if port.name.as_deref() == Some(MASTER_SERVICE_PORT_NAME) {
                port.port = self.port;
            }
        }
        true
    }
}

#[async_trait]
impl ObjectFilter for MasterServiceFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn targets(&self) -> &'static [FilterTarget] {
        TARGETS
    }

    async fn filter(&self, obj: Value) -> Option<Value> {
        let Ok(mut svc) = serde_json::from_value::<Service>(obj.clone()) else {
            return Some(obj);
        };
        if !self.rewrite(&mut svc) {
            return Some(obj);
        }
        debug!("Rewrote master service to {}:{}", self.host, self.port);
        Some(serde_json::to_value(&svc).unwrap_or(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> MasterServiceFilter {
        MasterServiceFilter::new(&FilterSettings {
            master_host: "169.254.2.1".to_string(),
            master_port: 10268,
            ..FilterSettings::default()
        })
    }

    #[tokio::test]
    async fn test_rewrites_master_service() {
        let svc = json!({
            "metadata": {"name": "kubernetes", "namespace": "default"},
            "spec": {
                "clusterIP": "10.96.0.1",
                "clusterIPs": ["10.96.0.1"],
                "ports": [{"name": "https", "port": 443, "targetPort": 6443}]
            }
        });
        let out = filter().filter(svc).await.unwrap();
        assert_eq!(out["spec"]["clusterIP"], "169.254.2.1");
        assert_eq!(out["spec"]["clusterIPs"][0], "169.254.2.1");
        assert_eq!(out["spec"]["ports"][0]["port"], 10268);
        assert_eq!(out["spec"]["ports"][0]["targetPort"], 6443);
    }

    #[tokio::test]
    async fn test_other_services_untouched() {
        let svc = json!({
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {"clusterIP": "10.96.0.10"}
        });
        let out = filter().filter(svc.clone()).await.unwrap();
        assert_eq!(out, svc);
    }
}
