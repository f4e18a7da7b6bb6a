//! Makes kube-proxy fall back to its in-cluster configuration

use async_trait::async_trait;
use hub_core::context::components;
use hub_core::Verb;
use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::Value;
use tracing::info;

use crate::filter::{FilterTarget, ObjectFilter};

pub const NAME: &str = "inclusterconfig";

const KUBE_PROXY_CONFIGMAP_NAMESPACE: &str = "kube-system";
const KUBE_PROXY_CONFIGMAP_NAME: &str = "kube-proxy";
const KUBE_PROXY_CONFIG_KEY: &str = "config.conf";

static TARGETS: &[FilterTarget] = &[FilterTarget {
    component: components::KUBELET,
    resource: "configmaps",
    verbs: &[Verb::Get, Verb::List, Verb::Watch],
}];

#[derive(Default)]
pub struct InClusterConfigFilter;

/// Comment out every `kubeconfig:` line, keeping indentation
fn comment_out_kubeconfig(config: &str) -> Option<String> {
    let mut changed = false;
    let lines: Vec<String> = config
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("kubeconfig:") {
                changed = true;
                let indent = &line[..line.len() - trimmed.len()];
                format!("{}#{}", indent, trimmed)
            } else {
                line.to_string()
            }
        })
        .collect();
    if !changed {
        return None;
    }
    let mut out = lines.join("\n");
    if config.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

#[async_trait]
impl ObjectFilter for InClusterConfigFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn targets(&self) -> &'static [FilterTarget] {
        TARGETS
    }

    async fn filter(&self, obj: Value) -> Option<Value> {
        let Ok(mut cm) = serde_json::from_value::<ConfigMap>(obj.clone()) else {
            return Some(obj);
        };
        if cm.metadata.namespace.as_deref() != Some(KUBE_PROXY_CONFIGMAP_NAMESPACE)
            || cm.metadata.name.as_deref() != Some(KUBE_PROXY_CONFIGMAP_NAME)
        {
            return Some(obj);
        }
        let rewritten = cm
            .data
            .as_ref()
            .and_then(|data| data.get(KUBE_PROXY_CONFIG_KEY))
            .and_then(|config| comment_out_kubeconfig(config));
        let Some(rewritten) = rewritten else {
            return Some(obj);
        };
        if let Some(data) = cm.data.as_mut() {
            data.insert(KUBE_PROXY_CONFIG_KEY.to_string(), rewritten);
        }
        info!("Commented out kubeconfig of the kube-proxy configmap");
        Some(serde_json::to_value(&cm).unwrap_or(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONFIG: &str = "apiVersion: kubeproxy.config.k8s.io/v1alpha1\nclientConnection:\n  kubeconfig: /var/lib/kube-proxy/kubeconfig.conf\n  qps: 5\n";

    #[test]
    fn test_comment_out() {
        let out = comment_out_kubeconfig(CONFIG).unwrap();
        assert!(out.contains("  #kubeconfig: /var/lib/kube-proxy/kubeconfig.conf\n"));
        assert!(out.ends_with("qps: 5\n"));
        assert!(comment_out_kubeconfig(&out).is_none());
    }

    #[tokio::test]
    async fn test_only_kube_proxy_configmap() {
        let filter = InClusterConfigFilter;
        let cm = json!({
            "metadata": {"name": "kube-proxy", "namespace": "kube-system"},
            "data": {"config.conf": CONFIG}
        });
        let out = filter.filter(cm).await.unwrap();
        assert!(out["data"]["config.conf"].as_str().unwrap().contains("#kubeconfig:"));

        let other = json!({
            "metadata": {"name": "coredns", "namespace": "kube-system"},
            "data": {"config.conf": CONFIG}
        });
        assert_eq!(filter.filter(other.clone()).await.unwrap(), other);
    }
}
