//! Drops services that are only reachable from the cloud side

use async_trait::async_trait;
use hub_core::context::components;
use hub_core::Verb;
use serde_json::Value;
use tracing::debug;

use crate::filter::{FilterTarget, ObjectFilter};

pub const NAME: &str = "discardcloudservice";

pub const DISCARD_ANNOTATION: &str = "svc.edgehub.io/discard";

static TARGETS: &[FilterTarget] = &[FilterTarget {
    component: components::KUBE_PROXY,
    resource: "services",
    verbs: &[Verb::List, Verb::Watch],
}];

#[derive(Default)]
pub struct DiscardCloudServiceFilter;

#[async_trait]
impl ObjectFilter for DiscardCloudServiceFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn targets(&self) -> &'static [FilterTarget] {
        TARGETS
    }

    async fn filter(&self, obj: Value) -> Option<Value> {
        let discard = obj
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(DISCARD_ANNOTATION))
            .and_then(Value::as_str)
            == Some("true");
        if discard {
            debug!(
                "Discarding cloud service {}",
                obj.pointer("/metadata/name").and_then(serde_json::Value::as_str).unwrap_or_default()
            );
            return None;
        }
        Some(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_discard_annotation() {
        let filter = DiscardCloudServiceFilter;
        let cloud = json!({"metadata": {"name": "lb", "annotations": {DISCARD_ANNOTATION: "true"}}});
        let edge = json!({"metadata": {"name": "web", "annotations": {DISCARD_ANNOTATION: "false"}}});
        assert!(filter.filter(cloud).await.is_none());
        assert!(filter.filter(edge).await.is_some());
    }
}
