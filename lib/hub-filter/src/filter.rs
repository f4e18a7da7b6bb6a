//! The filter contract

use async_trait::async_trait;
use hub_core::Verb;
use k8s_openapi::api::core::v1::Service;
use serde_json::Value;

/// A (component, resource, verbs) combination a filter applies to
#[derive(Clone, Copy, Debug)]
pub struct FilterTarget {
    pub component: &'static str,
    pub resource: &'static str,
    pub verbs: &'static [Verb],
}

impl FilterTarget {
    pub fn matches(&self, component: &str, resource: &str, verb: Verb) -> bool {
        self.component == component && self.resource == resource && self.verbs.contains(&verb)
    }
}

/// Rewrites or drops objects of an API response
///
/// Implementations must pass objects they cannot interpret through
/// unchanged.
#[async_trait]
pub trait ObjectFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Requests whose responses this filter handles
    fn targets(&self) -> &'static [FilterTarget];

    /// Filter one object; `None` drops it from the response
    async fn filter(&self, obj: Value) -> Option<Value>;
}

/// Node-local facts filters depend on
#[derive(Clone, Debug, Default)]
pub struct FilterSettings {
    pub node_name: String,
    pub node_pool: Option<String>,
    /// Address clients should use to reach the control plane through the hub
    pub master_host: String,
    pub master_port: i32,
}

/// Lookup of services referenced by the objects being filtered
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn service(&self, namespace: &str, name: &str) -> Option<Service>;
}
