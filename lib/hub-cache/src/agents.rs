//! The set of components whose responses are cached

use std::collections::BTreeSet;
use std::sync::RwLock;
use tracing::info;

/// Components cached without any configuration
pub const DEFAULT_CACHE_AGENTS: &[&str] = &["kubelet", "kube-proxy", "flanneld", "coredns", "edge-hub"];

/// Agent name that enables caching for every component
pub const ALL_AGENTS: &str = "*";

/// Namespace and name of the ConfigMap carrying extra cache agents
pub const AGENTS_CONFIGMAP_NAMESPACE: &str = "kube-system";
pub const AGENTS_CONFIGMAP_NAME: &str = "edge-hub-cfg";
pub const AGENTS_CONFIGMAP_KEY: &str = "cache_agents";

#[derive(Debug)]
pub struct CacheAgents {
    configured: RwLock<BTreeSet<String>>,
}

impl CacheAgents {
    /// Defaults plus statically configured agents
    pub fn new(extra: &[String]) -> Self {
        Self {
            configured: RwLock::new(parse_agents(extra.iter().map(String::as_str))),
        }
    }

    pub fn contains(&self, component: &str) -> bool {
        if DEFAULT_CACHE_AGENTS.contains(&component) {
            return true;
        }
        self.configured
            .read()
            .map(|agents| agents.contains(ALL_AGENTS) || agents.contains(component))
            .unwrap_or(false)
    }

    /// Every agent currently enabled, defaults first
    pub fn list(&self) -> Vec<String> {
        let mut agents: Vec<String> = DEFAULT_CACHE_AGENTS.iter().map(|a| a.to_string()).collect();
        if let Ok(configured) = self.configured.read() {
            agents.extend(configured.iter().filter(|a| !DEFAULT_CACHE_AGENTS.contains(&a.as_str())).cloned());
        }
        agents
    }

    /// Replace the configured agents with a comma-separated value
    ///
    /// Returns whether the set changed.
    pub fn apply(&self, value: &str) -> bool {
        let next = parse_agents(value.split(','));
        let Ok(mut configured) = self.configured.write() else {
            return false;
        };
        if *configured == next {
            return false;
        }
        info!(
            "Cache agents changed from {:?} to {:?}",
            configured.iter().collect::<Vec<_>>(),
            next.iter().collect::<Vec<_>>()
        );
        *configured = next;
        true
    }
}

impl Default for CacheAgents {
    fn default() -> Self {
        Self::new(&[])
    }
}

fn parse_agents<'a>(values: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    values
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .filter(|v| !DEFAULT_CACHE_AGENTS.contains(v))
        .map(str::to_string)
        .collect()
}
