//! Background work started next to the listeners

use hub_cache::agents::{AGENTS_CONFIGMAP_KEY, AGENTS_CONFIGMAP_NAME, AGENTS_CONFIGMAP_NAMESPACE};
use hub_cache::gc::{self, ObjectExistence};
use hub_cache::CacheManager;
use hub_proxy::{ApiClient, HealthGate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

const AGENT_POLL_PERIOD: Duration = Duration::from_secs(60);

/// Drop cached pods the server no longer binds to this node
///
/// Runs once at startup and only when some server is reachable.
pub async fn reconcile_cached_pods(cache: &CacheManager, api: &ApiClient, gate: &dyn HealthGate, node: &str) {
    let Some(server) = gate.healthy_server() else {
        info!("No healthy server at startup, skipping pod cache reconciliation");
        return;
    };
    let pods = match api.node_pods(&server, node).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(server = %server.url(), "Listing pods of node {} failed: {}", node, e);
            return;
        }
    };
    let live = gc::pod_keys(&pods);
    match gc::reconcile_pods(cache.storage(), &live).await {
        Ok(removed) => debug!("Pod cache reconciliation removed {} pods", removed),
        Err(e) => warn!("Pod cache reconciliation failed: {}", e),
    }
}

/// Periodically delete cached events of objects the server dropped
pub fn spawn_event_gc(
    cache: Arc<CacheManager>,
    existence: Arc<dyn ObjectExistence>,
    base: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Event garbage collector started");
        loop {
            tokio::select! {
                _ = time::sleep(gc::jittered(base)) => {
                    if let Err(e) = gc::collect_events(cache.storage(), existence.as_ref()).await {
                        warn!("Event garbage collection failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Event garbage collector shutting down");
                    return;
                }
            }
        }
    })
}

/// Follow the cache-agent ConfigMap
///
/// A missing ConfigMap or key resets the agents to the defaults plus the
/// static configuration.
pub fn spawn_agent_watch(
    cache: Arc<CacheManager>,
    api: Arc<ApiClient>,
    gate: Arc<dyn HealthGate>,
    static_agents: Vec<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(AGENT_POLL_PERIOD);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        info!(
            "Watching {}/{} for cache agents",
            AGENTS_CONFIGMAP_NAMESPACE, AGENTS_CONFIGMAP_NAME
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    poll_agents(&cache, &api, gate.as_ref(), &static_agents).await;
                }
                _ = shutdown.recv() => {
                    info!("Cache agent watcher shutting down");
                    return;
                }
            }
        }
    })
}

async fn poll_agents(cache: &CacheManager, api: &ApiClient, gate: &dyn HealthGate, static_agents: &[String]) {
    let Some(server) = gate.healthy_server() else {
        return;
    };
    let config = match api
        .config_map(&server, AGENTS_CONFIGMAP_NAMESPACE, AGENTS_CONFIGMAP_NAME)
        .await
    {
        Ok(config) => config,
        Err(e) => {
            debug!(server = %server.url(), "Reading cache agents failed: {}", e);
            return;
        }
    };
    let dynamic = config
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove(AGENTS_CONFIGMAP_KEY))
        .unwrap_or_default();
    if let Err(e) = cache.apply_agents(&agent_value(static_agents, &dynamic)).await {
        warn!("Applying cache agents failed: {}", e);
    }
}

/// Statically configured agents joined with the ConfigMap value
fn agent_value(static_agents: &[String], dynamic: &str) -> String {
    static_agents
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(dynamic))
        .filter(|v| !v.trim().is_empty())
        .collect::<Vec<_>>()
        .join(",")
}
