//! Per-server health tracking through node lease renewal
//!
//! Each remote server gets its own prober. Every tick the prober renews this
//! node's lease on that server; a failed renewal flips the server unhealthy
//! at once, and only `healthy_threshold` consecutive renewals bring it back.

use chrono::Utc;
use hub_core::config::HubConfig;
use hub_core::{RemoteServer, NODE_LEASE_NAMESPACE};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api_client::{ApiError, ApiResult, LeaseClient};
use crate::metrics::MetricsCollector;
use crate::policy::RetryPolicy;
use crate::transport::TransportManager;

/// Health as seen by routing
pub trait HealthChecker: Send + Sync {
    fn is_healthy(&self, address: &str) -> bool;

    /// Note that kubelet just sent its own lease heartbeat
    fn update_heartbeat(&self);
}

/// Health check configuration
#[derive(Clone, Debug)]
pub struct HealthCheckConfig {
    pub node_name: String,
    pub heartbeat_interval: Duration,
    /// Bound on one lease call
    pub heartbeat_timeout: Duration,
    /// Lease duration written to the lease, and the staleness bound of kubelet heartbeats
    pub lease_duration: Duration,
}

impl HealthCheckConfig {
    pub fn from_hub(config: &HubConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: Duration::from_secs(config.health.heartbeat_timeout_seconds),
            lease_duration: Duration::from_secs(config.health.lease_duration_seconds.max(1) as u64),
        }
    }
}

/// Health checker renewing the node lease on every server
pub struct LeaseHealthChecker {
    config: HealthCheckConfig,
    servers: Vec<Arc<RemoteServer>>,
    leases: Arc<dyn LeaseClient>,
    transports: Arc<TransportManager>,
    metrics: MetricsCollector,
    retry: RetryPolicy,
    last_heartbeat: Mutex<Instant>,
    /// Cancelled once shutdown is broadcast; interrupts lease calls and backoffs
    shutdown: CancellationToken,
}

impl LeaseHealthChecker {
    /// Build the checker and probe every server once
    ///
    /// A server that answers this first probe is healthy immediately.
    pub async fn new(
        config: HealthCheckConfig,
        servers: Vec<Arc<RemoteServer>>,
        leases: Arc<dyn LeaseClient>,
        transports: Arc<TransportManager>,
        metrics: MetricsCollector,
    ) -> Self {
        let checker = Self {
            config,
            servers,
            leases,
            transports,
            metrics,
            retry: RetryPolicy::default(),
            last_heartbeat: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        };

        for server in &checker.servers {
            match checker.renew(server).await {
                Ok(()) => {
                    server.mark_healthy();
                    info!(server = %server.url(), "Remote server healthy at startup");
                }
                Err(e) => warn!(server = %server.url(), "Remote server unhealthy at startup: {}", e),
            }
            checker
                .metrics
                .record_server_health(server.address(), server.is_healthy());
        }
        checker
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn servers(&self) -> &[Arc<RemoteServer>] {
        &self.servers
    }

    /// Spawn one prober per server
    ///
    /// A shutdown broadcast also interrupts a renewal in progress.
    pub fn run(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = self
            .servers
            .iter()
            .cloned()
            .map(|server| {
                let checker = self.clone();
                tokio::spawn(async move { checker.run_prober(server).await })
            })
            .collect();

        let token = self.shutdown.clone();
        let mut shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.recv() => token.cancel(),
                _ = token.cancelled() => {}
            }
        }));
        handles
    }

    async fn run_prober(&self, server: Arc<RemoteServer>) {
        let mut interval = time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        interval.tick().await;
        info!(server = %server.url(), "Health prober started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!(server = %server.url(), "Health prober shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.probe(&server).await;
                }
            }
        }
    }

    /// One probe; returns whether it succeeded
    ///
    /// A probe cut short by shutdown leaves the server's health untouched.
    pub async fn probe(&self, server: &RemoteServer) -> bool {
        let result = self.renew(server).await;
        match &result {
            Err(ApiError::Cancelled) => return false,
            Err(e) => debug!(server = %server.url(), "Lease renewal failed: {}", e),
            Ok(()) => {}
        }
        let success = result.is_ok();

        if let Some(healthy) = server.record_probe(success) {
            self.metrics.record_server_health(server.address(), healthy);
            if healthy {
                info!(server = %server.url(), "Remote server is healthy again");
            } else {
                warn!(server = %server.url(), "Remote server became unhealthy");
                self.transports.close_address(server.address());
            }
        }
        success
    }

    fn heartbeat_is_stale(&self) -> bool {
        self.last_heartbeat
            .lock()
            .map(|last| last.elapsed() > self.config.lease_duration)
            .unwrap_or(false)
    }

    /// Renew the node lease, retrying conflicts and transient failures
    async fn renew(&self, server: &RemoteServer) -> ApiResult<()> {
        let read_only = self.heartbeat_is_stale();
        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(ApiError::Cancelled),
                outcome = time::timeout(self.config.heartbeat_timeout, self.renew_once(server, read_only)) => {
                    outcome.unwrap_or_else(|_| Err(ApiError::Transport("lease call timed out".to_string())))
                }
            };

            let retryable = match &outcome {
                Ok(()) => return Ok(()),
                Err(ApiError::Conflict) => true,
                Err(e) => e.is_transient(),
            };
            attempt += 1;
            if !retryable || !self.retry.should_retry(attempt) {
                return outcome;
            }
            // Conflicts re-read the lease at once; everything else backs off.
            if !matches!(outcome, Err(ApiError::Conflict)) {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(ApiError::Cancelled),
                    _ = time::sleep(self.retry.backoff_duration(attempt - 1)) => {}
                }
            }
        }
    }

    async fn renew_once(&self, server: &RemoteServer, read_only: bool) -> ApiResult<()> {
        let current = self
            .leases
            .get(server, NODE_LEASE_NAMESPACE, &self.config.node_name)
            .await?;
        if read_only {
            // The server answered; kubelet is gone, so leave the lease to expire.
            return Ok(());
        }
        match current {
            None => {
                self.leases.create(server, &self.new_lease()).await?;
            }
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                spec.holder_identity = Some(self.config.node_name.clone());
                spec.lease_duration_seconds = Some(self.config.lease_duration.as_secs() as i32);
                spec.renew_time = Some(MicroTime(Utc::now()));
                self.leases.update(server, &lease).await?;
            }
        }
        Ok(())
    }

    fn new_lease(&self) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.config.node_name.clone()),
                namespace: Some(NODE_LEASE_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.node_name.clone()),
                lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                renew_time: Some(MicroTime(Utc::now())),
                ..LeaseSpec::default()
            }),
        }
    }
}

impl HealthChecker for LeaseHealthChecker {
    fn is_healthy(&self, address: &str) -> bool {
        self.servers
            .iter()
            .find(|s| s.address() == address)
            .map(|s| s.is_healthy())
            .unwrap_or(false)
    }

    fn update_heartbeat(&self) {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Instant::now();
        }
    }
}

/// Health checker reporting a fixed value
///
/// Used where no lease tracking is wanted; per-address overrides let tests
/// take single servers in and out of rotation.
#[derive(Default)]
pub struct FakeHealthChecker {
    healthy: AtomicBool,
    overrides: Mutex<HashMap<String, bool>>,
    heartbeats: AtomicU64,
}

impl FakeHealthChecker {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            ..Self::default()
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_server(&self, address: &str, healthy: bool) {
        if let Ok(mut overrides) = self.overrides.lock() {
            overrides.insert(address.to_string(), healthy);
        }
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }
}

impl HealthChecker for FakeHealthChecker {
    fn is_healthy(&self, address: &str) -> bool {
        self.overrides
            .lock()
            .ok()
            .and_then(|o| o.get(address).copied())
            .unwrap_or_else(|| self.healthy.load(Ordering::SeqCst))
    }

    fn update_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
    }
}
