//! Hub configuration schema
//!
//! Loaded from a YAML file; every field has a default so a partial file is
//! enough to start a hub.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{HubError, RemoteServer, Result};

/// Backend selection algorithm
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum LbMode {
    /// Cycle through healthy servers
    #[default]
    #[serde(rename = "rr")]
    RoundRobin,
    /// Always the first healthy server in configured order
    #[serde(rename = "priority")]
    Priority,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Name of the node this hub runs on
    #[serde(default)]
    pub node_name: String,

    /// Node pool (zone) the node belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pool: Option<String>,

    /// Remote control-plane servers, in priority order
    #[serde(default)]
    pub servers: Vec<String>,

    #[serde(default)]
    pub lb_mode: LbMode,

    /// Plaintext proxy listener
    #[serde(default = "default_proxy_address")]
    pub proxy_address: String,

    /// TLS proxy listener
    #[serde(default = "default_proxy_secure_address")]
    pub proxy_secure_address: String,

    /// Address of the local dummy interface duplicating both listeners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dummy_if_ip: Option<IpAddr>,

    /// Admin listener serving health and metrics
    #[serde(default = "default_admin_address")]
    pub admin_address: String,

    #[serde(default = "default_true")]
    pub enable_caching: bool,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Root directory for identity and kubeconfig files
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Maximum concurrent non-long-running requests
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Default request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Base period of the event garbage collector (seconds)
    #[serde(default = "default_gc_frequency")]
    pub gc_frequency_seconds: u64,

    /// Components whose responses are cached in addition to the defaults
    #[serde(default)]
    pub cache_agents: Vec<String>,

    #[serde(default)]
    pub filters: FilterConfig,

    /// Serving certificate for the TLS proxy listener
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsFiles>,

    #[serde(default)]
    pub log: LogConfig,
}

/// Bootstrap credentials for obtaining a client identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    /// Single-use bootstrap token (`id.secret`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Pins for the cluster CA, `sha256:<hex>`
    #[serde(default)]
    pub ca_cert_hashes: Vec<String>,

    /// Pre-provisioned client identity; skips the CSR flow when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,

    /// Interval between rotation checks (seconds)
    #[serde(default = "default_rotation_check")]
    pub rotation_check_seconds: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            token: None,
            ca_cert_hashes: Vec::new(),
            client_cert_file: None,
            ca_file: None,
            rotation_check_seconds: default_rotation_check(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    /// Interval between lease renewals (seconds)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    /// Timeout of a single renewal (seconds)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,

    /// Consecutive successes before an unhealthy server is healthy again
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Lease duration written to the node lease (seconds)
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: i32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            healthy_threshold: default_healthy_threshold(),
            lease_duration_seconds: default_lease_duration(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    /// Filter names that are not registered
    #[serde(default)]
    pub disabled: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            node_pool: None,
            servers: Vec::new(),
            lb_mode: LbMode::default(),
            proxy_address: default_proxy_address(),
            proxy_secure_address: default_proxy_secure_address(),
            dummy_if_ip: None,
            admin_address: default_admin_address(),
            enable_caching: true,
            cache_dir: default_cache_dir(),
            root_dir: default_root_dir(),
            bootstrap: BootstrapConfig::default(),
            health: HealthConfig::default(),
            max_in_flight: default_max_in_flight(),
            request_timeout_seconds: default_request_timeout(),
            gc_frequency_seconds: default_gc_frequency(),
            cache_agents: Vec::new(),
            filters: FilterConfig::default(),
            tls: None,
            log: LogConfig::default(),
        }
    }
}

impl HubConfig {
    /// Load from a YAML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Reject configurations the hub cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(HubError::InvalidConfiguration("nodeName must be set".to_string()));
        }
        if self.servers.is_empty() {
            return Err(HubError::InvalidConfiguration(
                "at least one remote server is required".to_string(),
            ));
        }
        for server in &self.servers {
            RemoteServer::new(server, self.health.healthy_threshold)?;
        }
        if self.health.healthy_threshold == 0 {
            return Err(HubError::InvalidConfiguration(
                "healthyThreshold must be at least 1".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(HubError::InvalidConfiguration(
                "maxInFlight must be at least 1".to_string(),
            ));
        }
        if let Some(ip) = self.dummy_if_ip {
            let link_local = Ipv4Network::new(Ipv4Addr::new(169, 254, 0, 0), 16)
                .map_err(|e| HubError::InvalidConfiguration(e.to_string()))?;
            match ip {
                IpAddr::V4(v4) if link_local.contains(v4) => {}
                _ => {
                    return Err(HubError::InvalidConfiguration(format!(
                        "dummyIfIp {} must be within {}",
                        ip, link_local
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.health.heartbeat_interval_seconds)
    }

    pub fn gc_frequency(&self) -> Duration {
        Duration::from_secs(self.gc_frequency_seconds)
    }
}

// Default values
fn default_proxy_address() -> String {
    "127.0.0.1:10261".to_string()
}

fn default_proxy_secure_address() -> String {
    "127.0.0.1:10268".to_string()
}

fn default_admin_address() -> String {
    "127.0.0.1:10267".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/etc/edge-hub/cache")
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/var/lib/edge-hub")
}

fn default_max_in_flight() -> usize {
    250
}

fn default_request_timeout() -> u64 {
    60
}

fn default_gc_frequency() -> u64 {
    120
}

fn default_rotation_check() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_timeout() -> u64 {
    2
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_lease_duration() -> i32 {
    40
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
