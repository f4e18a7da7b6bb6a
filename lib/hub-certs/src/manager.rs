//! Client identity lifecycle: bootstrap, persistence and rotation

use arc_swap::ArcSwapOption;
use chrono::Utc;
use hub_core::{CertificateManager, ClientIdentity, HubConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::{CertificateApi, Credential};
use crate::kubeconfig::{AuthInfo, Kubeconfig};
use crate::pki::{generate_csr, needs_rotation, parse_identity, verify_ca_pins};
use crate::{write_file, CertError, Result};

pub const BOOTSTRAP_KUBECONFIG: &str = "bootstrap-hub.conf";
pub const HUB_KUBECONFIG: &str = "edge-hub.conf";
pub const CA_FILE: &str = "pki/ca.crt";
pub const CLIENT_PEM: &str = "pki/edge-hub-client-current.pem";

#[derive(Clone, Debug)]
pub struct CertManagerConfig {
    pub node_name: String,
    /// Server certificates are requested from
    pub server: String,
    pub root_dir: PathBuf,
    pub bootstrap_token: Option<String>,
    pub ca_cert_hashes: Vec<String>,
    /// Pre-provisioned identity; disables the CSR flow
    pub client_cert_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub rotation_check: Duration,
}

impl CertManagerConfig {
    pub fn from_hub(config: &HubConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            server: config.servers.first().cloned().unwrap_or_default(),
            root_dir: config.root_dir.clone(),
            bootstrap_token: config.bootstrap.token.clone(),
            ca_cert_hashes: config.bootstrap.ca_cert_hashes.clone(),
            client_cert_file: config.bootstrap.client_cert_file.clone(),
            ca_file: config.bootstrap.ca_file.clone(),
            rotation_check: Duration::from_secs(config.bootstrap.rotation_check_seconds.max(1)),
        }
    }
}

/// Certificate manager backed by files under the hub root directory
pub struct HubCertificateManager {
    config: CertManagerConfig,
    api: Arc<dyn CertificateApi>,
    identity: ArcSwapOption<ClientIdentity>,
    ca: ArcSwapOption<Vec<u8>>,
}

impl HubCertificateManager {
    pub fn new(config: CertManagerConfig, api: Arc<dyn CertificateApi>) -> Self {
        Self {
            config,
            api,
            identity: ArcSwapOption::empty(),
            ca: ArcSwapOption::empty(),
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.config.root_dir.join(relative)
    }

    /// Obtain an identity, from disk if still valid, otherwise by CSR
    pub async fn start(&self) -> Result<()> {
        if let Some(file) = self.config.client_cert_file.clone() {
            return self.load_provisioned(&file);
        }

        std::fs::create_dir_all(self.path("pki"))?;
        self.reset_if_server_changed()?;
        let ca = self.ensure_ca().await?;

        if let Some(identity) = self.load_identity_file()? {
            if !identity.is_expired() {
                info!(
                    "Loaded client certificate {} valid until {}",
                    identity.fingerprint, identity.not_after
                );
                self.identity.store(Some(Arc::new(identity)));
                self.write_hub_kubeconfig()?;
                return Ok(());
            }
            warn!("Client certificate on disk has expired");
        }

        let token = self.config.bootstrap_token.clone().ok_or_else(|| {
            CertError::Bootstrap("no valid client certificate and no bootstrap token".to_string())
        })?;
        Kubeconfig::new(
            &self.config.server,
            &self.path(CA_FILE),
            AuthInfo {
                token: Some(token.clone()),
                ..AuthInfo::default()
            },
        )
        .save(&self.path(BOOTSTRAP_KUBECONFIG))?;

        self.request_identity(Credential::Token(token), &ca).await
    }

    fn load_provisioned(&self, file: &Path) -> Result<()> {
        let identity = parse_identity(&std::fs::read(file)?)?;
        if let Some(ca_file) = &self.config.ca_file {
            self.ca.store(Some(Arc::new(std::fs::read(ca_file)?)));
        }
        info!("Using provisioned client certificate {}", file.display());
        self.identity.store(Some(Arc::new(identity)));
        Ok(())
    }

    /// Drop identity files written for a different server
    fn reset_if_server_changed(&self) -> Result<()> {
        let Some(existing) = Kubeconfig::load(&self.path(HUB_KUBECONFIG))? else {
            return Ok(());
        };
        if existing.server() == Some(self.config.server.as_str()) {
            return Ok(());
        }
        warn!(
            "Hub kubeconfig points at {:?}, configured server is {}; resetting identity",
            existing.server(),
            self.config.server
        );
        self.reset_identity_files(true)
    }

    fn reset_identity_files(&self, include_ca: bool) -> Result<()> {
        let mut files = vec![BOOTSTRAP_KUBECONFIG, HUB_KUBECONFIG, CLIENT_PEM];
        if include_ca {
            files.push(CA_FILE);
        }
        for file in files {
            match std::fs::remove_file(self.path(file)) {
                Ok(()) => debug!("Removed {}", file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.identity.store(None);
        Ok(())
    }

    /// Resolve the cluster CA, refreshing it from cluster-info when bootstrapping
    async fn ensure_ca(&self) -> Result<Vec<u8>> {
        let local = match &self.config.ca_file {
            Some(file) => Some(std::fs::read(file)?),
            None => match std::fs::read(self.path(CA_FILE)) {
                Ok(ca) => Some(ca),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            },
        };

        if self.config.bootstrap_token.is_some() && self.config.ca_file.is_none() {
            match self.api.cluster_ca(&self.config.server).await {
                Ok(remote) => {
                    verify_ca_pins(&remote, &self.config.ca_cert_hashes)?;
                    if self.config.ca_cert_hashes.is_empty() {
                        warn!("No CA pins configured; trusting cluster-info CA without verification");
                    }
                    if local.as_ref().is_some_and(|l| *l != remote) {
                        warn!("Cluster CA changed; resetting client identity");
                        self.reset_identity_files(false)?;
                    }
                    write_file(&self.path(CA_FILE), &remote, false)?;
                    self.ca.store(Some(Arc::new(remote.clone())));
                    return Ok(remote);
                }
                Err(e) if local.is_some() => {
                    warn!("Could not refresh cluster CA, using the local copy: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        let ca = local.ok_or_else(|| CertError::Bootstrap("cluster CA is not available".to_string()))?;
        self.ca.store(Some(Arc::new(ca.clone())));
        Ok(ca)
    }

    fn load_identity_file(&self) -> Result<Option<ClientIdentity>> {
        match std::fs::read(self.path(CLIENT_PEM)) {
            Ok(pem) => match parse_identity(&pem) {
                Ok(identity) => Ok(Some(identity)),
                Err(e) => {
                    warn!("Ignoring unreadable client certificate: {}", e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_hub_kubeconfig(&self) -> Result<()> {
        let pem = self.path(CLIENT_PEM).display().to_string();
        Kubeconfig::new(
            &self.config.server,
            &self.path(CA_FILE),
            AuthInfo {
                client_certificate: Some(pem.clone()),
                client_key: Some(pem),
                ..AuthInfo::default()
            },
        )
        .save(&self.path(HUB_KUBECONFIG))
    }

    async fn request_identity(&self, credential: Credential, ca: &[u8]) -> Result<()> {
        let csr = generate_csr(&self.config.node_name)?;
        let mut pem = self
            .api
            .request_certificate(&self.config.server, ca, &credential, &csr.csr_pem)
            .await?;
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(csr.key_pem.as_bytes());

        let identity = parse_identity(&pem)?;
        write_file(&self.path(CLIENT_PEM), &pem, true)?;
        self.write_hub_kubeconfig()?;
        info!(
            "Obtained client certificate {} valid until {}",
            identity.fingerprint, identity.not_after
        );
        self.identity.store(Some(Arc::new(identity)));
        Ok(())
    }

    /// Renew the identity once it is past the rotation threshold
    ///
    /// Returns whether a new identity was installed.
    pub async fn rotate_if_needed(&self) -> Result<bool> {
        if let Some(file) = self.config.client_cert_file.clone() {
            let before = self.current().map(|id| id.fingerprint.clone());
            self.load_provisioned(&file)?;
            return Ok(before != self.current().map(|id| id.fingerprint.clone()));
        }

        let current = self.current();
        if let Some(identity) = &current {
            if !needs_rotation(identity, Utc::now()) {
                return Ok(false);
            }
        }

        let credential = match &current {
            Some(identity) if !identity.is_expired() => Credential::ClientCert(std::fs::read(self.path(CLIENT_PEM))?),
            _ => match &self.config.bootstrap_token {
                Some(token) => Credential::Token(token.clone()),
                None => {
                    return Err(CertError::Bootstrap(
                        "client certificate expired and no bootstrap token".to_string(),
                    ))
                }
            },
        };
        let ca = match self.ca.load_full() {
            Some(ca) => ca.as_ref().clone(),
            None => self.ensure_ca().await?,
        };
        info!("Rotating client certificate");
        self.request_identity(credential, &ca).await?;
        Ok(true)
    }

    /// Periodically rotate until shutdown
    pub async fn run_rotation(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.rotation_check);
        info!("Certificate rotation started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.rotate_if_needed().await {
                        Ok(true) => info!("Client certificate rotated"),
                        Ok(false) => {}
                        Err(e) => error!("Certificate rotation failed: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Certificate rotation shutting down");
                    return;
                }
            }
        }
    }
}

impl CertificateManager for HubCertificateManager {
    fn current(&self) -> Option<Arc<ClientIdentity>> {
        self.identity.load_full()
    }

    fn ca_bundle(&self) -> Option<Vec<u8>> {
        self.ca.load_full().map(|ca| ca.as_ref().clone())
    }
}
