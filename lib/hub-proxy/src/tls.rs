//! TLS configuration for the secure listener and the upstream transports

use anyhow::{anyhow, Result};
use hub_core::CertificateManager;
use rustls::client::ResolvesClientCert;
use rustls::crypto::ring::{default_provider, sign::any_supported_type};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, read_all};
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Serving configuration of the TLS proxy listener
#[derive(Clone)]
pub struct TlsServerConfig {
    pub config: Arc<ServerConfig>,
}

impl TlsServerConfig {
    /// Create a TLS configuration from PEM-encoded certificate and private key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = load_certificates(cert_pem)?;
        if chain.is_empty() {
            return Err(anyhow!("No certificates found in PEM data"));
        }
        debug!("Loaded {} certificate(s)", chain.len());
        let key = load_private_key(key_pem)?;

        let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!("Failed to select TLS versions: {}", e))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| anyhow!("Failed to create TLS config: {}", e))?;

        info!("TLS serving configuration created");
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_files(cert_file: &Path, key_file: &Path) -> Result<Self> {
        let cert = std::fs::read(cert_file)
            .map_err(|e| anyhow!("Failed to read {}: {}", cert_file.display(), e))?;
        let key = std::fs::read(key_file)
            .map_err(|e| anyhow!("Failed to read {}: {}", key_file.display(), e))?;
        Self::from_pem(&cert, &key)
    }
}

/// Load certificates from PEM-encoded data
pub fn load_certificates(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem_data);
    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Failed to parse certificates: {}", e))
}

fn load_private_key(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem_data);
    for item in read_all(&mut reader) {
        match item.map_err(|e| anyhow!("Failed to parse private key: {}", e))? {
            rustls_pemfile::Item::Pkcs8Key(k) => return Ok(PrivateKeyDer::Pkcs8(k)),
            rustls_pemfile::Item::Sec1Key(k) => return Ok(PrivateKeyDer::Sec1(k)),
            rustls_pemfile::Item::Pkcs1Key(k) => return Ok(PrivateKeyDer::Pkcs1(k)),
            _ => {}
        }
    }
    Err(anyhow!("No private key found in PEM data"))
}

/// Client configuration for one upstream transport
///
/// The cluster CA comes from the certificate manager. With `present_identity`
/// the manager's current identity is offered on every handshake.
pub fn client_config(certs: &Arc<dyn CertificateManager>, present_identity: bool) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    if let Some(bundle) = certs.ca_bundle() {
        for cert in load_certificates(&bundle)? {
            roots
                .add(cert)
                .map_err(|e| anyhow!("Failed to add CA certificate to root store: {}", e))?;
        }
    }
    if roots.is_empty() {
        warn!("No cluster CA available; TLS connections to remote servers will fail verification");
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("Failed to select TLS versions: {}", e))?
        .with_root_certificates(roots);
    let config = if present_identity {
        builder.with_client_cert_resolver(Arc::new(IdentityResolver::new(certs.clone())))
    } else {
        builder.with_no_client_auth()
    };
    Ok(config)
}

/// Offers whatever identity the certificate manager currently holds
struct IdentityResolver {
    certs: Arc<dyn CertificateManager>,
    /// Signing key built for the last seen fingerprint
    cached: Mutex<Option<(String, Arc<CertifiedKey>)>>,
}

impl IdentityResolver {
    fn new(certs: Arc<dyn CertificateManager>) -> Self {
        Self {
            certs,
            cached: Mutex::new(None),
        }
    }
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver").finish_non_exhaustive()
    }
}

impl ResolvesClientCert for IdentityResolver {
    fn resolve(&self, _root_hint_subjects: &[&[u8]], _sigschemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        let identity = self.certs.current()?;
        let mut cached = self.cached.lock().ok()?;
        if let Some((fingerprint, key)) = cached.as_ref() {
            if *fingerprint == identity.fingerprint {
                return Some(key.clone());
            }
        }
        let signing_key = match any_supported_type(&identity.key) {
            Ok(key) => key,
            Err(e) => {
                warn!("Client key of {} is not usable: {}", identity.fingerprint, e);
                return None;
            }
        };
        let key = Arc::new(CertifiedKey::new(identity.cert_chain.clone(), signing_key));
        *cached = Some((identity.fingerprint.clone(), key.clone()));
        Some(key)
    }

    fn has_certs(&self) -> bool {
        self.certs.current().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::identity::StaticCertificateManager;

    #[test]
    fn test_rejects_empty_pem() {
        assert!(TlsServerConfig::from_pem(b"", b"").is_err());
        assert!(load_private_key(b"not a key").is_err());
    }

    #[test]
    fn test_client_config_without_ca() {
        let certs: Arc<dyn CertificateManager> = Arc::new(StaticCertificateManager::default());
        let config = client_config(&certs, true).unwrap();
        assert!(!config.client_auth_cert_resolver.has_certs());
        assert!(client_config(&certs, false).is_ok());
    }
}
