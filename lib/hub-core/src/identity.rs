//! Client identity contract between the certificate manager and the transports

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::{Arc, RwLock};

/// The client certificate chain and key currently presented to the control plane
#[derive(Debug)]
pub struct ClientIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Hex SHA-256 of the leaf certificate
    pub fingerprint: String,
}

impl ClientIdentity {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.not_after
    }

    /// Fraction of the validity period elapsed at `now`, clamped to `[0, 1]`
    pub fn elapsed_fraction(&self, now: DateTime<Utc>) -> f64 {
        let total = (self.not_after - self.not_before).num_seconds();
        if total <= 0 {
            return 1.0;
        }
        let elapsed = (now - self.not_before).num_seconds();
        (elapsed as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Source of the rotating client identity
///
/// Holders keep the manager, never a copy of the identity, so a rotation is
/// visible to all of them on their next call.
pub trait CertificateManager: Send + Sync {
    /// The active identity, if one has been obtained
    fn current(&self) -> Option<Arc<ClientIdentity>>;

    /// Whether the active identity exists and has not expired
    fn not_expired(&self) -> bool {
        self.current().map(|id| !id.is_expired()).unwrap_or(false)
    }

    /// PEM bundle of the cluster CA used to verify remote servers
    fn ca_bundle(&self) -> Option<Vec<u8>>;
}

/// Certificate manager over a fixed identity, replaceable by hand
#[derive(Default)]
pub struct StaticCertificateManager {
    identity: RwLock<Option<Arc<ClientIdentity>>>,
    ca_bundle: Option<Vec<u8>>,
}

impl StaticCertificateManager {
    pub fn new(identity: Option<ClientIdentity>, ca_bundle: Option<Vec<u8>>) -> Self {
        Self {
            identity: RwLock::new(identity.map(Arc::new)),
            ca_bundle,
        }
    }

    /// Swap in a new identity
    pub fn set(&self, identity: Option<ClientIdentity>) {
        if let Ok(mut current) = self.identity.write() {
            *current = identity.map(Arc::new);
        }
    }
}

impl CertificateManager for StaticCertificateManager {
    fn current(&self) -> Option<Arc<ClientIdentity>> {
        self.identity.read().ok().and_then(|id| id.clone())
    }

    fn ca_bundle(&self) -> Option<Vec<u8>> {
        self.ca_bundle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;

    fn identity(fingerprint: &str, not_after: DateTime<Utc>) -> ClientIdentity {
        ClientIdentity {
            cert_chain: vec![CertificateDer::from(vec![1, 2, 3])],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(vec![4, 5, 6])),
            not_before: not_after - chrono::Duration::hours(10),
            not_after,
            fingerprint: fingerprint.to_string(),
        }
    }

    #[test]
    fn test_static_manager_validity() {
        let manager = StaticCertificateManager::new(None, None);
        assert!(manager.current().is_none());
        assert!(!manager.not_expired());

        manager.set(Some(identity("aa", Utc::now() + chrono::Duration::hours(1))));
        assert!(manager.not_expired());
        assert_eq!(manager.current().unwrap().fingerprint, "aa");

        manager.set(Some(identity("bb", Utc::now() - chrono::Duration::hours(1))));
        assert!(!manager.not_expired());
    }

    #[test]
    fn test_elapsed_fraction() {
        let not_after = Utc::now();
        let id = identity("cc", not_after);
        assert_eq!(id.elapsed_fraction(not_after - chrono::Duration::hours(10)), 0.0);
        assert!((id.elapsed_fraction(not_after - chrono::Duration::hours(2)) - 0.8).abs() < 1e-9);
        assert_eq!(id.elapsed_fraction(not_after + chrono::Duration::hours(1)), 1.0);
    }
}
