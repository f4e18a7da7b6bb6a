//! Key generation, certificate parsing and CA pinning

use chrono::{DateTime, Utc};
use hub_core::ClientIdentity;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::io::BufReader;
use x509_parser::prelude::*;

use crate::{CertError, Result};

/// Rotate once this fraction of the validity period has elapsed
pub const ROTATION_THRESHOLD: f64 = 0.80;

/// Organization of node client certificates
pub const NODES_GROUP: &str = "system:nodes";

/// A fresh private key and the CSR for it, both PEM
pub struct CsrBundle {
    pub key_pem: String,
    pub csr_pem: String,
}

/// Generate a key and CSR for the node's client identity
pub fn generate_csr(node_name: &str) -> Result<CsrBundle> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(format!("system:node:{}", node_name)),
    );
    dn.push(DnType::OrganizationName, DnValue::Utf8String(NODES_GROUP.to_string()));
    params.distinguished_name = dn;

    let csr = params.serialize_request(&key_pair)?;
    Ok(CsrBundle {
        key_pem: key_pair.serialize_pem(),
        csr_pem: csr.pem()?,
    })
}

/// Parse PEM certificates
pub fn load_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidCertificate(format!("failed to parse certificates: {}", e)))
}

/// Build a client identity from a PEM holding the chain and its key
pub fn parse_identity(pem: &[u8]) -> Result<ClientIdentity> {
    let cert_chain = load_certificates(pem)?;
    let leaf = cert_chain
        .first()
        .ok_or_else(|| CertError::InvalidCertificate("no certificate in PEM".to_string()))?;

    let mut reader = BufReader::new(pem);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CertError::InvalidCertificate(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| CertError::InvalidCertificate("no private key in PEM".to_string()))?;

    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| CertError::InvalidCertificate(format!("failed to parse certificate: {}", e)))?;
    let not_before = timestamp(cert.validity().not_before.timestamp())?;
    let not_after = timestamp(cert.validity().not_after.timestamp())?;

    Ok(ClientIdentity {
        fingerprint: hex::encode(Sha256::digest(leaf.as_ref())),
        cert_chain,
        key,
        not_before,
        not_after,
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertError::InvalidCertificate(format!("validity out of range: {}", secs)))
}

/// Public key pin of a CA certificate, `sha256:<hex>` over its SPKI
pub fn ca_pin(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| CertError::InvalidCertificate(format!("failed to parse CA certificate: {}", e)))?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(cert.public_key().raw))))
}

/// Require that some certificate of the bundle matches some pin
///
/// An empty pin list accepts any bundle.
pub fn verify_ca_pins(ca_pem: &[u8], pins: &[String]) -> Result<()> {
    if pins.is_empty() {
        return Ok(());
    }
    let pins: Vec<String> = pins.iter().map(|p| p.trim().to_lowercase()).collect();
    for cert in load_certificates(ca_pem)? {
        if pins.contains(&ca_pin(cert.as_ref())?) {
            return Ok(());
        }
    }
    Err(CertError::PinMismatch)
}

pub fn needs_rotation(identity: &ClientIdentity, now: DateTime<Utc>) -> bool {
    identity.elapsed_fraction(now) >= ROTATION_THRESHOLD
}


#[cfg(test)]
mod tests {
    use super::testing::TestCa;
    use super::*;

    #[test]
    fn test_csr_subject() {
        let bundle = generate_csr("node-a").unwrap();
        assert!(bundle.csr_pem.contains("BEGIN CERTIFICATE REQUEST"));
        assert!(bundle.key_pem.contains("PRIVATE KEY"));

        let ca = TestCa::new();
        let cert_pem = ca.sign(&bundle.csr_pem);
        let der = load_certificates(cert_pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(der[0].as_ref()).unwrap();
        let cn = cert.subject().iter_common_name().next().unwrap().as_str().unwrap();
        assert_eq!(cn, "system:node:node-a");
    }

    #[test]
    fn test_parse_identity() {
        let ca = TestCa::new();
        let bundle = generate_csr("node-a").unwrap();
        let pem = format!("{}{}", ca.sign(&bundle.csr_pem), bundle.key_pem);

        let identity = parse_identity(pem.as_bytes()).unwrap();
        assert_eq!(identity.cert_chain.len(), 1);
        assert_eq!(identity.fingerprint.len(), 64);
        assert!(!identity.is_expired());
        assert!(!needs_rotation(&identity, Utc::now()));
        assert!(needs_rotation(&identity, identity.not_after));
    }

    #[test]
    fn test_parse_identity_without_key() {
        let ca = TestCa::new();
        assert!(matches!(
            parse_identity(ca.pem().as_bytes()),
            Err(CertError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_ca_pins() {
        let ca = TestCa::new();
        let other = TestCa::new();
        let der = load_certificates(ca.pem().as_bytes()).unwrap();
        let pin = ca_pin(der[0].as_ref()).unwrap();

        assert!(verify_ca_pins(ca.pem().as_bytes(), &[pin.clone()]).is_ok());
        assert!(verify_ca_pins(ca.pem().as_bytes(), &[]).is_ok());
        assert!(matches!(
            verify_ca_pins(other.pem().as_bytes(), &[pin]),
            Err(CertError::PinMismatch)
        ));
    }
}
