//! Client certificate management for the edge hub
//!
//! Obtains the hub's client identity through the bootstrap-token CSR flow,
//! keeps it on disk under the hub root directory and rotates it before it
//! expires.

pub mod api;
pub mod error;
pub mod kubeconfig;
pub mod manager;
pub mod pki;

pub use api::{CertificateApi, Credential, HttpCertificateApi};
pub use error::{CertError, Result};
pub use manager::{CertManagerConfig, HubCertificateManager};

use std::path::Path;

/// Write a file atomically, owner-readable only when `private`
pub(crate) fn write_file(path: &Path, content: &[u8], private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = private;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
