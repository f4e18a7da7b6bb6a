use thiserror::Error;

pub type Result<T> = std::result::Result<T, CertError>;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Cluster CA does not match any configured pin")]
    PinMismatch,

    #[error("Certificate signing request {0} was denied")]
    CsrDenied(String),

    #[error("Certificate signing request {0} was not issued in time")]
    CsrTimeout(String),

    #[error("Key generation error: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response from {url}: {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
