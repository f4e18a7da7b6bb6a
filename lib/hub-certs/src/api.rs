//! Control-plane calls needed to obtain a client certificate

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::time::Duration;
use tracing::{debug, info};

use crate::kubeconfig::Kubeconfig;
use crate::{CertError, Result};

/// Signer issuing node client certificates
pub const KUBELET_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client-kubelet";

const CLUSTER_INFO_PATH: &str = "/api/v1/namespaces/kube-public/configmaps/cluster-info";
const CSR_PATH: &str = "/apis/certificates.k8s.io/v1/certificatesigningrequests";

/// How the hub authenticates a certificate request
pub enum Credential {
    /// Bootstrap token
    Token(String),
    /// PEM with the current client certificate and key
    ClientCert(Vec<u8>),
}

#[async_trait]
pub trait CertificateApi: Send + Sync {
    /// CA bundle published in `kube-public/cluster-info`, fetched unverified
    async fn cluster_ca(&self, server: &str) -> Result<Vec<u8>>;

    /// Submit a CSR and wait for the issued certificate PEM
    async fn request_certificate(
        &self,
        server: &str,
        ca_pem: &[u8],
        credential: &Credential,
        csr_pem: &str,
    ) -> Result<Vec<u8>>;
}

/// [`CertificateApi`] over reqwest
pub struct HttpCertificateApi {
    timeout: Duration,
    poll_interval: Duration,
    max_polls: u32,
}

impl HttpCertificateApi {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Duration::from_secs(2),
            max_polls: 150,
        }
    }

    fn client(&self, ca_pem: &[u8], credential: &Credential) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(self.timeout)
            .add_root_certificate(reqwest::Certificate::from_pem(ca_pem)?);
        if let Credential::ClientCert(pem) = credential {
            builder = builder.identity(reqwest::Identity::from_pem(pem)?);
        }
        Ok(builder.build()?)
    }

    fn authorize(request: reqwest::RequestBuilder, credential: &Credential) -> reqwest::RequestBuilder {
        match credential {
            Credential::Token(token) => request.bearer_auth(token),
            Credential::ClientCert(_) => request,
        }
    }
}

impl Default for HttpCertificateApi {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl CertificateApi for HttpCertificateApi {
    async fn cluster_ca(&self, server: &str) -> Result<Vec<u8>> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        let url = format!("{}{}", server.trim_end_matches('/'), CLUSTER_INFO_PATH);
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(CertError::UnexpectedStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        let cm: ConfigMap = response.json().await?;
        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get("kubeconfig"))
            .ok_or_else(|| CertError::Bootstrap("cluster-info has no kubeconfig".to_string()))?;
        Kubeconfig::parse(raw)?
            .ca_data()?
            .ok_or_else(|| CertError::Bootstrap("cluster-info kubeconfig has no CA data".to_string()))
    }

    async fn request_certificate(
        &self,
        server: &str,
        ca_pem: &[u8],
        credential: &Credential,
        csr_pem: &str,
    ) -> Result<Vec<u8>> {
        let client = self.client(ca_pem, credential)?;
        let base = format!("{}{}", server.trim_end_matches('/'), CSR_PATH);

        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                generate_name: Some("csr-".to_string()),
                ..ObjectMeta::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(csr_pem.as_bytes().to_vec()),
                signer_name: KUBELET_CLIENT_SIGNER.to_string(),
                usages: Some(vec![
                    "digital signature".to_string(),
                    "key encipherment".to_string(),
                    "client auth".to_string(),
                ]),
                ..CertificateSigningRequestSpec::default()
            },
            status: None,
        };

        let response = Self::authorize(client.post(&base), credential).json(&csr).send().await?;
        if !response.status().is_success() {
            return Err(CertError::UnexpectedStatus {
                url: base,
                status: response.status().as_u16(),
            });
        }
        let created: CertificateSigningRequest = response.json().await?;
        let name = created
            .metadata
            .name
            .ok_or_else(|| CertError::Bootstrap("created CSR has no name".to_string()))?;
        info!("Submitted certificate signing request {}", name);

        let url = format!("{}/{}", base, name);
        for attempt in 1..=self.max_polls {
            let response = Self::authorize(client.get(&url), credential).send().await?;
            if response.status().is_success() {
                let csr: CertificateSigningRequest = response.json().await?;
                let status = csr.status.unwrap_or_default();
                let failed = status
                    .conditions
                    .iter()
                    .flatten()
                    .any(|c| (c.type_ == "Denied" || c.type_ == "Failed") && c.status == "True");
                if failed {
                    return Err(CertError::CsrDenied(name));
                }
                if let Some(cert) = status.certificate.filter(|c| !c.0.is_empty()) {
                    return Ok(cert.0);
                }
            }
            debug!("CSR {} not issued yet (attempt {})", name, attempt);
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(CertError::CsrTimeout(name))
    }
}
