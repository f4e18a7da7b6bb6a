//! Upstream transports and connection tracking
//!
//! Two pooled clients are kept: one presenting the hub's client certificate
//! and one for requests that carry their own bearer token. Every connection
//! they open is registered under its destination address so all connections
//! to one server can be force-closed, and both pools are rebuilt whenever the
//! client identity changes so new requests handshake with the new identity.

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use hub_core::CertificateManager;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tower::Service;
use tracing::{debug, error, info};

use crate::responses::BoxBody;
use crate::tls::client_config;

pub type HttpClient = Client<TrackingConnector, BoxBody>;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cancellation handles of open connections, per destination address
#[derive(Default)]
pub struct ConnectionRegistry {
    addresses: Mutex<HashMap<String, CancellationToken>>,
}

impl ConnectionRegistry {
    /// Token for a new connection to `address`
    fn token(&self, address: &str) -> CancellationToken {
        let mut addresses = match self.addresses.lock() {
            Ok(addresses) => addresses,
            Err(poisoned) => poisoned.into_inner(),
        };
        let parent = addresses.entry(address.to_string()).or_default();
        if parent.is_cancelled() {
            *parent = CancellationToken::new();
        }
        parent.child_token()
    }

    /// Abort every open connection to `address`
    pub fn close(&self, address: &str) {
        let parent = self.addresses.lock().ok().and_then(|mut a| a.remove(address));
        if let Some(parent) = parent {
            parent.cancel();
            info!("Closed tracked connections to {}", address);
        }
    }

    pub fn close_all(&self) {
        let parents: Vec<(String, CancellationToken)> = self
            .addresses
            .lock()
            .map(|mut a| a.drain().collect())
            .unwrap_or_default();
        for (address, parent) in parents {
            parent.cancel();
            debug!("Closed tracked connections to {}", address);
        }
    }
}

/// Plain or TLS stream to an upstream
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A stream that fails all I/O once its address is closed
pub struct TrackedStream {
    inner: MaybeTlsStream,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl TrackedStream {
    fn new(inner: MaybeTlsStream, token: CancellationToken) -> Self {
        Self {
            inner,
            closed: Box::pin(token.cancelled_owned()),
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        self.closed
            .as_mut()
            .poll(cx)
            .is_ready()
            .then(|| io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by hub"))
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Connection handed to the hyper client
pub struct TrackedConnection(TokioIo<TrackedStream>);

impl Read for TrackedConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: ReadBufCursor<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl Write for TrackedConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl Connection for TrackedConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector that dials TCP, optionally wraps TLS and registers the result
#[derive(Clone)]
pub struct TrackingConnector {
    tls: Arc<ClientConfig>,
    registry: Arc<ConnectionRegistry>,
    connect_timeout: Duration,
}

impl TrackingConnector {
    pub fn new(tls: Arc<ClientConfig>, registry: Arc<ConnectionRegistry>, connect_timeout: Duration) -> Self {
        Self {
            tls,
            registry,
            connect_timeout,
        }
    }
}

impl Service<Uri> for TrackingConnector {
    type Response = TrackedConnection;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<TrackedConnection>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = self.tls.clone();
        let registry = self.registry.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let secure = uri.scheme_str() == Some("https");
            let host = uri
                .host()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no host in {}", uri)))?;
            let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
            let address = format!("{}:{}", host, port);

            let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", address)))??;
            tcp.set_nodelay(true)?;

            let stream = if secure {
                let name = ServerName::try_from(host.clone())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let tls_stream = TlsConnector::from(tls).connect(name, tcp).await?;
                MaybeTlsStream::Tls(Box::new(tls_stream))
            } else {
                MaybeTlsStream::Plain(tcp)
            };

            debug!("Opened tracked connection to {}", address);
            let token = registry.token(&address);
            Ok(TrackedConnection(TokioIo::new(TrackedStream::new(stream, token))))
        })
    }
}

/// The certificate and bearer transports shared by all remote proxies
pub struct TransportManager {
    certs: Arc<dyn CertificateManager>,
    registry: Arc<ConnectionRegistry>,
    connect_timeout: Duration,
    cert_client: ArcSwap<HttpClient>,
    bearer_client: ArcSwap<HttpClient>,
    last_fingerprint: Mutex<Option<String>>,
}

impl TransportManager {
    pub fn new(certs: Arc<dyn CertificateManager>, connect_timeout: Duration) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::default());
        let cert_client = build_client(&certs, true, &registry, connect_timeout)?;
        let bearer_client = build_client(&certs, false, &registry, connect_timeout)?;
        let fingerprint = certs.current().map(|id| id.fingerprint.clone());

        Ok(Self {
            certs,
            registry,
            connect_timeout,
            cert_client: ArcSwap::from_pointee(cert_client),
            bearer_client: ArcSwap::from_pointee(bearer_client),
            last_fingerprint: Mutex::new(fingerprint),
        })
    }

    /// Client presenting the hub's client certificate
    pub fn cert_client(&self) -> Arc<HttpClient> {
        self.cert_client.load_full()
    }

    /// Client for requests authenticated by their own bearer token
    pub fn bearer_client(&self) -> Arc<HttpClient> {
        self.bearer_client.load_full()
    }

    pub fn certificates(&self) -> &Arc<dyn CertificateManager> {
        &self.certs
    }

    /// Force-close all connections to one `host:port`
    pub fn close_address(&self, address: &str) {
        self.registry.close(address);
    }

    /// Replace both pools
    ///
    /// Idle connections go away with the old pools; responses already being
    /// streamed keep their connection until they complete.
    pub fn rebuild(&self) -> Result<()> {
        let cert_client = build_client(&self.certs, true, &self.registry, self.connect_timeout)?;
        let bearer_client = build_client(&self.certs, false, &self.registry, self.connect_timeout)?;
        self.cert_client.store(Arc::new(cert_client));
        self.bearer_client.store(Arc::new(bearer_client));
        debug!("Rebuilt upstream connection pools");
        Ok(())
    }

    /// Rebuild the pools if the client identity changed since the last check
    pub fn check_rotation(&self) -> Result<bool> {
        let current = self.certs.current().map(|id| id.fingerprint.clone());
        let mut last = self
            .last_fingerprint
            .lock()
            .map_err(|_| anyhow!("fingerprint lock poisoned"))?;
        if *last == current {
            return Ok(false);
        }
        info!(
            "Client certificate changed from {:?} to {:?}; dropping pooled connections",
            last.as_deref(),
            current.as_deref()
        );
        self.rebuild()?;
        *last = current;
        Ok(true)
    }

    /// Watch for identity changes until shutdown
    pub async fn run_rotation_watch(self: Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        info!("Transport rotation watcher started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_rotation() {
                        error!("Failed to rebuild transports: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Transport rotation watcher shutting down");
                    return;
                }
            }
        }
    }
}

fn build_client(
    certs: &Arc<dyn CertificateManager>,
    present_identity: bool,
    registry: &Arc<ConnectionRegistry>,
    connect_timeout: Duration,
) -> Result<HttpClient> {
    let tls = Arc::new(client_config(certs, present_identity)?);
    let connector = TrackingConnector::new(tls, registry.clone(), connect_timeout);
    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(connector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::identity::StaticCertificateManager;
    use hub_core::ClientIdentity;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn identity(fingerprint: &str) -> ClientIdentity {
        let now = chrono::Utc::now();
        ClientIdentity {
            cert_chain: vec![CertificateDer::from(vec![1, 2, 3])],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(vec![4, 5, 6])),
            not_before: now - chrono::Duration::hours(1),
            not_after: now + chrono::Duration::hours(1),
            fingerprint: fingerprint.to_string(),
        }
    }

    async fn echo_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (address, handle)
    }

    fn connector(registry: &Arc<ConnectionRegistry>) -> TrackingConnector {
        let certs: Arc<dyn CertificateManager> = Arc::new(StaticCertificateManager::default());
        let tls = Arc::new(client_config(&certs, false).unwrap());
        TrackingConnector::new(tls, registry.clone(), Duration::from_secs(1))
    }

    async fn open(connector: &mut TrackingConnector, address: &str) -> TrackedStream {
        let uri: Uri = format!("http://{}/", address).parse().unwrap();
        connector.call(uri).await.unwrap().0.into_inner()
    }

    #[tokio::test]
    async fn test_close_address_only_affects_that_address() {
        let (a, _ha) = echo_server().await;
        let (b, _hb) = echo_server().await;
        let registry = Arc::new(ConnectionRegistry::default());
        let mut connector = connector(&registry);

        let mut to_a = open(&mut connector, &a).await;
        let mut to_b = open(&mut connector, &b).await;

        registry.close(&a);

        let mut buf = [0u8; 4];
        assert!(to_a.write_all(b"ping").await.is_err());
        to_b.write_all(b"ping").await.unwrap();
        to_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // New connections to a closed address are tracked afresh.
        let mut again = open(&mut connector, &a).await;
        again.write_all(b"pong").await.unwrap();
        again.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_rotation_detects_identity_change() {
        let certs = Arc::new(StaticCertificateManager::default());
        let manager = TransportManager::new(certs.clone(), Duration::from_secs(1)).unwrap();
        assert!(!manager.check_rotation().unwrap());

        let before = manager.cert_client();
        certs.set(Some(identity("abc")));
        assert!(manager.check_rotation().unwrap());
        assert!(!Arc::ptr_eq(&before, &manager.cert_client()));
        assert!(!manager.check_rotation().unwrap());
    }
}
