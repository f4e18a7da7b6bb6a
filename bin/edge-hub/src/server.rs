use anyhow::{anyhow, Context, Result};
use hub_proxy::{AdminHandler, HubHandler};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))
}

pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| anyhow!("invalid listen address {}: {}", addr, e))
}

/// Same port on another interface address
pub fn rebind(addr: SocketAddr, ip: IpAddr) -> SocketAddr {
    SocketAddr::new(ip, addr.port())
}

/// Host and port in-cluster clients use to reach the control plane through the hub
pub fn master_endpoint(secure: SocketAddr, dummy_ip: Option<IpAddr>) -> (String, i32) {
    let host = dummy_ip.unwrap_or(secure.ip());
    (host.to_string(), i32::from(secure.port()))
}

/// Accept proxy connections until shutdown, with TLS when an acceptor is given
pub async fn serve_proxy(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: Arc<HubHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let local = listener.local_addr().ok();
    info!(
        "Proxy listener on {:?} ({})",
        local,
        if tls.is_some() { "https" } else { "http" }
    );

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting proxy connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.recv() => {
                info!("Proxy listener on {:?} shutting down", local);
                return;
            }
        };

        let handler = handler.clone();
        match tls.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_hub(tls_stream, handler, peer_addr).await,
                        Err(e) => debug!("TLS error from {}: {}", peer_addr, e),
                    }
                });
            }
            None => {
                tokio::spawn(serve_hub(stream, handler, peer_addr));
            }
        }
    }
}

async fn serve_hub<S>(stream: S, handler: Arc<HubHandler>, peer_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { handler.handle(req).await }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("Error serving connection from {}: {}", peer_addr, e);
    }
}

/// Accept admin connections until shutdown
pub async fn serve_admin(listener: TcpListener, admin: Arc<AdminHandler>, mut shutdown: broadcast::Receiver<()>) {
    info!("Admin listener on {:?}", listener.local_addr().ok());
    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting admin connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.recv() => {
                info!("Admin listener shutting down");
                return;
            }
        };

        let admin = admin.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let admin = admin.clone();
                async move { admin.handle(req).await }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Error serving admin connection from {}: {}", peer_addr, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_endpoint_prefers_dummy_ip() {
        let secure = parse_addr("127.0.0.1:10268").unwrap();
        assert_eq!(master_endpoint(secure, None), ("127.0.0.1".to_string(), 10268));

        let dummy: IpAddr = "169.254.2.1".parse().unwrap();
        assert_eq!(master_endpoint(secure, Some(dummy)), ("169.254.2.1".to_string(), 10268));
        assert_eq!(rebind(secure, dummy), parse_addr("169.254.2.1:10268").unwrap());
    }

    #[test]
    fn test_parse_addr_rejects_garbage() {
        assert!(parse_addr("localhost").is_err());
    }
}
