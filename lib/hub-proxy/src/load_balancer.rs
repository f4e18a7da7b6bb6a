//! Backend selection across remote servers

use hub_core::config::LbMode;
use hub_core::{CertificateManager, RemoteServer, RequestContext};
use hyper::{Request, Response, StatusCode};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::health_check::HealthChecker;
use crate::remote::RemoteProxy;
use crate::responses::{status_response, BoxBody};

/// Whether remote routing is currently possible
pub trait HealthGate: Send + Sync {
    fn is_healthy(&self) -> bool;

    /// Some healthy server for the hub's own calls
    fn healthy_server(&self) -> Option<Arc<RemoteServer>>;
}

pub struct LoadBalancer {
    backends: Vec<Arc<RemoteProxy>>,
    mode: LbMode,
    /// Index of the last round-robin pick
    last: Mutex<usize>,
    checker: Arc<dyn HealthChecker>,
    certs: Arc<dyn CertificateManager>,
}

impl LoadBalancer {
    pub fn new(
        backends: Vec<Arc<RemoteProxy>>,
        mode: LbMode,
        checker: Arc<dyn HealthChecker>,
        certs: Arc<dyn CertificateManager>,
    ) -> Self {
        let last = backends.len().saturating_sub(1);
        Self {
            backends,
            mode,
            last: Mutex::new(last),
            checker,
            certs,
        }
    }

    pub fn backends(&self) -> &[Arc<RemoteProxy>] {
        &self.backends
    }

    fn backend_healthy(&self, backend: &RemoteProxy) -> bool {
        self.checker.is_healthy(backend.server().address())
    }

    /// Select a healthy backend
    ///
    /// Round-robin resumes after the previous pick; priority always scans
    /// from the first configured server.
    pub fn pick(&self) -> Option<Arc<RemoteProxy>> {
        let n = self.backends.len();
        if n == 0 {
            return None;
        }
        match self.mode {
            LbMode::Priority => self.backends.iter().find(|b| self.backend_healthy(b)).cloned(),
            LbMode::RoundRobin => {
                let mut last = match self.last.lock() {
                    Ok(last) => last,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for offset in 1..=n {
                    let idx = (*last + offset) % n;
                    if self.backend_healthy(&self.backends[idx]) {
                        *last = idx;
                        return Some(self.backends[idx].clone());
                    }
                }
                None
            }
        }
    }

    pub async fn handle(&self, ctx: Arc<RequestContext>, req: Request<BoxBody>) -> Response<BoxBody> {
        match self.pick() {
            Some(backend) => {
                debug!(
                    server = %backend.server().url(),
                    trace_id = %ctx.trace_id,
                    "Proxying {} {}",
                    ctx.verb(),
                    ctx.info.path
                );
                backend.handle(ctx, req).await
            }
            None => {
                warn!(trace_id = %ctx.trace_id, "No healthy remote server for {}", ctx.info.path);
                status_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    "no healthy remote server, fall back to the local cache",
                )
            }
        }
    }
}

impl HealthGate for LoadBalancer {
    /// Requires a valid client identity as well as a healthy backend
    fn is_healthy(&self) -> bool {
        self.certs.not_expired() && self.backends.iter().any(|b| self.backend_healthy(b))
    }

    fn healthy_server(&self) -> Option<Arc<RemoteServer>> {
        self.backends
            .iter()
            .find(|b| self.backend_healthy(b))
            .map(|b| b.server().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health_check::FakeHealthChecker;
    use crate::metrics::MetricsCollector;
    use crate::transport::TransportManager;
    use chrono::Utc;
    use hub_core::identity::StaticCertificateManager;
    use hub_core::ClientIdentity;
    use hub_filter::FilterManager;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::time::Duration;

    const A: &str = "10.0.0.1:6443";
    const B: &str = "10.0.0.2:6443";
    const C: &str = "10.0.0.3:6443";

    fn identity(valid_for: chrono::Duration) -> ClientIdentity {
        let now = Utc::now();
        ClientIdentity {
            cert_chain: vec![CertificateDer::from(vec![1])],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(vec![2])),
            not_before: now - chrono::Duration::hours(1),
            not_after: now + valid_for,
            fingerprint: "ff".to_string(),
        }
    }

    fn balancer(mode: LbMode, checker: Arc<FakeHealthChecker>) -> (LoadBalancer, Arc<StaticCertificateManager>) {
        let certs = Arc::new(StaticCertificateManager::new(Some(identity(chrono::Duration::hours(1))), None));
        let transports = Arc::new(TransportManager::new(certs.clone(), Duration::from_secs(1)).unwrap());
        let filters = Arc::new(FilterManager::from_filters(Vec::new()));
        let metrics = MetricsCollector::new().unwrap();
        let backends = [A, B, C]
            .iter()
            .map(|addr| {
                let server = Arc::new(RemoteServer::new(&format!("https://{}", addr), 1).unwrap());
                Arc::new(RemoteProxy::new(server, transports.clone(), None, filters.clone(), metrics.clone()))
            })
            .collect();
        (LoadBalancer::new(backends, mode, checker, certs.clone()), certs)
    }

    fn picked(lb: &LoadBalancer) -> Option<String> {
        lb.pick().map(|b| b.server().address().to_string())
    }

    #[test]
    fn test_round_robin_cycle() {
        let checker = Arc::new(FakeHealthChecker::new(true));
        let (lb, _) = balancer(LbMode::RoundRobin, checker.clone());

        let cycle: Vec<_> = (0..3).map(|_| picked(&lb).unwrap()).collect();
        assert_eq!(cycle, vec![A, B, C]);

        // Partial cycle, then B drops out and comes back.
        assert_eq!(picked(&lb).as_deref(), Some(A));
        checker.set_server(B, false);
        assert_eq!(picked(&lb).as_deref(), Some(C));
        assert_eq!(picked(&lb).as_deref(), Some(A));
        checker.set_server(B, true);
        assert_eq!(picked(&lb).as_deref(), Some(B));
    }

    #[test]
    fn test_priority_prefers_first_healthy() {
        let checker = Arc::new(FakeHealthChecker::new(true));
        checker.set_server(A, false);
        let (lb, _) = balancer(LbMode::Priority, checker);
        for _ in 0..5 {
            assert_eq!(picked(&lb).as_deref(), Some(B));
        }
    }

    #[test]
    fn test_no_healthy_backend() {
        let checker = Arc::new(FakeHealthChecker::new(false));
        let (lb, _) = balancer(LbMode::RoundRobin, checker);
        assert!(lb.pick().is_none());
        assert!(!lb.is_healthy());
        assert!(lb.healthy_server().is_none());
    }

    #[test]
    fn test_expired_identity_is_unhealthy() {
        let checker = Arc::new(FakeHealthChecker::new(true));
        let (lb, certs) = balancer(LbMode::RoundRobin, checker);
        assert!(lb.is_healthy());

        certs.set(Some(identity(-chrono::Duration::minutes(1))));
        assert!(!lb.is_healthy());
        // Individual backends remain selectable.
        assert!(lb.pick().is_some());

        certs.set(None);
        assert!(!lb.is_healthy());
    }

    #[tokio::test]
    async fn test_handle_without_backend_returns_500() {
        let checker = Arc::new(FakeHealthChecker::new(false));
        let (lb, _) = balancer(LbMode::RoundRobin, checker);
        let ctx = Arc::new(RequestContext::new(Default::default()));
        let req = Request::get("/api/v1/pods").body(crate::responses::empty()).unwrap();
        let response = lb.handle(ctx, req).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
