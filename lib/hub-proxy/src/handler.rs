//! Entry point of proxied and admin requests

use hub_cache::CacheManager;
use hub_core::{HubConfig, RequestContext, RequestInfo};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, error};

use crate::health_check::HealthChecker;
use crate::load_balancer::{HealthGate, LoadBalancer};
use crate::local::LocalProxy;
use crate::metrics::MetricsCollector;
use crate::middleware::{
    CacheHeaderMiddleware, ComponentMiddleware, ContentTypeMiddleware, ListSelectorMiddleware,
    MaxInFlightMiddleware, MiddlewareChain, RequestInfoMiddleware, TimeoutMiddleware,
};
use crate::responses::{
    gateway_timeout, hold_until_end, incoming, internal_error, not_found, text_response, BoxBody,
};
use crate::tracing::TracingMiddleware;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Route {
    Remote,
    Local,
}

impl Route {
    fn as_str(&self) -> &'static str {
        match self {
            Route::Remote => "remote",
            Route::Local => "local",
        }
    }
}

/// Build the request chain in execution order
pub fn build_chain(config: &HubConfig, metrics: &MetricsCollector) -> MiddlewareChain {
    let caching = config.enable_caching;
    let mut chain = MiddlewareChain::new()
        .add(TracingMiddleware::new())
        .add(RequestInfoMiddleware)
        .add(ComponentMiddleware)
        .add(MaxInFlightMiddleware::new(config.max_in_flight, metrics.clone()));
    if caching {
        chain = chain.add(ListSelectorMiddleware);
    }
    chain = chain.add(TimeoutMiddleware::new(config.request_timeout()));
    if caching {
        chain = chain.add(CacheHeaderMiddleware);
    }
    chain.add(ContentTypeMiddleware::new(caching))
}

/// Runs the chain, then routes to the load balancer or the local cache
pub struct HubHandler {
    chain: Arc<MiddlewareChain>,
    lb: Arc<LoadBalancer>,
    local: Arc<LocalProxy>,
    checker: Arc<dyn HealthChecker>,
    metrics: MetricsCollector,
}

impl HubHandler {
    pub fn new(
        chain: Arc<MiddlewareChain>,
        lb: Arc<LoadBalancer>,
        local: Arc<LocalProxy>,
        checker: Arc<dyn HealthChecker>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            chain,
            lb,
            local,
            checker,
            metrics,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<BoxBody>, Infallible> {
        let (mut parts, body) = req.into_parts();
        let mut ctx = RequestContext::new(RequestInfo::default());

        match self.chain.on_request(&mut ctx, &mut parts).await {
            Ok(None) => {}
            Ok(Some(response)) => {
                self.finish(&ctx, response.status(), None).await;
                return Ok(response);
            }
            Err(e) => {
                let message = e.to_string();
                error!(trace_id = %ctx.trace_id, "Middleware failed: {}", message);
                let _ = self.chain.on_error(&ctx, &message).await;
                return Ok(internal_error(&message));
            }
        }

        // The admission slot follows the response body, not the context.
        let admission = ctx.admission.take();
        let ctx = Arc::new(ctx);
        let req = Request::from_parts(parts, incoming(body));

        // Kubelet heartbeats feed the health signal, so they never depend on it.
        let route = if ctx.is_kubelet_lease_request() {
            self.checker.update_heartbeat();
            Route::Local
        } else if self.lb.is_healthy() {
            Route::Remote
        } else {
            Route::Local
        };
        debug!(trace_id = %ctx.trace_id, route = route.as_str(), "Routing {} {}", ctx.verb(), ctx.info.path);

        let work = async {
            match route {
                Route::Remote => self.lb.handle(ctx.clone(), req).await,
                Route::Local => self.local.handle(ctx.clone(), req).await,
            }
        };
        let response = match ctx.timeout.filter(|_| !ctx.is_long_running()) {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(response) => response,
                Err(_) => {
                    let message = format!("request did not complete within {:?}", deadline);
                    let _ = self.chain.on_error(&ctx, &message).await;
                    gateway_timeout(message)
                }
            },
            None => work.await,
        };

        self.finish(&ctx, response.status(), Some(route)).await;
        Ok(match admission {
            Some(slot) => response.map(|body| hold_until_end(body, slot)),
            None => response,
        })
    }

    async fn finish(&self, ctx: &RequestContext, status: hyper::StatusCode, route: Option<Route>) {
        if let Err(e) = self.chain.on_response(ctx, status).await {
            error!(trace_id = %ctx.trace_id, "Response middleware failed: {}", e);
        }
        if let Some(route) = route {
            self.metrics.record_request(
                &ctx.component,
                ctx.verb().as_str(),
                ctx.resource(),
                route.as_str(),
                ctx.started.elapsed().as_secs_f64(),
            );
        }
    }
}

/// Health and metrics endpoints of the admin listener
pub struct AdminHandler {
    gate: Arc<dyn HealthGate>,
    cache: Option<Arc<CacheManager>>,
    metrics: MetricsCollector,
}

impl AdminHandler {
    pub fn new(gate: Arc<dyn HealthGate>, cache: Option<Arc<CacheManager>>, metrics: MetricsCollector) -> Self {
        Self { gate, cache, metrics }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<BoxBody>, Infallible> {
        if req.method() != Method::GET {
            return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed\n"));
        }
        let response = match req.uri().path() {
            "/v1/healthz" => text_response(StatusCode::OK, "text/plain", "OK\n"),
            "/v1/readyz" => {
                let has_cache = self.cache.as_ref().map(|c| c.has_cache()).unwrap_or(false);
                if self.gate.is_healthy() || has_cache {
                    text_response(StatusCode::OK, "text/plain", "OK\n")
                } else {
                    text_response(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not ready\n")
                }
            }
            "/metrics" => match self.metrics.gather() {
                Ok(body) => text_response(StatusCode::OK, "text/plain; version=0.0.4", body),
                Err(e) => internal_error(&format!("gathering metrics: {}", e)),
            },
            other => not_found(format!("{} not found", other)),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::RemoteServer;
    use http_body_util::BodyExt;

    struct Gate(bool);

    impl HealthGate for Gate {
        fn is_healthy(&self) -> bool {
            self.0
        }

        fn healthy_server(&self) -> Option<Arc<RemoteServer>> {
            None
        }
    }

    #[test]
    fn test_chain_order() {
        let metrics = MetricsCollector::new().unwrap();
        let chain = build_chain(&HubConfig::default(), &metrics);
        assert_eq!(
            chain.names(),
            vec![
                "TracingMiddleware",
                "RequestInfoMiddleware",
                "ComponentMiddleware",
                "MaxInFlightMiddleware",
                "ListSelectorMiddleware",
                "TimeoutMiddleware",
                "CacheHeaderMiddleware",
                "ContentTypeMiddleware",
            ]
        );

        let config = HubConfig {
            enable_caching: false,
            ..HubConfig::default()
        };
        assert_eq!(build_chain(&config, &metrics).names().len(), 6);
    }

    #[tokio::test]
    async fn test_admin_endpoints() {
        let metrics = MetricsCollector::new().unwrap();
        let admin = AdminHandler::new(Arc::new(Gate(false)), None, metrics.clone());

        let get = |path: &str| Request::get(path).body(()).unwrap();
        assert_eq!(admin.handle(get("/v1/healthz")).await.unwrap().status(), StatusCode::OK);
        assert_eq!(
            admin.handle(get("/v1/readyz")).await.unwrap().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(admin.handle(get("/nope")).await.unwrap().status(), StatusCode::NOT_FOUND);

        metrics.rejected_total.inc();
        let response = admin.handle(get("/metrics")).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("edge_hub_rejected_requests_total 1"));

        let ready = AdminHandler::new(Arc::new(Gate(true)), None, metrics);
        assert_eq!(ready.handle(get("/v1/readyz")).await.unwrap().status(), StatusCode::OK);
    }
}
