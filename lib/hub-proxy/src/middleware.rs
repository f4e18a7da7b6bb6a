//! Middleware chain run on every proxied request
//!
//! Each middleware fills in part of the [`RequestContext`] and may rewrite
//! the request head. Returning a response from `on_request` answers the
//! request immediately and skips the rest of the chain and the proxy.

use anyhow::Result;
use async_trait::async_trait;
use hub_core::request::query_param;
use hub_core::{ListSelector, RequestContext, RequestInfo};
use hyper::header::{HeaderValue, ACCEPT, USER_AGENT};
use hyper::http::request;
use hyper::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, span, warn, Instrument, Level};

use crate::metrics::MetricsCollector;
use crate::responses::{bad_request, too_many_requests, BoxBody};

/// Header carrying an explicit cache decision from the client
pub const EDGE_CACHE_HEADER: &str = "edge-cache";

const JSON: &str = "application/json";

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called before the request is routed
    async fn on_request(
        &self,
        _ctx: &mut RequestContext,
        _parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        Ok(None)
    }

    /// Called once the response head is known
    async fn on_response(&self, _ctx: &RequestContext, _status: StatusCode) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _ctx: &RequestContext, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
#[derive(Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middleware.iter().map(|mw| mw.name()).collect()
    }

    /// Run every middleware in order, stopping at the first early response
    pub async fn on_request(
        &self,
        ctx: &mut RequestContext,
        parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            if let Some(response) = mw.on_request(ctx, parts).instrument(span).await? {
                debug!("Request answered by {}", mw.name());
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    /// Process the response in reverse order
    pub async fn on_response(&self, ctx: &RequestContext, status: StatusCode) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            mw.on_response(ctx, status).await?;
        }
        Ok(())
    }

    pub async fn on_error(&self, ctx: &RequestContext, error: &str) -> Result<()> {
        for mw in &self.middleware {
            mw.on_error(ctx, error).await?;
        }
        Ok(())
    }
}

/// Resolves group, version, resource and verb
pub struct RequestInfoMiddleware;

#[async_trait]
impl Middleware for RequestInfoMiddleware {
    fn name(&self) -> &'static str {
        "RequestInfoMiddleware"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        ctx.info = RequestInfo::resolve(&parts.method, &parts.uri);
        Ok(None)
    }
}

/// Identifies the calling component from its user agent
pub struct ComponentMiddleware;

impl ComponentMiddleware {
    /// `kubelet/v1.31.0 (linux/amd64)` → `kubelet`
    pub fn component(user_agent: &str) -> String {
        user_agent
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

#[async_trait]
impl Middleware for ComponentMiddleware {
    fn name(&self) -> &'static str {
        "ComponentMiddleware"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        ctx.component = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(Self::component)
            .unwrap_or_default();
        Ok(None)
    }
}

/// Admission gate bounding concurrent non-long-running requests
pub struct MaxInFlightMiddleware {
    limit: usize,
    slots: Arc<Semaphore>,
    metrics: MetricsCollector,
}

impl MaxInFlightMiddleware {
    pub fn new(limit: usize, metrics: MetricsCollector) -> Self {
        Self {
            limit,
            slots: Arc::new(Semaphore::new(limit)),
            metrics,
        }
    }

    fn in_use(&self) -> i64 {
        (self.limit - self.slots.available_permits()) as i64
    }
}

#[async_trait]
impl Middleware for MaxInFlightMiddleware {
    fn name(&self) -> &'static str {
        "MaxInFlightMiddleware"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        _parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        if ctx.is_long_running() {
            return Ok(None);
        }
        match self.slots.clone().try_acquire_owned() {
            Ok(permit) => {
                ctx.admission = Some(Arc::new(permit));
                self.metrics.in_flight.set(self.in_use());
                Ok(None)
            }
            Err(_) => {
                warn!(
                    component = %ctx.component,
                    "Rejecting request, {} requests in flight",
                    self.limit
                );
                self.metrics.rejected_total.inc();
                Ok(Some(too_many_requests()))
            }
        }
    }

    async fn on_response(&self, _ctx: &RequestContext, _status: StatusCode) -> Result<()> {
        // Slots of bodies still streaming stay counted.
        self.metrics.in_flight.set(self.in_use());
        Ok(())
    }
}

/// Canonicalises label and field selectors of list and watch requests
pub struct ListSelectorMiddleware;

#[async_trait]
impl Middleware for ListSelectorMiddleware {
    fn name(&self) -> &'static str {
        "ListSelectorMiddleware"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        if !ctx.info.is_resource_request || !matches!(ctx.verb(), hub_core::Verb::List | hub_core::Verb::Watch) {
            return Ok(None);
        }
        let labels = query_param(&parts.uri, "labelSelector");
        let fields = query_param(&parts.uri, "fieldSelector");
        if labels.is_none() && fields.is_none() {
            return Ok(None);
        }
        match ListSelector::parse(labels.as_deref(), fields.as_deref()) {
            Ok(selector) => {
                ctx.list_selector = (!selector.is_empty()).then_some(selector);
                Ok(None)
            }
            Err(e) => Ok(Some(bad_request(e.to_string()))),
        }
    }
}

/// Resolves the deadline of the request
pub struct TimeoutMiddleware {
    default_timeout: Duration,
}

impl TimeoutMiddleware {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &'static str {
        "TimeoutMiddleware"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        ctx.timeout = if ctx.is_watch() {
            query_param(&parts.uri, "timeoutSeconds")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
        } else {
            let requested = query_param(&parts.uri, "timeout").and_then(|v| parse_duration(&v));
            Some(requested.unwrap_or(self.default_timeout))
        };
        Ok(None)
    }
}

/// Captures and strips the `Edge-Cache` hint
pub struct CacheHeaderMiddleware;

#[async_trait]
impl Middleware for CacheHeaderMiddleware {
    fn name(&self) -> &'static str {
        "CacheHeaderMiddleware"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        if let Some(value) = parts.headers.remove(EDGE_CACHE_HEADER) {
            ctx.cache_hint = match value.to_str().map(str::trim) {
                Ok(v) if v.eq_ignore_ascii_case("true") => Some(true),
                Ok(v) if v.eq_ignore_ascii_case("false") => Some(false),
                _ => None,
            };
        }
        Ok(None)
    }
}

/// Negotiates the response content type
pub struct ContentTypeMiddleware {
    caching: bool,
}

impl ContentTypeMiddleware {
    pub fn new(caching: bool) -> Self {
        Self { caching }
    }
}

#[async_trait]
impl Middleware for ContentTypeMiddleware {
    fn name(&self) -> &'static str {
        "ContentTypeMiddleware"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        let accept = parts
            .headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim()
            .to_string();
        let types: Vec<&str> = accept
            .split(',')
            .map(|t| t.split(';').next().unwrap_or_default().trim())
            .filter(|t| !t.is_empty())
            .collect();

        let wildcard = types.is_empty() || types.iter().all(|t| *t == "*/*");
        if wildcard || (self.caching && types.contains(&JSON)) {
            parts.headers.insert(ACCEPT, HeaderValue::from_static(JSON));
            ctx.content_type = JSON.to_string();
        } else {
            ctx.content_type = types.first().copied().unwrap_or(JSON).to_string();
        }
        Ok(None)
    }
}

/// Kubernetes duration strings as used by the `timeout` query (`30s`, `1m30s`, `500ms`)
pub fn parse_duration(value: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" | "" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 3600),
            _ => return None,
        };
        total += unit;
        rest = &rest[unit_len..];
    }
    (total > Duration::ZERO).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn parts(uri: &str, headers: &[(&str, &str)]) -> request::Parts {
        let mut builder = Request::get(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    async fn run(chain: &MiddlewareChain, parts: &mut request::Parts) -> (RequestContext, Option<Response<BoxBody>>) {
        let mut ctx = RequestContext::new(RequestInfo::default());
        let response = chain.on_request(&mut ctx, parts).await.unwrap();
        (ctx, response)
    }

    struct CountingMiddleware {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Middleware for CountingMiddleware {
        async fn on_request(
            &self,
            _ctx: &mut RequestContext,
            _parts: &mut request::Parts,
        ) -> Result<Option<Response<BoxBody>>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_resolves_component_and_info() {
        let chain = MiddlewareChain::new()
            .add(RequestInfoMiddleware)
            .add(ComponentMiddleware);
        let mut p = parts(
            "/api/v1/namespaces/default/pods",
            &[("user-agent", "kubelet/v1.31.0 (linux/amd64) kubernetes/abc")],
        );
        let (ctx, response) = run(&chain, &mut p).await;
        assert!(response.is_none());
        assert_eq!(ctx.component, "kubelet");
        assert_eq!(ctx.resource(), "pods");
        assert_eq!(ctx.verb(), hub_core::Verb::List);
    }

    #[tokio::test]
    async fn test_admission_gate_rejects_when_full() {
        let metrics = MetricsCollector::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let chain = MiddlewareChain::new()
            .add(RequestInfoMiddleware)
            .add(MaxInFlightMiddleware::new(1, metrics.clone()))
            .add(CountingMiddleware { count: count.clone() });

        let (held, response) = run(&chain, &mut parts("/api/v1/pods", &[])).await;
        assert!(response.is_none());
        assert!(held.admission.is_some());

        let (_, response) = run(&chain, &mut parts("/api/v1/nodes", &[])).await;
        let response = response.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "1");
        assert_eq!(metrics.rejected_total.get(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Watches are never counted against the limit.
        let (watch, response) = run(&chain, &mut parts("/api/v1/pods?watch=true", &[])).await;
        assert!(response.is_none());
        assert!(watch.admission.is_none());

        drop(held);
        let (_, response) = run(&chain, &mut parts("/api/v1/nodes", &[])).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_selector_canonicalised() {
        let chain = MiddlewareChain::new()
            .add(RequestInfoMiddleware)
            .add(ListSelectorMiddleware);
        let (ctx, _) = run(
            &chain,
            &mut parts("/api/v1/pods?labelSelector=tier%3Dweb%2Capp%3Dnginx", &[]),
        )
        .await;
        assert_eq!(ctx.list_selector.unwrap().label_string(), "app=nginx,tier=web");

        let (_, response) = run(&chain, &mut parts("/api/v1/pods?fieldSelector=spec.nodeName", &[])).await;
        assert_eq!(response.unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_timeouts() {
        let chain = MiddlewareChain::new()
            .add(RequestInfoMiddleware)
            .add(TimeoutMiddleware::new(Duration::from_secs(60)));

        let (ctx, _) = run(&chain, &mut parts("/api/v1/pods", &[])).await;
        assert_eq!(ctx.timeout, Some(Duration::from_secs(60)));

        let (ctx, _) = run(&chain, &mut parts("/api/v1/pods?timeout=1m30s", &[])).await;
        assert_eq!(ctx.timeout, Some(Duration::from_secs(90)));

        let (ctx, _) = run(&chain, &mut parts("/api/v1/pods?watch=1&timeoutSeconds=300", &[])).await;
        assert_eq!(ctx.timeout, Some(Duration::from_secs(300)));

        let (ctx, _) = run(&chain, &mut parts("/api/v1/pods?watch=1", &[])).await;
        assert_eq!(ctx.timeout, None);
    }

    #[tokio::test]
    async fn test_cache_header_stripped() {
        let chain = MiddlewareChain::new().add(CacheHeaderMiddleware);
        let mut p = parts("/api/v1/pods", &[("Edge-Cache", "false")]);
        let (ctx, _) = run(&chain, &mut p).await;
        assert_eq!(ctx.cache_hint, Some(false));
        assert!(!p.headers.contains_key(EDGE_CACHE_HEADER));
    }

    #[tokio::test]
    async fn test_content_type_negotiation() {
        let chain = MiddlewareChain::new().add(ContentTypeMiddleware::new(true));

        let mut p = parts("/api/v1/pods", &[]);
        let (ctx, _) = run(&chain, &mut p).await;
        assert!(ctx.is_json());
        assert_eq!(p.headers[ACCEPT], JSON);

        let mut p = parts("/api/v1/pods", &[("accept", "application/vnd.kubernetes.protobuf,application/json")]);
        let (ctx, _) = run(&chain, &mut p).await;
        assert!(ctx.is_json());
        assert_eq!(p.headers[ACCEPT], JSON);

        let mut p = parts("/api/v1/pods", &[("accept", "application/vnd.kubernetes.protobuf")]);
        let (ctx, _) = run(&chain, &mut p).await;
        assert!(!ctx.is_json());

        let no_cache = MiddlewareChain::new().add(ContentTypeMiddleware::new(false));
        let mut p = parts("/api/v1/pods", &[("accept", "application/vnd.kubernetes.protobuf,application/json")]);
        let (ctx, _) = run(&no_cache, &mut p).await;
        assert_eq!(ctx.content_type, "application/vnd.kubernetes.protobuf");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("0s"), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration(""), None);
    }
}
