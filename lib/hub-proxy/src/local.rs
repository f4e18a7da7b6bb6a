//! Answers requests from the local cache while no remote server is usable

use bytes::Bytes;
use http_body_util::BodyExt;
use hub_cache::{CacheManager, CachedReply, StorageError};
use hub_core::{RequestContext, Verb};
use hyper::header::{HeaderValue, CONTENT_TYPE, TRANSFER_ENCODING};
use hyper::{Request, Response, StatusCode};
use kube::core::DynamicObject;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::load_balancer::HealthGate;
use crate::metrics::MetricsCollector;
use crate::responses::{
    bad_request, internal_error, json_response, not_found, service_unavailable, stream_body, BoxBody,
};

/// Upper bound of a local watch without `timeoutSeconds`
const MAX_LOCAL_WATCH: Duration = Duration::from_secs(30 * 60);

/// How often a local watch checks whether remote routing is back
const HEALTH_POLL: Duration = Duration::from_secs(1);

pub struct LocalProxy {
    cache: Option<Arc<CacheManager>>,
    gate: Arc<dyn HealthGate>,
    metrics: MetricsCollector,
}

impl LocalProxy {
    pub fn new(cache: Option<Arc<CacheManager>>, gate: Arc<dyn HealthGate>, metrics: MetricsCollector) -> Self {
        Self { cache, gate, metrics }
    }

    pub async fn handle(&self, ctx: Arc<RequestContext>, req: Request<BoxBody>) -> Response<BoxBody> {
        let Some(cache) = &self.cache else {
            return service_unavailable("remote servers are unavailable and caching is disabled");
        };
        if ctx.is_kubelet_lease_request() {
            return self.lease(cache, &ctx, req).await;
        }
        if !cache.can_cache_for(&ctx) {
            debug!(
                component = %ctx.component,
                "No local answer for {} {}",
                ctx.verb(),
                ctx.info.path
            );
            return service_unavailable(format!(
                "{} {} cannot be served while remote servers are unavailable",
                ctx.verb(),
                ctx.info.path
            ));
        }
        if ctx.is_watch() {
            return self.watch(cache, ctx).await;
        }
        cached_response(cache, &ctx, &self.metrics).await
    }

    /// Node lease heartbeats are acknowledged locally
    async fn lease(&self, cache: &CacheManager, ctx: &RequestContext, req: Request<BoxBody>) -> Response<BoxBody> {
        if ctx.verb() == Verb::Get {
            return cached_response(cache, ctx, &self.metrics).await;
        }
        let body: Bytes = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return bad_request(format!("reading lease: {}", e)),
        };
        let lease: DynamicObject = match serde_json::from_slice(&body) {
            Ok(lease) => lease,
            Err(e) => return bad_request(format!("decoding lease: {}", e)),
        };
        if let Err(e) = cache.save_object(ctx, &lease).await {
            warn!("Failed to cache node lease: {}", e);
        }
        let status = if ctx.verb() == Verb::Create {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        json_response(status, &lease)
    }

    /// Snapshot of the cache as ADDED events, held open until remote routing recovers
    async fn watch(&self, cache: &CacheManager, ctx: Arc<RequestContext>) -> Response<BoxBody> {
        let items = match cache.query_cache(&ctx).await {
            Ok(CachedReply::List(list)) => list.items,
            Ok(CachedReply::Object(obj)) => vec![obj],
            Err(e) => {
                debug!("Local watch of {} starts empty: {}", ctx.resource(), e);
                Vec::new()
            }
        };
        self.metrics.record_cache_query(&ctx.component, ctx.resource(), true);

        let deadline = Instant::now() + ctx.timeout.unwrap_or(MAX_LOCAL_WATCH).min(MAX_LOCAL_WATCH);
        let gate = self.gate.clone();
        let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
        tokio::spawn(async move {
            for item in items {
                let Ok(mut frame) = serde_json::to_vec(&json!({"type": "ADDED", "object": item})) else {
                    continue;
                };
                frame.push(b'\n');
                if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    _ = time::sleep_until(deadline) => {
                        debug!("Local watch of {} timed out", ctx.resource());
                        return;
                    }
                    _ = time::sleep(HEALTH_POLL) => {
                        if gate.is_healthy() {
                            info!("Remote servers healthy, ending local watch of {}", ctx.resource());
                            return;
                        }
                    }
                    _ = tx.closed() => return,
                }
            }
        });

        let mut response = Response::new(stream_body(ReceiverStream::new(rx)));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        response
    }
}

/// Answer a get or list from the cache
pub(crate) async fn cached_response(
    cache: &CacheManager,
    ctx: &RequestContext,
    metrics: &MetricsCollector,
) -> Response<BoxBody> {
    let reply = cache.query_cache(ctx).await;
    metrics.record_cache_query(&ctx.component, ctx.resource(), reply.is_ok());
    match reply {
        Ok(CachedReply::Object(obj)) => json_response(StatusCode::OK, &obj),
        Ok(CachedReply::List(list)) => json_response(StatusCode::OK, &list),
        Err(StorageError::NotFound(key)) => not_found(format!("{} not found in local cache", key)),
        Err(e) => {
            warn!("Cache query for {} failed: {}", ctx.info.path, e);
            internal_error(&e.to_string())
        }
    }
}
