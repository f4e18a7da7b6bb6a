//! Reverse proxy to one remote server

use futures::{stream, StreamExt, TryStreamExt};
use http_body_util::BodyExt;
use hub_cache::CacheManager;
use hub_core::{RemoteServer, RequestContext, Verb};
use hub_filter::FilterManager;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
    UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::local::cached_response;
use crate::metrics::MetricsCollector;
use crate::responses::{bad_gateway, byte_stream, empty, incoming, is_hop_by_hop_header, stream_body, BoxBody, BoxError, ByteStream};
use crate::tee::tee;
use crate::transport::{HttpClient, TransportManager};

/// Chunks buffered between the upstream read and each of its two readers
const TEE_CAPACITY: usize = 32;

pub struct RemoteProxy {
    server: Arc<RemoteServer>,
    transports: Arc<TransportManager>,
    cache: Option<Arc<CacheManager>>,
    filters: Arc<FilterManager>,
    metrics: MetricsCollector,
}

impl RemoteProxy {
    pub fn new(
        server: Arc<RemoteServer>,
        transports: Arc<TransportManager>,
        cache: Option<Arc<CacheManager>>,
        filters: Arc<FilterManager>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            server,
            transports,
            cache,
            filters,
            metrics,
        }
    }

    pub fn server(&self) -> &Arc<RemoteServer> {
        &self.server
    }

    pub async fn handle(&self, ctx: Arc<RequestContext>, req: Request<BoxBody>) -> Response<BoxBody> {
        let client = self.client_for(req.headers());
        if is_upgrade(req.headers()) {
            return self.proxy_upgrade(&client, req).await;
        }

        let upstream = match self.upstream_request(req, false) {
            Ok(upstream) => upstream,
            Err(e) => return bad_gateway(e),
        };
        match client.request(upstream).await {
            Ok(response) => self.handle_response(ctx, response).await,
            Err(e) => {
                warn!(
                    server = %self.server.url(),
                    trace_id = %ctx.trace_id,
                    "Upstream request failed: {}",
                    e
                );
                match &self.cache {
                    Some(cache) if cache.can_cache_for(&ctx) && matches!(ctx.verb(), Verb::Get | Verb::List) => {
                        info!(
                            component = %ctx.component,
                            resource = %ctx.resource(),
                            "Serving {} from cache after upstream failure",
                            ctx.verb()
                        );
                        cached_response(cache, &ctx, &self.metrics).await
                    }
                    _ => bad_gateway(format!("request to {} failed: {}", self.server.address(), e)),
                }
            }
        }
    }

    /// Bearer-token requests carry their own credentials
    fn client_for(&self, headers: &HeaderMap) -> Arc<HttpClient> {
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.len() > 7 && v[..7].eq_ignore_ascii_case("bearer "))
            .unwrap_or(false);
        if bearer {
            self.transports.bearer_client()
        } else {
            self.transports.cert_client()
        }
    }

    fn upstream_request(&self, req: Request<BoxBody>, keep_upgrade: bool) -> Result<Request<BoxBody>, String> {
        let (mut parts, body) = req.into_parts();
        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        parts.uri = self.server.join(path).map_err(|e| e.to_string())?;

        let upgrade_headers = [CONNECTION, UPGRADE];
        let dropped: Vec<_> = parts
            .headers
            .keys()
            .filter(|name| {
                let keep = keep_upgrade && upgrade_headers.contains(*name);
                !keep && is_hop_by_hop_header(name.as_str())
            })
            .cloned()
            .collect();
        for name in dropped {
            parts.headers.remove(&name);
        }
        parts.headers.remove(HOST);
        parts.headers.remove(ACCEPT_ENCODING);
        Ok(Request::from_parts(parts, body))
    }

    async fn handle_response(&self, ctx: Arc<RequestContext>, response: Response<Incoming>) -> Response<BoxBody> {
        let status = response.status();
        let (mut parts, body) = response.into_parts();
        let dropped: Vec<_> = parts
            .headers
            .keys()
            .filter(|name| is_hop_by_hop_header(name.as_str()))
            .cloned()
            .collect();
        for name in dropped {
            parts.headers.remove(&name);
        }

        if status == StatusCode::NOT_FOUND && ctx.verb() == Verb::List {
            if let Some(cache) = self.cache.clone().filter(|c| c.is_tracked(ctx.resource())) {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = cache.delete_kind_for(&ctx).await {
                        warn!("Failed to evict {} after 404: {}", ctx.resource(), e);
                    }
                });
            }
        }
        if !status.is_success() {
            return Response::from_parts(parts, incoming(body));
        }

        if ctx.is_watch() {
            parts.headers.remove(CONTENT_LENGTH);
            parts.headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }

        let mut body_stream: ByteStream = byte_stream(body);
        if ctx.verb().is_read() {
            if let Some(runner) = self.filters.runner_for(&ctx) {
                debug!("Filtering {} {} with {}", ctx.verb(), ctx.resource(), runner.names());
                if ctx.is_watch() {
                    body_stream = runner.filter_watch(body_stream).map_err(BoxError::from).boxed();
                } else {
                    let collected: Result<Vec<_>, BoxError> = body_stream.try_collect().await;
                    let content = match collected {
                        Ok(chunks) => chunks.concat(),
                        Err(e) => return bad_gateway(format!("reading response from {}: {}", self.server.address(), e)),
                    };
                    let filtered = runner.filter_body(ctx.verb(), content.into()).await;
                    parts.headers.remove(CONTENT_LENGTH);
                    body_stream = stream::once(async move { Ok::<_, BoxError>(filtered) }).boxed();
                }
            }
        }

        let body = match &self.cache {
            Some(cache) if cache.can_cache_for(&ctx) => {
                let (client_side, cache_side) = tee(body_stream, TEE_CAPACITY);
                let cache = cache.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    let result = cache.cache_response(&ctx, cache_side).await;
                    if let Err(e) = &result {
                        debug!(
                            component = %ctx.component,
                            resource = %ctx.resource(),
                            "Response not cached: {}",
                            e
                        );
                    }
                    metrics.record_cache_write(&ctx.component, ctx.resource(), result.is_ok());
                });
                stream_body(client_side)
            }
            _ => stream_body(body_stream),
        };
        Response::from_parts(parts, body)
    }

    /// Streaming subresources: hand both connections over once upgraded
    async fn proxy_upgrade(&self, client: &HttpClient, mut req: Request<BoxBody>) -> Response<BoxBody> {
        let downstream = hyper::upgrade::on(&mut req);
        let upstream = match self.upstream_request(req, true) {
            Ok(upstream) => upstream,
            Err(e) => return bad_gateway(e),
        };
        let mut response = match client.request(upstream).await {
            Ok(response) => response,
            Err(e) => return bad_gateway(format!("upgrade to {} failed: {}", self.server.address(), e)),
        };
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return response.map(incoming);
        }

        let upstream = hyper::upgrade::on(&mut response);
        let address = self.server.address().to_string();
        tokio::spawn(async move {
            match tokio::try_join!(downstream, upstream) {
                Ok((downstream, upstream)) => {
                    let mut downstream = TokioIo::new(downstream);
                    let mut upstream = TokioIo::new(upstream);
                    match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
                        Ok((sent, received)) => {
                            debug!("Upgraded stream to {} closed ({} bytes out, {} bytes in)", address, sent, received)
                        }
                        Err(e) => debug!("Upgraded stream to {} ended: {}", address, e),
                    }
                }
                Err(e) => warn!("Upgrade with {} failed: {}", address, e),
            }
        });

        let (parts, _) = response.into_parts();
        Response::from_parts(parts, empty())
    }
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("SPDY/3.1"));
        assert!(!is_upgrade(&headers));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_upgrade(&headers));
    }
}
