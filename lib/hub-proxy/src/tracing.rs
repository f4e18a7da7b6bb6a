//! W3C trace context propagation

use anyhow::Result;
use async_trait::async_trait;
use hub_core::RequestContext;
use hyper::header::HeaderValue;
use hyper::http::request;
use hyper::{Response, StatusCode};
use opentelemetry::trace::{SpanId, TraceId};
use tracing::{info, warn};

use crate::middleware::Middleware;
use crate::responses::BoxBody;

pub const TRACEPARENT: &str = "traceparent";

/// Picks up or starts a trace and logs request start and finish
#[derive(Default)]
pub struct TracingMiddleware;

impl TracingMiddleware {
    pub fn new() -> Self {
        Self
    }

    /// Parse `version-trace_id-span_id-flags`
    pub fn extract_w3c_trace_context(value: &str) -> Option<(TraceId, SpanId, String)> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() < 4 || parts[0].len() != 2 {
            return None;
        }
        let trace_id = TraceId::from_hex(parts[1]).ok().filter(|t| *t != TraceId::INVALID)?;
        let span_id = SpanId::from_hex(parts[2]).ok().filter(|s| *s != SpanId::INVALID)?;
        Some((trace_id, span_id, parts[3].to_string()))
    }

    pub fn create_w3c_trace_context(trace_id: TraceId, span_id: SpanId, flags: &str) -> String {
        format!("00-{:032x}-{:016x}-{}", trace_id, span_id, flags)
    }

    pub fn generate_trace_id() -> TraceId {
        TraceId::from_bytes(rand::random::<[u8; 16]>())
    }

    pub fn generate_span_id() -> SpanId {
        SpanId::from_bytes(rand::random::<[u8; 8]>())
    }
}

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "TracingMiddleware"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
        parts: &mut request::Parts,
    ) -> Result<Option<Response<BoxBody>>> {
        let incoming = parts
            .headers
            .get(TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::extract_w3c_trace_context);

        // A new span for the hop to the control plane, under the caller's trace.
        let (trace_id, flags) = match incoming {
            Some((trace_id, _, flags)) => (trace_id, flags),
            None => (Self::generate_trace_id(), "01".to_string()),
        };
        let header = Self::create_w3c_trace_context(trace_id, Self::generate_span_id(), &flags);
        match HeaderValue::from_str(&header) {
            Ok(value) => {
                parts.headers.insert(TRACEPARENT, value);
            }
            Err(e) => warn!("Dropping unusable traceparent {}: {}", header, e),
        }
        ctx.trace_id = format!("{:032x}", trace_id);

        info!(
            trace_id = %ctx.trace_id,
            method = %parts.method,
            path = %parts.uri.path(),
            "Request started"
        );
        Ok(None)
    }

    async fn on_response(&self, ctx: &RequestContext, status: StatusCode) -> Result<()> {
        info!(
            trace_id = %ctx.trace_id,
            component = %ctx.component,
            verb = %ctx.verb(),
            resource = %ctx.resource(),
            status = status.as_u16(),
            elapsed_ms = ctx.started.elapsed().as_millis() as u64,
            "Request completed"
        );
        Ok(())
    }

    async fn on_error(&self, ctx: &RequestContext, error: &str) -> Result<()> {
        warn!(trace_id = %ctx.trace_id, error = %error, "Request failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::RequestInfo;
    use hyper::Request;

    #[test]
    fn test_w3c_trace_context_extraction() {
        let value = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
        let (trace_id, span_id, flags) = TracingMiddleware::extract_w3c_trace_context(value).unwrap();
        assert_eq!(format!("{:032x}", trace_id), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(format!("{:016x}", span_id), "00f067aa0ba902b7");
        assert_eq!(flags, "01");

        assert!(TracingMiddleware::extract_w3c_trace_context("garbage").is_none());
        assert!(TracingMiddleware::extract_w3c_trace_context(
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01"
        )
        .is_none());
    }

    #[tokio::test]
    async fn test_trace_id_propagated() {
        let (mut parts, _) = Request::get("/api/v1/pods")
            .header(TRACEPARENT, "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
            .body(())
            .unwrap()
            .into_parts();
        let mut ctx = RequestContext::new(RequestInfo::default());

        TracingMiddleware::new().on_request(&mut ctx, &mut parts).await.unwrap();
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");

        let forwarded = parts.headers.get(TRACEPARENT).unwrap().to_str().unwrap();
        assert!(forwarded.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
        assert!(!forwarded.contains("00f067aa0ba902b7"));
    }

    #[tokio::test]
    async fn test_trace_generated_when_absent() {
        let (mut parts, _) = Request::get("/api/v1/pods").body(()).unwrap().into_parts();
        let mut ctx = RequestContext::new(RequestInfo::default());

        TracingMiddleware::new().on_request(&mut ctx, &mut parts).await.unwrap();
        assert_eq!(ctx.trace_id.len(), 32);
        assert!(parts.headers.contains_key(TRACEPARENT));
    }
}
