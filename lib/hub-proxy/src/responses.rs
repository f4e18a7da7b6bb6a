//! Response bodies and canned API responses

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::Serialize;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tracing::warn;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the hub produces and every request it forwards
pub type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

pub type ByteStream = futures::stream::BoxStream<'static, Result<Bytes, BoxError>>;

const JSON: &str = "application/json";

pub fn full(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn incoming(body: Incoming) -> BoxBody {
    body.map_err(BoxError::from).boxed_unsync()
}

/// Data frames of an upstream body as a byte stream
pub fn byte_stream(body: Incoming) -> ByteStream {
    use futures::StreamExt;
    BodyStream::new(body)
        .filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(e) => Some(Err(BoxError::from(e))),
            }
        })
        .boxed()
}

pub fn stream_body<S, E>(stream: S) -> BoxBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    let frames = stream.map_ok(Frame::data).map_err(|e| -> BoxError { e.into() });
    StreamBody::new(frames).boxed_unsync()
}

/// Keep `guard` alive until the body yields its last frame or is dropped
pub fn hold_until_end<G>(body: BoxBody, guard: G) -> BoxBody
where
    G: Send + Unpin + 'static,
{
    Guarded {
        body,
        guard: Some(guard),
    }
    .boxed_unsync()
}

struct Guarded<G> {
    body: BoxBody,
    guard: Option<G>,
}

impl<G: Unpin> Body for Guarded<G> {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let frame = ready!(Pin::new(&mut self.body).poll_frame(cx));
        if frame.is_none() {
            self.guard = None;
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.body.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.body.size_hint()
    }
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    match serde_json::to_vec(value) {
        Ok(body) => with_status(status, Some(JSON), full(body)),
        Err(e) => {
            warn!("Failed to encode response: {}", e);
            internal_error("failed to encode response")
        }
    }
}

/// A `Status` object as the API server returns for failures
pub fn status_response(status: StatusCode, reason: &str, message: impl Into<String>) -> Response<BoxBody> {
    let body = Status {
        status: Some("Failure".to_string()),
        code: Some(i32::from(status.as_u16())),
        reason: Some(reason.to_string()),
        message: Some(message.into()),
        ..Status::default()
    };
    json_response(status, &body)
}

pub fn not_found(message: impl Into<String>) -> Response<BoxBody> {
    status_response(StatusCode::NOT_FOUND, "NotFound", message)
}

pub fn bad_request(message: impl Into<String>) -> Response<BoxBody> {
    status_response(StatusCode::BAD_REQUEST, "BadRequest", message)
}

pub fn bad_gateway(message: impl Into<String>) -> Response<BoxBody> {
    status_response(StatusCode::BAD_GATEWAY, "BadGateway", message)
}

pub fn service_unavailable(message: impl Into<String>) -> Response<BoxBody> {
    status_response(StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", message)
}

pub fn gateway_timeout(message: impl Into<String>) -> Response<BoxBody> {
    status_response(StatusCode::GATEWAY_TIMEOUT, "Timeout", message)
}

pub fn too_many_requests() -> Response<BoxBody> {
    let mut response = status_response(
        StatusCode::TOO_MANY_REQUESTS,
        "TooManyRequests",
        "too many requests, please try again later",
    );
    response.headers_mut().insert(RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

pub fn internal_error(message: &str) -> Response<BoxBody> {
    let mut response = Response::new(full(format!("{}\n", message)));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

pub fn text_response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<BoxBody> {
    with_status(status, Some(content_type), full(body))
}

fn with_status(status: StatusCode, content_type: Option<&'static str>, body: BoxBody) -> Response<BoxBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

/// Whether a header must not be forwarded across the hub
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Semaphore};
    use tokio_stream::wrappers::ReceiverStream;

    #[tokio::test]
    async fn test_guard_held_until_body_ends() {
        let slots = Arc::new(Semaphore::new(1));
        let (tx, rx) = mpsc::channel::<Result<Bytes, BoxError>>(4);
        let permit = slots.clone().try_acquire_owned().unwrap();
        let mut body = hold_until_end(stream_body(ReceiverStream::new(rx)), permit);

        tx.send(Ok(Bytes::from("a"))).await.unwrap();
        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "a");
        assert_eq!(slots.available_permits(), 0);

        drop(tx);
        assert!(body.frame().await.is_none());
        assert_eq!(slots.available_permits(), 1);

        // An abandoned body frees its slot too.
        let permit = slots.clone().try_acquire_owned().unwrap();
        let body = hold_until_end(full("x"), permit);
        assert_eq!(slots.available_permits(), 0);
        drop(body);
        assert_eq!(slots.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_status_response_body() {
        let response = status_response(StatusCode::NOT_FOUND, "NotFound", "pods \"a\" not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["kind"], "Status");
        assert_eq!(value["code"], 404);
        assert_eq!(value["reason"], "NotFound");
    }

    #[test]
    fn test_too_many_requests_retry_after() {
        let response = too_many_requests();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("authorization"));
    }
}
