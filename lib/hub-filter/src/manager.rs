//! Filter approval and the object, list and watch-stream runners

use bytes::Bytes;
use futures::{Stream, StreamExt};
use hub_core::{JsonFrameDecoder, RequestContext, Verb};
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::filter::{FilterSettings, ObjectFilter};
use crate::registry::FilterRegistry;
use crate::{FilterError, Result};

/// Events buffered between the watch filter task and the response writer
const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Selects the filters that apply to a request
pub struct FilterManager {
    filters: Vec<Arc<dyn ObjectFilter>>,
}

impl FilterManager {
    pub fn new(registry: &FilterRegistry, settings: &FilterSettings, disabled: &[String]) -> Result<Self> {
        let filters = registry.build(settings, disabled)?;
        debug!(
            "Enabled filters: {:?}",
            filters.iter().map(|f| f.name()).collect::<Vec<_>>()
        );
        Ok(Self { filters })
    }

    pub fn from_filters(filters: Vec<Arc<dyn ObjectFilter>>) -> Self {
        Self { filters }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Runner for the filters approved for this request, if any
    pub fn runner_for(&self, ctx: &RequestContext) -> Option<Arc<FilterRunner>> {
        if !matches!(ctx.verb(), Verb::Get | Verb::List | Verb::Watch) {
            return None;
        }
        let approved: Vec<Arc<dyn ObjectFilter>> = self
            .filters
            .iter()
            .filter(|f| {
                f.targets()
                    .iter()
                    .any(|t| t.matches(&ctx.component, ctx.resource(), ctx.verb()))
            })
            .cloned()
            .collect();
        if approved.is_empty() {
            return None;
        }
        Some(Arc::new(FilterRunner { filters: approved }))
    }
}

/// Applies an ordered set of filters to response payloads
pub struct FilterRunner {
    filters: Vec<Arc<dyn ObjectFilter>>,
}

impl FilterRunner {
    pub fn names(&self) -> String {
        self.filters.iter().map(|f| f.name()).collect::<Vec<_>>().join(",")
    }

    /// Run every filter in order; `None` once any filter drops the object
    pub async fn filter_object(&self, mut obj: Value) -> Option<Value> {
        for filter in &self.filters {
            obj = filter.filter(obj).await?;
        }
        Some(obj)
    }

    /// Filter each item of a list object
    pub async fn filter_list(&self, mut list: Value) -> Value {
        let Some(items) = list.get_mut("items").and_then(Value::as_array_mut) else {
            return list;
        };
        let mut kept = Vec::with_capacity(items.len());
        for item in items.drain(..) {
            if let Some(item) = self.filter_object(item).await {
                kept.push(item);
            }
        }
        *items = kept;
        list
    }

    /// Filter a complete object or list body
    ///
    /// Bodies that are not JSON are returned unchanged, as is an object a
    /// filter would drop: a single-object read has no way to omit it.
    pub async fn filter_body(&self, verb: Verb, body: Bytes) -> Bytes {
        let Ok(value) = serde_json::from_slice::<Value>(&body) else {
            debug!("Passing unparseable body through filters {}", self.names());
            return body;
        };
        let filtered = match verb {
            Verb::List => Some(self.filter_list(value).await),
            _ => self.filter_object(value).await,
        };
        match filtered.map(|v| serde_json::to_vec(&v)) {
            Some(Ok(out)) => Bytes::from(out),
            _ => body,
        }
    }

    /// Filter one watch event frame; `None` drops the event
    async fn filter_event(&self, frame: Vec<u8>) -> Option<Bytes> {
        let Ok(mut event) = serde_json::from_slice::<Value>(&frame) else {
            return Some(Bytes::from(frame));
        };
        let filterable = matches!(
            event.get("type").and_then(Value::as_str),
            Some("ADDED") | Some("MODIFIED") | Some("DELETED")
        );
        if !filterable {
            return Some(Bytes::from(frame));
        }
        let object = event.get_mut("object").map(Value::take)?;
        event["object"] = self.filter_object(object).await?;
        let mut out = serde_json::to_vec(&event).ok()?;
        out.push(b'\n');
        Some(Bytes::from(out))
    }

    /// Filter a watch stream on its own task
    ///
    /// The returned stream ends when upstream ends; an upstream error is
    /// delivered as the last item. A dropped receiver stops the task.
    pub fn filter_watch<S, E>(self: Arc<Self>, mut upstream: S) -> ReceiverStream<Result<Bytes>>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut decoder = JsonFrameDecoder::new();
            let mut passthrough = false;
            while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(FilterError::Upstream(e.to_string()))).await;
                        return;
                    }
                };
                if passthrough {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                    continue;
                }
                let frames = match decoder.push(&chunk) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!("Watch stream is not JSON, passing through unfiltered: {}", e);
                        passthrough = true;
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                        continue;
                    }
                };
                for frame in frames {
                    if let Some(out) = self.filter_event(frame).await {
                        if tx.send(Ok(out)).await.is_err() {
                            debug!("Watch consumer went away, stopping filter {}", self.names());
                            return;
                        }
                    }
                }
            }
        });
        ReceiverStream::new(rx)
    }
}
