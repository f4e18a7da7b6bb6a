//! Per-request context derived by the middleware chain

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;

use crate::request::{RequestInfo, Verb};
use crate::selector::ListSelector;
use crate::NODE_LEASE_NAMESPACE;

/// Well-known edge components
pub mod components {
    pub const KUBELET: &str = "kubelet";
    pub const KUBE_PROXY: &str = "kube-proxy";
    pub const COREDNS: &str = "coredns";
    pub const FLANNELD: &str = "flanneld";
}

/// Content type used when the client expresses no preference
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Metadata derived once at the start of the middleware chain
///
/// The chain fills the context in; after the chain completes the context is
/// shared read-only with every handler below it.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Trace id propagated from `traceparent` or generated
    pub trace_id: String,
    /// Requesting component, derived from the user agent
    pub component: String,
    /// Resolved API request info
    pub info: RequestInfo,
    /// Negotiated response content type
    pub content_type: String,
    /// Deadline for non-streaming requests, upper bound for watches
    pub timeout: Option<Duration>,
    /// Canonical label/field selector of a list or watch
    pub list_selector: Option<ListSelector>,
    /// Explicit `Edge-Cache` header hint
    pub cache_hint: Option<bool>,
    /// When the request entered the hub
    pub started: Instant,
    /// Slot held in the in-flight admission gate until the handler moves it onto the response body
    pub admission: Option<Arc<OwnedSemaphorePermit>>,
}

impl RequestContext {
    pub fn new(info: RequestInfo) -> Self {
        Self {
            trace_id: String::new(),
            component: String::new(),
            info,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            timeout: None,
            list_selector: None,
            cache_hint: None,
            started: Instant::now(),
            admission: None,
        }
    }

    pub fn verb(&self) -> Verb {
        self.info.verb
    }

    pub fn resource(&self) -> &str {
        &self.info.resource
    }

    pub fn is_watch(&self) -> bool {
        self.info.verb == Verb::Watch
    }

    /// Watches and streaming subresources hold a connection open indefinitely
    pub fn is_long_running(&self) -> bool {
        self.is_watch()
            || matches!(
                self.info.subresource.as_deref(),
                Some("exec") | Some("attach") | Some("portforward") | Some("log") | Some("proxy")
            )
    }

    /// Whether the negotiated body format is JSON
    pub fn is_json(&self) -> bool {
        self.content_type.starts_with("application/json")
    }

    /// Kubelet renewing (or reading) its own node lease
    pub fn is_kubelet_lease_request(&self) -> bool {
        self.component == components::KUBELET
            && self.info.is_resource_request
            && self.info.resource == "leases"
            && self.info.subresource.is_none()
            && self.info.namespace.as_deref() == Some(NODE_LEASE_NAMESPACE)
            && matches!(self.info.verb, Verb::Get | Verb::Update | Verb::Create)
    }
}
