//! Core vocabulary shared by the edge hub crates
//!
//! This library provides:
//! - Kubernetes request-info resolution and the per-request context
//! - Storage keys for the local object cache
//! - List selectors and watch stream framing
//! - Remote server descriptors and the client identity contract
//! - Hub configuration schema

pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod key;
pub mod request;
pub mod selector;
pub mod server;
pub mod watch;

pub use config::HubConfig;
pub use context::RequestContext;
pub use error::{HubError, Result};
pub use identity::{CertificateManager, ClientIdentity};
pub use key::StorageKey;
pub use request::{query_param, RequestInfo, Verb};
pub use selector::ListSelector;
pub use server::RemoteServer;
pub use watch::JsonFrameDecoder;

/// Component name used by the hub for its own requests
pub const HUB_COMPONENT: &str = "edge-hub";

/// Namespace holding node lease objects
pub const NODE_LEASE_NAMESPACE: &str = "kube-node-lease";
