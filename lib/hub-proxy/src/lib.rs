//! Proxy data path of the edge hub
//!
//! This library provides:
//! - Upstream transports with per-address connection tracking and rotation
//! - Lease-based health checking of remote servers
//! - The load balancer, remote proxy and local cache fallback
//! - The request middleware chain and the admin endpoints

pub mod api_client;
pub mod handler;
pub mod health_check;
pub mod load_balancer;
pub mod local;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod remote;
pub mod resolver;
pub mod responses;
pub mod tee;
pub mod tls;
pub mod tracing;
pub mod transport;

pub use api_client::{ApiClient, ApiError, LeaseClient, RemoteObjectExistence};
pub use handler::{build_chain, AdminHandler, HubHandler};
pub use health_check::{FakeHealthChecker, HealthCheckConfig, HealthChecker, LeaseHealthChecker};
pub use load_balancer::{HealthGate, LoadBalancer};
pub use local::LocalProxy;
pub use metrics::MetricsCollector;
pub use middleware::{Middleware, MiddlewareChain};
pub use remote::RemoteProxy;
pub use resolver::CachedServiceResolver;
pub use responses::{BoxBody, BoxError};
pub use tls::TlsServerConfig;
pub use transport::TransportManager;
