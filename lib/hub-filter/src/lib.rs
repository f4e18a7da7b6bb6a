//! Response filter pipeline
//!
//! Filters rewrite or drop objects in API responses so that cluster-wide
//! objects are narrowed to what is valid for the local node. Each filter
//! declares the (component, resource, verb) combinations it handles; the
//! [`FilterManager`] picks the approved ones per request and the
//! [`FilterRunner`] applies them to objects, lists and watch streams.

pub mod discardcloudservice;
pub mod error;
pub mod filter;
pub mod inclusterconfig;
pub mod manager;
pub mod masterservice;
pub mod registry;
pub mod servicetopology;

pub use error::{FilterError, Result};
pub use filter::{FilterSettings, FilterTarget, ObjectFilter, ServiceResolver};
pub use manager::{FilterManager, FilterRunner};
pub use registry::FilterRegistry;
