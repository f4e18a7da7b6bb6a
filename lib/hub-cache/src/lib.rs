//! On-disk object cache of the edge hub
//!
//! This library provides:
//! - A byte-level [`Store`] with a filesystem implementation
//! - [`StorageWrapper`] for typed objects with a read-through memory cache
//! - [`CacheManager`] deciding what is cached and answering from the cache
//! - The cache-agent allow-list and garbage collection helpers

pub mod agents;
pub mod error;
pub mod gc;
pub mod manager;
pub mod store;
pub mod wrapper;

pub use agents::CacheAgents;
pub use error::{Result, StorageError};
pub use manager::{CacheManager, CachedReply, ObjectList};
pub use store::{DiskStore, Store};
pub use wrapper::StorageWrapper;
