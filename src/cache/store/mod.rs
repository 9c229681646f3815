//! Storage backends for cached resources.
//!
//! The engine only talks to storage through [`Store`]. Backends own all
//! coordination: concurrent writers to one key, eviction, and durability.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: in-process LRU map.
//! - [`DiskStore`]: one file per key under a directory.

use async_trait::async_trait;

use super::error::StoreResult;
use super::resource::CachedResource;
use crate::http::Headers;

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Persistence contract for cached resources.
///
/// Implementations must be safe for concurrent calls from many in-flight
/// requests. When two writes race on one key, the last one wins.
#[async_trait]
pub trait Store: Send + Sync {
    /// Stores `resource` under every key in `keys`.
    async fn store(&self, resource: &CachedResource, keys: &[String]) -> StoreResult<()>;

    /// Fetches the resource stored under `key`.
    ///
    /// The returned body is readable from offset zero regardless of other
    /// readers.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`](super::StoreError::NotFound) when absent.
    async fn retrieve(&self, key: &str) -> StoreResult<CachedResource>;

    /// Fetches only the headers stored under `key`, without the body.
    async fn header_lookup(&self, key: &str) -> StoreResult<Headers>;

    /// Marks the resources under `keys` stale. Absent keys are ignored.
    async fn invalidate(&self, keys: &[String]) -> StoreResult<()>;
}
