use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::Store;
use crate::cache::error::{StoreError, StoreResult};
use crate::cache::resource::CachedResource;
use crate::http::Headers;

/// In-process store backed by an LRU map.
///
/// Entries are shared behind [`Arc`]; bodies are [`bytes::Bytes`], so a
/// retrieval clones reference counts, not data. One resource stored under
/// several keys shares a single allocation.
///
/// # Examples
///
/// ```
/// use keepsake::cache::{CachedResource, MemoryStore, Store};
/// use keepsake::http::Headers;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let mut headers = Headers::new();
/// headers.insert("X-Cache", "SKIP");
/// let resource = CachedResource::new(404, headers, "not here");
///
/// store.store(&resource, &["GET:http://test.com".to_owned()]).await.unwrap();
/// let found = store.retrieve("GET:http://test.com").await.unwrap();
/// assert_eq!(found.status(), 404);
/// assert_eq!(found.headers().get("X-Cache"), Some("SKIP"));
/// # }
/// ```
pub struct MemoryStore {
    entries: Mutex<LruCache<String, Arc<CachedResource>>>,
}

impl MemoryStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Creates a store that evicts the least recently used key beyond `capacity`.
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn get(&self, key: &str) -> StoreResult<Arc<CachedResource>> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_owned()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn store(&self, resource: &CachedResource, keys: &[String]) -> StoreResult<()> {
        let shared = Arc::new(resource.clone());
        let mut entries = self.entries.lock();
        for key in keys {
            entries.put(key.clone(), Arc::clone(&shared));
        }
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StoreResult<CachedResource> {
        self.get(key).map(|entry| (*entry).clone())
    }

    async fn header_lookup(&self, key: &str) -> StoreResult<Headers> {
        self.get(key).map(|entry| entry.headers().clone())
    }

    async fn invalidate(&self, keys: &[String]) -> StoreResult<()> {
        let mut entries = self.entries.lock();
        for key in keys {
            if let Some(entry) = entries.peek_mut(key.as_str()) {
                *entry = Arc::new((**entry).clone().with_stale(true));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn resource(status: u16, body: &'static str) -> CachedResource {
        let mut headers = Headers::new();
        headers.insert("X-Cache", "SKIP");
        CachedResource::new(status, headers, Bytes::from_static(body.as_bytes()))
    }

    #[tokio::test]
    async fn store_and_retrieve() {
        let store = MemoryStore::new();
        store
            .store(&resource(404, "missing"), &["GET:http://test.com".into()])
            .await
            .unwrap();

        let res = store.retrieve("GET:http://test.com").await.unwrap();
        assert_eq!(res.status(), 404);
        assert_eq!(res.headers().get("X-Cache"), Some("SKIP"));
        assert_eq!(&res.body()[..], b"missing");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = MemoryStore::new();
        let err = store.retrieve("GET:http://nowhere").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.header_lookup("GET:http://nowhere").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn multiple_keys_share_one_entry() {
        let store = MemoryStore::new();
        let keys = vec!["GET:http://a/".to_owned(), "GET:http://a/::Accept=json:".to_owned()];
        store.store(&resource(200, "shared"), &keys).await.unwrap();

        let first = store.retrieve(&keys[0]).await.unwrap();
        let second = store.retrieve(&keys[1]).await.unwrap();
        assert_eq!(first.body().as_ptr(), second.body().as_ptr());
        assert_eq!(store.header_lookup(&keys[1]).await.unwrap().get("x-cache"), Some("SKIP"));
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let store = MemoryStore::new();
        let key = vec!["GET:http://a/".to_owned()];
        store.store(&resource(200, "old"), &key).await.unwrap();
        store.store(&resource(200, "new"), &key).await.unwrap();
        assert_eq!(&store.retrieve(&key[0]).await.unwrap().body()[..], b"new");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_marks_stale() {
        let store = MemoryStore::new();
        let key = vec!["GET:http://a/".to_owned()];
        store.store(&resource(200, "x"), &key).await.unwrap();
        store
            .invalidate(&[key[0].clone(), "GET:http://absent/".into()])
            .await
            .unwrap();
        assert!(store.retrieve(&key[0]).await.unwrap().is_stale());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recent() {
        let store = MemoryStore::with_capacity(NonZeroUsize::new(2).unwrap());
        for key in ["a", "b"] {
            store.store(&resource(200, "x"), &[key.into()]).await.unwrap();
        }
        store.retrieve("a").await.unwrap();
        store.store(&resource(200, "x"), &["c".into()]).await.unwrap();

        assert!(store.retrieve("b").await.is_err());
        assert!(store.retrieve("a").await.is_ok());
        assert!(store.retrieve("c").await.is_ok());
    }
}
