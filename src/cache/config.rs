//! Cache engine configuration.

use serde::Deserialize;

/// Settings for a [`CacheEngine`](super::CacheEngine).
///
/// Deserializable from any serde format; missing fields take their defaults.
///
/// ```
/// use keepsake::cache::CacheConfig;
///
/// let config: CacheConfig = serde_json::from_str(r#"{"shared": true}"#).unwrap();
/// assert!(config.shared);
/// assert_eq!(config.via, "keepsake");
///
/// let built = CacheConfig::new().shared(true).max_capture_bytes(1 << 20);
/// assert_eq!(built.max_capture_bytes, Some(1 << 20));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Shared (proxy) semantics: honor `s-maxage`, refuse `private`, strip
    /// `private="..."` fields. Private (browser) semantics when `false`.
    pub shared: bool,

    /// Pseudonym appended to `Via` on cache hits.
    pub via: String,

    /// Largest body captured for storage. Bigger responses are still
    /// forwarded but not cached.
    pub max_capture_bytes: Option<usize>,

    /// Cap on background store writes running at once.
    pub max_concurrent_writes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shared: false,
            via: "keepsake".to_owned(),
            max_capture_bytes: None,
            max_concurrent_writes: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    #[must_use]
    pub fn via(mut self, pseudonym: impl Into<String>) -> Self {
        self.via = pseudonym.into();
        self
    }

    #[must_use]
    pub fn max_capture_bytes(mut self, limit: usize) -> Self {
        self.max_capture_bytes = Some(limit);
        self
    }

    #[must_use]
    pub fn max_concurrent_writes(mut self, limit: usize) -> Self {
        self.max_concurrent_writes = Some(limit);
        self
    }
}
