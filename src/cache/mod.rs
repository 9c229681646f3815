//! HTTP caching layer (RFC 7234).
//!
//! The engine sits between a server and application handlers and replays
//! stored responses while they are fresh. Misses are forwarded to the next
//! handler through a [`CaptureStream`], and cacheable responses are stored
//! in the background.
//!
//! ## Components
//!
//! - [`DirectiveSet`]: parsed `Cache-Control`.
//! - [`CacheKey`]: `METHOD:url` identity plus `Vary` components.
//! - [`CachedResource`] and [`freshness`]: the stored response and the
//!   age/lifetime math over its headers.
//! - [`Store`]: persistence contract, with [`MemoryStore`] and [`DiskStore`].
//! - [`CaptureStream`]: tees a response to the client and to the cache.
//! - [`CacheEngine`] / [`CacheLayer`]: the request lifecycle.
//!
//! ## Response headers
//!
//! | Header | Value |
//! |---|---|
//! | `X-Cache` | `HIT` when replayed, `SKIP` otherwise |
//! | `Age` | seconds since the response was generated |
//! | `Via` | upstream `Via` followed by `1.1 <pseudonym>` |
//! | `Proxy-Date` | when the cache captured the response |
//! | `Warning` | `110 - "Response is Stale"`, `113 - "Heuristic Expiration"` |

mod capture;
mod config;
mod directives;
mod engine;
mod error;
mod freshness;
mod header;
mod key;
mod pending;
mod request;
mod resource;
mod serve;
mod store;

pub use capture::{CaptureReader, CaptureStream, HeaderSignal};
pub use config::CacheConfig;
pub use directives::DirectiveSet;
pub use engine::{CacheEngine, CacheLayer, Clock};
pub use error::{
    CacheError, CaptureError, DirectiveError, FreshnessError, HeaderError, StoreError, StoreResult,
};
pub use freshness::{Freshness, corrected_age, freshness};
pub use header::{http_date, int_header, time_header};
pub use key::CacheKey;
pub use pending::PendingWrites;
pub use request::CacheRequest;
pub use resource::{CachedResource, PROXY_DATE_HEADER};
pub use store::{DiskStore, MemoryStore, Store};

/// Response header reporting the cache outcome.
pub const CACHE_HEADER: &str = "X-Cache";
