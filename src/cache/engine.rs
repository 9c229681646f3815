//! The request lifecycle: lookup, serve, or forward-and-capture then store.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::capture::CaptureStream;
use super::config::CacheConfig;
use super::error::{CacheError, StoreError, StoreResult};
use super::freshness::{corrected_age, freshness};
use super::header::http_date;
use super::key::CacheKey;
use super::pending::PendingWrites;
use super::request::CacheRequest;
use super::resource::{CachedResource, PROXY_DATE_HEADER};
use super::serve::serve_content;
use super::store::Store;
use super::CACHE_HEADER;
use crate::http::{Method, Request, ResponseWriter, write_error};
use crate::middleware::Handler;

const HIT: &str = "HIT";
const SKIP: &str = "SKIP";

const STALE_WARNING: &str = r#"110 - "Response is Stale""#;
const HEURISTIC_WARNING: &str = r#"113 - "Heuristic Expiration""#;
const HEURISTIC_WARNING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

// 0 is what some gateways report for a successful non-HTTP status.
const STOREABLE: [u16; 8] = [0, 200, 203, 300, 301, 302, 404, 410];
const CACHEABLE_BY_DEFAULT: [u16; 8] = [0, 200, 203, 206, 300, 301, 302, 304];

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// RFC 7234 cache in front of a [`Handler`].
///
/// For every request the engine either replays a stored response or
/// forwards to the next handler while capturing the response, then stores
/// it in the background when the response permits.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use keepsake::cache::{CacheEngine, CacheLayer, MemoryStore};
/// use keepsake::http::{Method, Request, Response, ResponseWriter};
/// use keepsake::middleware::Handler;
///
/// struct Origin;
///
/// #[async_trait]
/// impl Handler for Origin {
///     async fn serve(&self, _req: &Request, w: &mut dyn ResponseWriter) {
///         w.headers_mut().set("Cache-Control", "max-age=60");
///         w.write_header(200);
///         let _ = w.write(b"hello").await;
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let engine = Arc::new(CacheEngine::new(MemoryStore::new()));
/// let app = CacheLayer::new(Arc::clone(&engine), Origin);
/// let req = Request::new(Method::Get, "http://example.com/greeting");
///
/// let mut first = Response::recorder();
/// app.serve(&req, &mut first).await;
/// assert_eq!(first.header_map().get("X-Cache"), Some("SKIP"));
///
/// engine.drain(std::time::Duration::from_secs(1)).await;
///
/// let mut second = Response::recorder();
/// app.serve(&req, &mut second).await;
/// assert_eq!(second.header_map().get("X-Cache"), Some("HIT"));
/// assert_eq!(&second.body_bytes()[..], b"hello");
/// # }
/// ```
pub struct CacheEngine {
    store: Arc<dyn Store>,
    config: CacheConfig,
    writes: PendingWrites,
    clock: Clock,
}

impl CacheEngine {
    /// A private cache with default settings.
    pub fn new(store: impl Store + 'static) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    pub fn with_config(store: impl Store + 'static, config: CacheConfig) -> Self {
        Self::from_shared_store(Arc::new(store), config)
    }

    /// Builds an engine over a store that is also used elsewhere.
    pub fn from_shared_store(store: Arc<dyn Store>, config: CacheConfig) -> Self {
        let writes = match config.max_concurrent_writes {
            Some(limit) => PendingWrites::bounded(limit),
            None => PendingWrites::new(),
        };
        Self {
            store,
            config,
            writes,
            clock: Arc::new(SystemTime::now),
        }
    }

    /// Replaces the wall clock, e.g. with a controllable one in tests.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> SystemTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Handle on the background store writes.
    pub fn pending_writes(&self) -> &PendingWrites {
        &self.writes
    }

    /// Waits for outstanding background writes. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.writes.drain(timeout).await
    }

    fn now(&self) -> SystemTime {
        (self.clock)()
    }

    /// Runs one request through the cache, calling `next` on a miss.
    pub async fn handle<H>(&self, req: &Request, w: &mut dyn ResponseWriter, next: &H)
    where
        H: Handler + ?Sized,
    {
        let creq = match CacheRequest::new(req, self.now()) {
            Ok(creq) => creq,
            Err(e) => return fail(w, &e).await,
        };

        if !creq.is_cacheable() {
            debug!(key = %creq.key(), "request not cacheable");
            return self.upstream_with_cache(&creq, w, next).await;
        }

        let cache_type = if self.config.shared { "shared" } else { "private" };
        match self.lookup(&creq).await {
            Ok(resource) => {
                debug!(key = %creq.key(), "found in {cache_type} cache");
                self.serve_resource(resource, &creq, w).await;
            }
            Err(e) if e.is_not_found() => {
                if creq.directives().has("only-if-cached") {
                    return fail(w, &CacheError::OnlyIfCachedMiss).await;
                }
                debug!(key = %creq.key(), "not in {cache_type} cache");
                self.upstream_with_cache(&creq, w, next).await;
            }
            Err(e) => fail(w, &CacheError::LookupFailure(e)).await,
        }
    }

    /// Finds the stored resource that answers `creq`.
    async fn lookup(&self, creq: &CacheRequest<'_>) -> StoreResult<CachedResource> {
        let key = creq.key();
        let resource = match self.retrieve(key, creq).await {
            Err(e) if e.is_not_found() && *creq.method() == Method::Head => {
                let resource = self.retrieve(&key.for_method("GET"), creq).await?;
                if !(resource.has_explicit_expiration() && creq.is_cacheable()) {
                    return Err(StoreError::NotFound(key.to_string()));
                }
                debug!(key = %key, "using cached GET request for serving HEAD");
                resource
            }
            other => other?,
        };

        if resource.is_stale() && !creq.directives().has("max-stale") {
            debug!(key = %key, "cached resource was invalidated");
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(resource)
    }

    // Follows the stored Vary to the matching variant.
    async fn retrieve(&self, key: &CacheKey, creq: &CacheRequest<'_>) -> StoreResult<CachedResource> {
        let primary = key.to_string();
        let headers = self.store.header_lookup(&primary).await?;
        match headers.get("vary").filter(|v| !v.trim().is_empty()) {
            Some(vary) => {
                let variant = key.vary(vary, creq.headers()).to_string();
                debug!(key = %primary, %variant, "secondary vary lookup");
                self.store.retrieve(&variant).await
            }
            None => self.store.retrieve(&primary).await,
        }
    }

    async fn serve_resource(
        &self,
        mut resource: CachedResource,
        creq: &CacheRequest<'_>,
        w: &mut dyn ResponseWriter,
    ) {
        let now = self.now();
        resource.headers_mut().set(CACHE_HEADER, HIT);
        for (name, value) in resource.headers().iter() {
            w.headers_mut().insert(name, value);
        }

        let mut stale = false;
        let age = resource.age(now).unwrap_or_else(|e| {
            warn!(key = %creq.key(), error = %e, "error calculating age");
            stale = true;
            Duration::ZERO
        });

        if age > HEURISTIC_WARNING_AGE && resource.heuristic_freshness(now) > HEURISTIC_WARNING_AGE {
            w.headers_mut().insert("Warning", HEURISTIC_WARNING);
        }

        match freshness(&resource, creq, self.config.shared, now) {
            Ok(remaining) if remaining.is_fresh() => {}
            Ok(remaining) => {
                debug!(key = %creq.key(), ?remaining, "serving stale resource");
                stale = true;
            }
            Err(e) => {
                debug!(key = %creq.key(), error = %e, "freshness unknown");
                stale = true;
            }
        }
        if stale {
            w.headers_mut().insert("Warning", STALE_WARNING);
        }

        debug!(?age, previous = ?w.headers().get("Age"), "updating age");
        w.headers_mut().set("Age", age.as_secs().to_string());
        w.headers_mut().set("Via", resource.via(&self.config.via));

        let written = match resource.status() {
            0 | 200 => serve_content(creq.request(), resource.last_modified(), resource.body(), w).await,
            status => {
                w.write_header(status);
                if *creq.method() == Method::Head || resource.body().is_empty() {
                    Ok(())
                } else {
                    w.write(resource.body()).await
                }
            }
        };
        if let Err(e) = written {
            debug!(error = %e, "client went away while serving from cache");
        }
    }

    /// Forwards to `next` through a capture stream and stores the response
    /// when it is cacheable.
    async fn upstream_with_cache<H>(&self, creq: &CacheRequest<'_>, w: &mut dyn ResponseWriter, next: &H)
    where
        H: Handler + ?Sized,
    {
        let request_time = creq.time();
        let started = Instant::now();
        w.headers_mut().set(CACHE_HEADER, SKIP);

        let mut capture = CaptureStream::new(w, self.config.max_capture_bytes);
        let reader = capture.reader();
        next.serve(creq.request(), &mut capture).await;
        capture.close();

        let response_time = self.now();
        let status = capture.status();
        let headers = capture.headers().clone();
        drop(capture);

        if !creq.method().is_safe() && is_success_or_redirect(status) {
            self.invalidate(creq);
        }

        let mut resource = CachedResource::new(status, headers, bytes::Bytes::new())
            .with_captured_at(response_time);
        if !self.is_cacheable(&resource, creq) {
            debug!(key = %creq.key(), status, "resource is uncacheable");
            return;
        }

        let body = match reader.read_to_end().await {
            Ok(body) => body,
            Err(e) => {
                warn!(key = %creq.key(), error = %CacheError::from(e), "not caching response");
                return;
            }
        };
        debug!(elapsed = ?started.elapsed(), "full upstream response");

        let now = self.now();
        let age = corrected_age(resource.headers(), request_time, response_time, now);
        let headers = resource.headers_mut();
        headers.set("Age", age.as_secs().to_string());
        headers.set(PROXY_DATE_HEADER, http_date(now));
        resource.set_body(body);

        self.cache_resource(resource, creq);
    }

    /// Whether a captured response may be stored for `creq`.
    fn is_cacheable(&self, resource: &CachedResource, creq: &CacheRequest<'_>) -> bool {
        let cc = match resource.directives() {
            Ok(cc) => cc,
            Err(e) => {
                error!(error = %e, "error parsing response Cache-Control");
                return false;
            }
        };
        let shared = self.config.shared;

        if cc.has("no-cache") || cc.has("no-store") {
            return false;
        }
        if shared && cc.has("private") && cc.values("private").is_empty() {
            return false;
        }
        if !STOREABLE.contains(&resource.status()) {
            return false;
        }
        if shared && has_value(creq.headers().get("authorization")) {
            return false;
        }
        if shared
            && has_value(resource.headers().get("authorization"))
            && !cc.has("must-revalidate")
            && !cc.has("s-maxage")
        {
            return false;
        }
        if resource
            .headers()
            .get_all("vary")
            .flat_map(|v| v.split(','))
            .any(|field| field.trim() == "*")
        {
            return false;
        }
        if resource.has_explicit_expiration() {
            return true;
        }
        CACHEABLE_BY_DEFAULT.contains(&resource.status()) || cc.has("public")
    }

    /// Hands `resource` to the store in a tracked background task.
    fn cache_resource(&self, mut resource: CachedResource, creq: &CacheRequest<'_>) {
        let mut keys = vec![creq.key().to_string()];
        if let Some(vary) = resource.headers().get("vary").filter(|v| !v.trim().is_empty()) {
            keys.push(creq.key().vary(vary, creq.headers()).to_string());
        }
        resource.remove_hop_by_hop_headers();
        if self.config.shared {
            resource.remove_private_headers();
        }

        let store = Arc::clone(&self.store);
        self.writes.spawn(async move {
            let started = Instant::now();
            match store.store(&resource, &keys).await {
                Ok(()) => debug!(?keys, elapsed = ?started.elapsed(), "stored resources"),
                Err(source) => {
                    let err = CacheError::StoreFailure { keys, source };
                    error!(error = %err, "cache write failed");
                }
            }
        });
    }

    /// Marks the safe-method entries for the request URL stale after a
    /// state-changing request succeeded.
    fn invalidate(&self, creq: &CacheRequest<'_>) {
        let get = creq.key().for_method("GET");
        let head = creq.key().for_method("HEAD");
        let request_headers = creq.headers().clone();
        let store = Arc::clone(&self.store);

        self.writes.spawn(async move {
            let primary = get.to_string();
            let mut keys = vec![primary.clone(), head.to_string()];
            match store.header_lookup(&primary).await {
                Ok(stored) => {
                    if let Some(vary) = stored.get("vary").filter(|v| !v.trim().is_empty()) {
                        keys.push(get.vary(vary, &request_headers).to_string());
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(key = %primary, error = %e, "header lookup failed during invalidation"),
            }

            match store.invalidate(&keys).await {
                Ok(()) => debug!(?keys, "invalidated"),
                Err(e) => error!(?keys, error = %e, "invalidation failed"),
            }
        });
    }
}

fn has_value(header: Option<&str>) -> bool {
    header.is_some_and(|v| !v.is_empty())
}

fn is_success_or_redirect(status: u16) -> bool {
    status == 0 || (200..400).contains(&status)
}

async fn fail(w: &mut dyn ResponseWriter, err: &CacheError) {
    debug!(error = %err, "cache rejected request");
    if let Err(e) = write_error(w, err.status().as_u16(), &err.to_string()).await {
        debug!(error = %e, "failed to write error response");
    }
}

/// [`Handler`] that puts a [`CacheEngine`] in front of `inner`.
pub struct CacheLayer<H> {
    engine: Arc<CacheEngine>,
    inner: H,
}

impl<H: Handler> CacheLayer<H> {
    pub fn new(engine: impl Into<Arc<CacheEngine>>, inner: H) -> Self {
        Self {
            engine: engine.into(),
            inner,
        }
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }
}

#[async_trait]
impl<H: Handler> Handler for CacheLayer<H> {
    async fn serve(&self, req: &Request, w: &mut dyn ResponseWriter) {
        self.engine.handle(req, w, &self.inner).await;
    }
}
