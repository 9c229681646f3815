//! Handler pipeline: composable request handlers that stream into a writer.
//!
//! Every layer of the pipeline implements [`Handler`]. A layer wraps the next
//! one and may inspect the request, short-circuit with its own response, or
//! hand the request on with a decorated writer. The cache
//! ([`CacheLayer`](crate::cache::CacheLayer)) is such a layer.
//!
//! ## Core types
//!
//! - [`Handler`]: trait implemented by every layer and by application handlers.
//! - [`Logger`]: built-in request logger that records the cache outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::CACHE_HEADER;
use crate::http::{Request, ResponseWriter};

/// A request handler that writes its response into a [`ResponseWriter`].
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because handlers are shared
///   across Tokio tasks.
/// - Implementations **should not** hold locks on shared state across an
///   `.await` point.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use keepsake::http::{Request, ResponseWriter};
/// use keepsake::middleware::Handler;
///
/// struct Hello;
///
/// #[async_trait]
/// impl Handler for Hello {
///     async fn serve(&self, _req: &Request, w: &mut dyn ResponseWriter) {
///         w.headers_mut().set("Cache-Control", "max-age=60");
///         w.write_header(200);
///         let _ = w.write(b"hello").await;
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle `req`, writing the response into `w`.
    async fn serve(&self, req: &Request, w: &mut dyn ResponseWriter);
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn serve(&self, req: &Request, w: &mut dyn ResponseWriter) {
        (**self).serve(req, w).await;
    }
}

/// Built-in layer that logs each request's method, path, cache outcome and duration.
///
/// Emits a single `tracing::info!` line after the inner handler completes,
/// in the format:
///
/// ```text
/// METHOD /path - X-CACHE (duration)
/// ```
///
/// The outcome is whatever `X-Cache` value the inner layers left on the
/// response headers (`-` when there is none).
pub struct Logger<H> {
    inner: H,
}

impl<H: Handler> Logger<H> {
    /// Wraps `inner` with request logging.
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: Handler> Handler for Logger<H> {
    async fn serve(&self, req: &Request, w: &mut dyn ResponseWriter) {
        let start = Instant::now();

        self.inner.serve(req, w).await;

        let outcome = w.headers().get(CACHE_HEADER).unwrap_or("-");
        tracing::info!(
            "{} {} - {} ({:?})",
            req.method(),
            req.path(),
            outcome,
            start.elapsed()
        );
    }
}
