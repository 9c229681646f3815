//! The inbound request as the cache sees it.

use std::time::SystemTime;

use super::directives::DirectiveSet;
use super::error::CacheError;
use super::key::CacheKey;
use crate::http::{Headers, Method, Request};

/// An inbound request together with its cache key, arrival time and
/// `Cache-Control` directives. Built once per request.
#[derive(Debug)]
pub struct CacheRequest<'r> {
    request: &'r Request,
    key: CacheKey,
    time: SystemTime,
    directives: DirectiveSet,
}

impl<'r> CacheRequest<'r> {
    /// Wraps `request`, stamping it with `time`.
    ///
    /// # Errors
    ///
    /// [`CacheError::MalformedRequest`] when the `Cache-Control` header does
    /// not parse, or an HTTP/1.1 request has no host.
    pub fn new(request: &'r Request, time: SystemTime) -> Result<Self, CacheError> {
        let raw = request
            .headers()
            .get_all("cache-control")
            .collect::<Vec<_>>()
            .join(", ");
        let directives = DirectiveSet::parse(&raw)?;

        if request.version() == 1 && request.host().is_none() {
            return Err(CacheError::MalformedRequest(
                "Host header can't be empty".to_owned(),
            ));
        }

        Ok(Self {
            request,
            key: CacheKey::from_request(request),
            time,
            directives,
        })
    }

    pub fn request(&self) -> &'r Request {
        self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn headers(&self) -> &Headers {
        self.request.headers()
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// When the request arrived.
    pub fn time(&self) -> SystemTime {
        self.time
    }

    pub fn directives(&self) -> &DirectiveSet {
        &self.directives
    }

    /// Whether a cached response may be used to answer this request.
    ///
    /// Only GET and HEAD qualify; `If-Match`, `If-Unmodified-Since` and
    /// `If-Range` disqualify, as do `max-age=0`, `no-store` and `no-cache`.
    pub fn is_cacheable(&self) -> bool {
        if !matches!(self.method(), Method::Get | Method::Head) {
            return false;
        }

        let headers = self.headers();
        if ["if-match", "if-unmodified-since", "if-range"]
            .iter()
            .any(|name| headers.get(name).is_some_and(|v| !v.is_empty()))
        {
            return false;
        }

        if self.directives.get("max-age") == Some("0") {
            return false;
        }

        !(self.directives.has("no-store") || self.directives.has("no-cache"))
    }
}
