//! Cache keys.
//!
//! A key is `METHOD:url`, where `url` is the canonical absolute URL of the
//! request (scheme and host lower-cased, default port dropped, as normalized
//! by [`url::Url`]). Responses that vary by request headers additionally get
//! a secondary key carrying one `Name=Value` component per varied header.
//!
//! `Content-Location` never changes a key: the request URL alone identifies
//! the entry.

use std::fmt;

use tracing::debug;
use url::Url;

use crate::http::{Headers, Request};

/// Identity of a cached representation.
///
/// Keys are immutable; [`for_method`](Self::for_method) and
/// [`vary`](Self::vary) return new keys. Two keys are equal iff their string
/// forms are equal.
///
/// # Examples
///
/// ```
/// use keepsake::cache::CacheKey;
/// use keepsake::http::{Headers, Method, Request};
///
/// let req = Request::new(Method::Get, "https://api.example.com/me");
/// let key = CacheKey::from_request(&req);
/// assert_eq!(key.to_string(), "GET:https://api.example.com/me");
///
/// let mut headers = Headers::new();
/// headers.insert("Accept", "application/json");
/// let varied = key.vary("Accept", &headers);
/// assert_eq!(varied.to_string(), "GET:https://api.example.com/me::Accept=application/json:");
/// ```
#[derive(Debug, Clone)]
pub struct CacheKey {
    method: String,
    url: String,
    vary: Vec<String>,
}

impl CacheKey {
    /// Builds a key from its parts.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            vary: Vec::new(),
        }
    }

    /// Builds the primary key for a request.
    ///
    /// Requests without a resolvable host (HTTP/1.0 without `Host`) are keyed
    /// on their origin-form target.
    pub fn from_request(req: &Request) -> Self {
        let url = match req.absolute_url() {
            Some(url) => url.to_string(),
            None => match req.query_string() {
                Some(query) => format!("{}?{}", req.path(), query),
                None => req.path().to_owned(),
            },
        };

        if let Some(location) = req.headers().get("content-location") {
            note_content_location(&url, location);
        }

        Self::new(req.method().as_str(), url)
    }

    /// The request method component.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The canonical URL component.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The `Name=Value` vary components, in the order they were added.
    pub fn vary_components(&self) -> &[String] {
        &self.vary
    }

    /// Returns a copy of this key with the method replaced.
    ///
    /// Used to probe a GET entry when serving HEAD.
    #[must_use]
    pub fn for_method(&self, method: &str) -> Self {
        Self {
            method: method.to_owned(),
            ..self.clone()
        }
    }

    /// Returns a copy with one `Name=Value` component appended for each
    /// header named in `vary_header`, values taken from `request_headers`.
    ///
    /// Multiple values of one header are joined with `", "`; an absent
    /// header contributes an empty value.
    #[must_use]
    pub fn vary(&self, vary_header: &str, request_headers: &Headers) -> Self {
        let mut key = self.clone();
        for name in vary_header.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let value = request_headers.get_all(name).collect::<Vec<_>>().join(", ");
            key.vary.push(format!("{name}={value}"));
        }
        key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method, self.url)?;
        if !self.vary.is_empty() {
            f.write_str("::")?;
            for component in &self.vary {
                write!(f, "{component}:")?;
            }
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for CacheKey {}

fn note_content_location(request_url: &str, location: &str) {
    let Ok(base) = Url::parse(request_url) else {
        return;
    };
    match base.join(location) {
        Ok(resolved) if resolved.origin() != base.origin() => {
            debug!(%location, "ignoring cross-origin Content-Location");
        }
        Ok(_) => {}
        Err(e) => debug!(%location, error = %e, "unparseable Content-Location"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn api_request() -> Request {
        Request::new(Method::Get, "https://api.example.com/me")
            .with_header("Content-Type", "application/json")
            .with_header("Accept", "application/json")
            .with_header("ETag", "15f0fff99ed5aae4edffdd6496d7131f")
    }

    #[test]
    fn from_request_uses_method_and_absolute_url() {
        let key = CacheKey::from_request(&api_request());
        assert_eq!(key.method(), "GET");
        assert_eq!(key.url(), "https://api.example.com/me");
        assert!(key.vary_components().is_empty());
    }

    #[test]
    fn origin_form_resolves_against_host() {
        let req = Request::new(Method::Get, "/stuff?rly=ya").with_header("Host", "Example.COM:80");
        let key = CacheKey::from_request(&req);
        assert_eq!(key.to_string(), "GET:http://example.com/stuff?rly=ya");
    }

    #[test]
    fn content_location_never_changes_identity() {
        let plain = CacheKey::from_request(&api_request());

        for location in ["/me", "https://api.example.com/profile", "https://apis.example.com/me"] {
            let req = api_request().with_header("Content-Location", location);
            let key = CacheKey::from_request(&req);
            assert_eq!(key.method(), "GET");
            assert_eq!(key, plain, "Content-Location {location} altered the key");
        }
    }

    #[test]
    fn for_method_replaces_only_method() {
        let key = CacheKey::from_request(&api_request());
        let post = key.for_method("POST");
        assert_eq!(post.method(), "POST");
        assert_eq!(post.url(), key.url());
        assert_eq!(key.method(), "GET");
    }

    #[test]
    fn vary_appends_header_values() {
        let key = CacheKey::from_request(&api_request());
        let vary_req = api_request();
        let mut headers = vary_req.headers().clone();
        headers.set("ETag", "33a64df551425fcc55e4d42a148795d9");

        let varied = key.vary("ETag", &headers);
        assert!(key.vary_components().is_empty());
        assert_eq!(varied.vary_components()[0], "ETag=33a64df551425fcc55e4d42a148795d9");
    }

    #[test]
    fn vary_lists_and_missing_headers() {
        let key = CacheKey::new("GET", "http://test.com/");
        let mut headers = Headers::new();
        headers.insert("Accept-Encoding", "gzip");

        let varied = key.vary("Accept-Encoding, X-Missing", &headers);
        assert_eq!(
            varied.vary_components(),
            &["Accept-Encoding=gzip".to_owned(), "X-Missing=".to_owned()]
        );
        assert_ne!(varied, key);
    }
}
