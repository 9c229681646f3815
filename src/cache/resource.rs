//! Stored representations and the metadata derived from their headers.

use std::time::{Duration, SystemTime};

use bytes::Bytes;

use super::directives::DirectiveSet;
use super::error::{DirectiveError, FreshnessError};
use super::header::{int_header, time_header};
use crate::http::Headers;

/// Header stamped with the time the cache captured a response.
pub const PROXY_DATE_HEADER: &str = "Proxy-Date";

// Connection-scoped fields (RFC 7230 §6.1). Never stored.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Heuristic freshness is this fraction of the time since Last-Modified.
const LAST_MODIFIED_DIVISOR: u32 = 10;

/// A cached response: status, headers and body, plus a staleness flag.
///
/// Freshness metadata (`age`, `max_age`, heuristic lifetime) is derived from
/// the headers on demand; nothing is precomputed. Every method that depends
/// on the current time takes it as `now`.
///
/// The body is a shared [`Bytes`] buffer, so any number of readers can
/// consume it independently from offset zero.
#[derive(Debug, Clone)]
pub struct CachedResource {
    status: u16,
    headers: Headers,
    body: Bytes,
    captured_at: SystemTime,
    stale: bool,
}

impl CachedResource {
    /// Creates a resource captured now.
    pub fn new(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            captured_at: SystemTime::now(),
            stale: false,
        }
    }

    /// Overrides the capture timestamp.
    #[must_use]
    pub fn with_captured_at(mut self, captured_at: SystemTime) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Sets the explicit staleness flag.
    #[must_use]
    pub fn with_stale(mut self, stale: bool) -> Self {
        self.stale = stale;
        self
    }

    /// Status code as captured. `0` is a gateway-reported success.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The body. Cloning is a reference-count bump.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// `true` when the resource was explicitly marked stale, e.g. by invalidation.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Parses the response's `Cache-Control` header.
    pub fn directives(&self) -> Result<DirectiveSet, DirectiveError> {
        let joined = self.headers.get_all("cache-control").collect::<Vec<_>>().join(", ");
        DirectiveSet::parse(&joined)
    }

    /// Time since the response was generated.
    ///
    /// Anchored on `Proxy-Date` when the cache stamped one, else on `Date`,
    /// plus the `Age` the response already carried. Never negative.
    ///
    /// # Errors
    ///
    /// [`FreshnessError::NoDate`] when neither anchor header parses.
    pub fn age(&self, now: SystemTime) -> Result<Duration, FreshnessError> {
        let carried = int_header(&self.headers, "Age").map_or(Duration::ZERO, Duration::from_secs);
        let anchor = time_header(&self.headers, PROXY_DATE_HEADER)
            .or_else(|_| time_header(&self.headers, "Date"))
            .map_err(|_| FreshnessError::NoDate)?;
        Ok(elapsed(anchor, now) + carried)
    }

    /// Freshness lifetime granted by the response itself.
    ///
    /// Prefers `s-maxage` for shared caches, then `max-age`, then
    /// `Expires - Date`. An `Expires` that is not a valid date means
    /// "already expired".
    ///
    /// # Errors
    ///
    /// [`FreshnessError::NoExpirationInfo`] when none of those are present,
    /// meaning heuristic freshness applies; directive errors for
    /// unparseable values.
    pub fn max_age(&self, shared: bool, now: SystemTime) -> Result<Duration, FreshnessError> {
        let cc = self.directives()?;
        if shared && cc.has("s-maxage") {
            return Ok(cc.duration("s-maxage")?);
        }
        if cc.has("max-age") {
            return Ok(cc.duration("max-age")?);
        }
        if self.headers.contains("expires") {
            let Ok(expires) = time_header(&self.headers, "Expires") else {
                return Ok(Duration::ZERO);
            };
            let date = time_header(&self.headers, "Date")
                .or_else(|_| time_header(&self.headers, PROXY_DATE_HEADER))
                .unwrap_or(now);
            return Ok(elapsed(date, expires));
        }
        Err(FreshnessError::NoExpirationInfo)
    }

    /// `true` if the response states its own lifetime: a valid `max-age`,
    /// `s-maxage`, or `Expires`.
    pub fn has_explicit_expiration(&self) -> bool {
        let Ok(cc) = self.directives() else {
            return false;
        };
        cc.duration("max-age").is_ok()
            || cc.duration("s-maxage").is_ok()
            || time_header(&self.headers, "Expires").is_ok()
    }

    /// Lifetime estimated from `Last-Modified` when no explicit one exists:
    /// a tenth of the time since the last modification.
    pub fn heuristic_freshness(&self, now: SystemTime) -> Duration {
        if self.has_explicit_expiration() {
            return Duration::ZERO;
        }
        self.last_modified()
            .map_or(Duration::ZERO, |lm| elapsed(lm, now) / LAST_MODIFIED_DIVISOR)
    }

    /// `true` when the response carries `ETag` or `Last-Modified`.
    pub fn has_validators(&self) -> bool {
        self.headers.contains("etag") || self.headers.contains("last-modified")
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        time_header(&self.headers, "Last-Modified").ok()
    }

    /// Drops the header fields listed in `private="..."`.
    ///
    /// Shared caches call this before storing.
    pub fn remove_private_headers(&mut self) {
        let Ok(cc) = self.directives() else {
            return;
        };
        for field in cc.values("private") {
            self.headers.remove(field);
        }
    }

    /// Drops hop-by-hop fields, including any named in `Connection`.
    pub fn remove_hop_by_hop_headers(&mut self) {
        let listed: Vec<String> = self
            .headers
            .get_all("connection")
            .flat_map(|v| v.split(','))
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty())
            .collect();
        for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP) {
            self.headers.remove(name);
        }
    }

    /// The `Via` value to send on a hit: any upstream `Via` followed by this cache.
    pub fn via(&self, pseudonym: &str) -> String {
        let hop = format!("1.1 {pseudonym}");
        match self.headers.get("via") {
            Some(upstream) if !upstream.trim().is_empty() => format!("{upstream}, {hop}"),
            _ => hop,
        }
    }
}

// `to - from`, clamped at zero.
pub(crate) fn elapsed(from: SystemTime, to: SystemTime) -> Duration {
    to.duration_since(from).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::cache::header::http_date;

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn resource(pairs: &[(&str, String)]) -> CachedResource {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.insert(*name, value.clone());
        }
        CachedResource::new(200, headers, Bytes::from_static(b"body"))
    }

    fn ago(secs: u64) -> String {
        http_date(now() - Duration::from_secs(secs))
    }

    #[test]
    fn age_from_date_plus_carried_age() {
        let res = resource(&[("Date", ago(30)), ("Age", "5".into())]);
        assert_eq!(res.age(now()).unwrap(), Duration::from_secs(35));
    }

    #[test]
    fn proxy_date_takes_precedence() {
        let res = resource(&[("Date", ago(600)), (PROXY_DATE_HEADER, ago(10))]);
        assert_eq!(res.age(now()).unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn future_date_gives_zero_age() {
        let res = resource(&[("Date", http_date(now() + Duration::from_secs(50)))]);
        assert_eq!(res.age(now()).unwrap(), Duration::ZERO);
    }

    #[test]
    fn age_without_date_is_an_error() {
        let res = resource(&[]);
        assert_eq!(res.age(now()), Err(FreshnessError::NoDate));
    }

    #[test]
    fn max_age_prefers_s_maxage_when_shared() {
        let res = resource(&[("Cache-Control", "max-age=60, s-maxage=300".into())]);
        assert_eq!(res.max_age(true, now()).unwrap(), Duration::from_secs(300));
        assert_eq!(res.max_age(false, now()).unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn max_age_from_expires_minus_date() {
        let res = resource(&[
            ("Date", ago(100)),
            ("Expires", http_date(now() + Duration::from_secs(200))),
        ]);
        assert_eq!(res.max_age(false, now()).unwrap(), Duration::from_secs(300));
        assert!(res.has_explicit_expiration());
    }

    #[test]
    fn invalid_expires_means_expired() {
        let res = resource(&[("Expires", "0".into())]);
        assert_eq!(res.max_age(false, now()).unwrap(), Duration::ZERO);
        assert!(!res.has_explicit_expiration());
    }

    #[test]
    fn no_expiration_info() {
        let res = resource(&[("Date", ago(1))]);
        assert_eq!(res.max_age(true, now()), Err(FreshnessError::NoExpirationInfo));
        assert!(!res.has_explicit_expiration());
    }

    #[test]
    fn heuristic_is_tenth_of_last_modified_age() {
        let res = resource(&[("Last-Modified", ago(1000))]);
        assert_eq!(res.heuristic_freshness(now()), Duration::from_secs(100));
        assert!(res.has_validators());

        let explicit = resource(&[
            ("Last-Modified", ago(1000)),
            ("Cache-Control", "max-age=1".into()),
        ]);
        assert_eq!(explicit.heuristic_freshness(now()), Duration::ZERO);
    }

    #[test]
    fn private_fields_are_stripped() {
        let mut res = resource(&[
            ("Cache-Control", r#"private="Set-Cookie, X-User", max-age=60"#.into()),
            ("Set-Cookie", "session=1".into()),
            ("X-User", "alice".into()),
            ("Content-Type", "text/plain".into()),
        ]);
        res.remove_private_headers();
        assert!(!res.headers().contains("set-cookie"));
        assert!(!res.headers().contains("x-user"));
        assert!(res.headers().contains("content-type"));
    }

    #[test]
    fn hop_by_hop_fields_are_stripped() {
        let mut res = resource(&[
            ("Connection", "close, X-Trace".into()),
            ("Transfer-Encoding", "chunked".into()),
            ("Keep-Alive", "timeout=5".into()),
            ("X-Trace", "abc".into()),
            ("Cache-Control", "max-age=60".into()),
        ]);
        res.remove_hop_by_hop_headers();
        for name in ["connection", "transfer-encoding", "keep-alive", "x-trace"] {
            assert!(!res.headers().contains(name), "{name} survived");
        }
        assert!(res.headers().contains("cache-control"));
    }

    #[test]
    fn via_appends_own_hop() {
        assert_eq!(resource(&[]).via("keepsake"), "1.1 keepsake");
        let proxied = resource(&[("Via", "1.0 edge".into())]);
        assert_eq!(proxied.via("keepsake"), "1.0 edge, 1.1 keepsake");
    }

    #[test]
    fn body_is_shared_between_clones() {
        let res = resource(&[]);
        let copy = res.clone();
        assert_eq!(res.body().as_ptr(), copy.body().as_ptr());
    }
}
