//! Freshness of a cached resource relative to a request (RFC 7234 §4.2).

use std::time::{Duration, SystemTime};

use super::error::FreshnessError;
use super::header::{int_header, time_header};
use super::request::CacheRequest;
use super::resource::{CachedResource, elapsed};
use crate::http::Headers;

/// Remaining lifetime of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Still fresh for this long.
    Fresh(Duration),
    /// Stale by this much. `Stale(ZERO)` means it expired exactly now.
    Stale(Duration),
}

impl Freshness {
    fn remaining(lifetime: Duration, age: Duration) -> Self {
        if lifetime > age {
            Self::Fresh(lifetime - age)
        } else {
            Self::Stale(age - lifetime)
        }
    }

    pub fn is_fresh(self) -> bool {
        matches!(self, Self::Fresh(_))
    }
}

/// How long `resource` stays fresh for `request`.
///
/// 1. Start from the resource's own lifetime ([`CachedResource::max_age`]);
///    no expiration info counts as zero.
/// 2. A smaller request `max-age` clamps it.
/// 3. A resource explicitly marked stale is stale.
/// 4. Heuristic freshness raises the lifetime when larger.
/// 5. The result is the lifetime minus the current age.
///
/// # Errors
///
/// Unparseable directives on either side, or a resource whose age cannot be
/// computed.
pub fn freshness(
    resource: &CachedResource,
    request: &CacheRequest<'_>,
    shared: bool,
    now: SystemTime,
) -> Result<Freshness, FreshnessError> {
    let mut max_age = match resource.max_age(shared, now) {
        Ok(max_age) => max_age,
        Err(FreshnessError::NoExpirationInfo) => Duration::ZERO,
        Err(e) => return Err(e),
    };

    if request.directives().has("max-age") {
        let requested = request.directives().duration("max-age")?;
        if requested < max_age {
            tracing::debug!(?requested, "using request max-age");
            max_age = requested;
        }
    }

    let age = resource.age(now)?;

    if resource.is_stale() {
        return Ok(Freshness::Stale(Duration::ZERO));
    }

    let heuristic = resource.heuristic_freshness(now);
    if heuristic > max_age {
        tracing::debug!(?heuristic, "using heuristic freshness");
        max_age = heuristic;
    }

    Ok(Freshness::remaining(max_age, age))
}

/// Age of a response corrected for clock skew and transit time
/// (RFC 7234 §4.2.3).
///
/// `request_time` is when the request was forwarded, `response_time` when
/// the response arrived. A missing `Age` counts as zero and a missing
/// `Date` gives an apparent age of zero.
pub fn corrected_age(
    headers: &Headers,
    request_time: SystemTime,
    response_time: SystemTime,
    now: SystemTime,
) -> Duration {
    let apparent_age = time_header(headers, "Date")
        .map_or(Duration::ZERO, |date| elapsed(date, response_time));
    let response_delay = elapsed(request_time, response_time);
    let reported_age = int_header(headers, "Age").map_or(Duration::ZERO, Duration::from_secs);

    let corrected = apparent_age.max(reported_age + response_delay);
    corrected + elapsed(response_time, now)
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use bytes::Bytes;

    use super::*;
    use crate::cache::header::http_date;
    use crate::http::{Method, Request};

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn ago(secs: u64) -> String {
        http_date(now() - Duration::from_secs(secs))
    }

    fn resource(pairs: &[(&str, String)]) -> CachedResource {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.insert(*name, value.clone());
        }
        CachedResource::new(200, headers, Bytes::new())
    }

    fn get(cache_control: Option<&str>) -> Request {
        let req = Request::new(Method::Get, "http://example.com/r");
        match cache_control {
            Some(cc) => req.with_header("Cache-Control", cc),
            None => req,
        }
    }

    #[test]
    fn fresh_within_max_age() {
        let res = resource(&[("Date", ago(20)), ("Cache-Control", "max-age=60".into())]);
        let req = get(None);
        let creq = CacheRequest::new(&req, now()).unwrap();
        assert_eq!(
            freshness(&res, &creq, false, now()).unwrap(),
            Freshness::Fresh(Duration::from_secs(40))
        );
    }

    #[test]
    fn stale_past_max_age() {
        let res = resource(&[("Date", ago(90)), ("Cache-Control", "max-age=60".into())]);
        let req = get(None);
        let creq = CacheRequest::new(&req, now()).unwrap();
        let f = freshness(&res, &creq, false, now()).unwrap();
        assert_eq!(f, Freshness::Stale(Duration::from_secs(30)));
        assert!(!f.is_fresh());
    }

    #[test]
    fn request_max_age_clamps_down() {
        let res = resource(&[("Date", ago(20)), ("Cache-Control", "max-age=600".into())]);
        let req = get(Some("max-age=10"));
        let creq = CacheRequest::new(&req, now()).unwrap();
        assert_eq!(
            freshness(&res, &creq, false, now()).unwrap(),
            Freshness::Stale(Duration::from_secs(10))
        );
    }

    #[test]
    fn marked_stale_short_circuits() {
        let res = resource(&[("Date", ago(1)), ("Cache-Control", "max-age=600".into())])
            .with_stale(true);
        let req = get(None);
        let creq = CacheRequest::new(&req, now()).unwrap();
        assert_eq!(
            freshness(&res, &creq, false, now()).unwrap(),
            Freshness::Stale(Duration::ZERO)
        );
    }

    #[test]
    fn heuristic_is_a_floor() {
        let res = resource(&[("Date", ago(10)), ("Last-Modified", ago(10_000))]);
        let req = get(None);
        let creq = CacheRequest::new(&req, now()).unwrap();
        assert_eq!(
            freshness(&res, &creq, false, now()).unwrap(),
            Freshness::Fresh(Duration::from_secs(990))
        );
    }

    #[test]
    fn missing_date_is_an_error() {
        let res = resource(&[("Cache-Control", "max-age=60".into())]);
        let req = get(None);
        let creq = CacheRequest::new(&req, now()).unwrap();
        assert_eq!(freshness(&res, &creq, false, now()), Err(FreshnessError::NoDate));
    }

    #[test]
    fn freshness_is_idempotent() {
        let res = resource(&[("Date", ago(5)), ("Cache-Control", "s-maxage=50".into())]);
        let req = get(None);
        let creq = CacheRequest::new(&req, now()).unwrap();
        let first = freshness(&res, &creq, true, now()).unwrap();
        let second = freshness(&res, &creq, true, now()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrected_age_uses_larger_estimate() {
        let request_time = now() - Duration::from_secs(4);
        let response_time = now() - Duration::from_secs(1);

        // apparent age (response_time - Date) = 9s, reported 2s + 3s delay = 5s
        let mut headers = Headers::new();
        headers.insert("Date", ago(10));
        headers.insert("Age", "2");
        assert_eq!(
            corrected_age(&headers, request_time, response_time, now()),
            Duration::from_secs(10)
        );

        // skewed origin clock: Date in the future gives apparent age 0
        let mut skewed = Headers::new();
        skewed.insert("Date", http_date(now() + Duration::from_secs(300)));
        skewed.insert("Age", "7");
        assert_eq!(
            corrected_age(&skewed, request_time, response_time, now()),
            Duration::from_secs(11)
        );
    }

    #[test]
    fn corrected_age_without_headers_is_delay_plus_residence() {
        let headers = Headers::new();
        let request_time = now() - Duration::from_secs(3);
        assert_eq!(
            corrected_age(&headers, request_time, now(), now()),
            Duration::from_secs(3)
        );
    }
}
