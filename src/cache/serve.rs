//! Conditional content serving for 200 hits.
//!
//! Answers `If-None-Match` / `If-Modified-Since` with `304`, a single byte
//! range with `206`, and an unsatisfiable range with `416`. Everything else
//! gets the full body. Response headers are assumed to already carry the
//! stored representation's headers.

use std::io;
use std::ops::Range;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::http::{Headers, Method, Request, ResponseWriter, StatusCode, write_error};

use super::header::time_header;

// Headers that describe a body and must not accompany a 304.
const BODY_HEADERS: [&str; 3] = ["Content-Type", "Content-Length", "Content-Encoding"];

#[derive(Debug, PartialEq, Eq)]
enum RangeRequest {
    /// No usable `Range` header: send everything.
    Full,
    Single(Range<usize>),
    Unsatisfiable,
}

/// Writes `body` for `req`, honoring the request's validators and `Range`.
pub(crate) async fn serve_content(
    req: &Request,
    last_modified: Option<SystemTime>,
    body: &Bytes,
    w: &mut dyn ResponseWriter,
) -> io::Result<()> {
    if is_not_modified(req.headers(), w.headers(), last_modified) {
        let headers = w.headers_mut();
        for name in BODY_HEADERS {
            headers.remove(name);
        }
        if headers.contains("etag") {
            headers.remove("Last-Modified");
        }
        w.write_header(StatusCode::NotModified.as_u16());
        return Ok(());
    }

    // A stored HEAD response keeps the length the origin announced.
    if *req.method() == Method::Head && body.is_empty() && w.headers().contains("content-length") {
        w.write_header(StatusCode::Ok.as_u16());
        return Ok(());
    }

    w.headers_mut().set("Accept-Ranges", "bytes");
    let size = body.len();

    let (status, content) = match parse_range(req.headers().get("range"), size) {
        RangeRequest::Full => (StatusCode::Ok, body.clone()),
        RangeRequest::Single(range) => {
            w.headers_mut().set(
                "Content-Range",
                format!("bytes {}-{}/{}", range.start, range.end - 1, size),
            );
            (StatusCode::PartialContent, body.slice(range))
        }
        RangeRequest::Unsatisfiable => {
            w.headers_mut().set("Content-Range", format!("bytes */{size}"));
            return write_error(
                w,
                StatusCode::RangeNotSatisfiable.as_u16(),
                "invalid range: failed to overlap",
            )
            .await;
        }
    };

    if !w.headers().contains("content-encoding") {
        w.headers_mut().set("Content-Length", content.len().to_string());
    }
    w.write_header(status.as_u16());

    if *req.method() == Method::Head || content.is_empty() {
        return Ok(());
    }
    w.write(&content).await
}

// If-None-Match takes precedence; If-Modified-Since only applies without it.
fn is_not_modified(request: &Headers, response: &Headers, last_modified: Option<SystemTime>) -> bool {
    if let Some(candidates) = request.get("if-none-match") {
        let Some(etag) = response.get("etag") else {
            return false;
        };
        return candidates.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || opaque_tag(candidate) == opaque_tag(etag)
        });
    }

    let (Some(modified), Ok(since)) = (last_modified, time_header(request, "If-Modified-Since")) else {
        return false;
    };
    // HTTP dates have whole-second resolution.
    truncate_to_secs(modified) <= since
}

// Weak comparison: the W/ prefix is ignored.
fn opaque_tag(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix("W/").or_else(|| tag.strip_prefix("w/")).unwrap_or(tag)
}

fn truncate_to_secs(time: SystemTime) -> SystemTime {
    time.duration_since(UNIX_EPOCH)
        .map_or(time, |d| UNIX_EPOCH + Duration::from_secs(d.as_secs()))
}

fn parse_range(header: Option<&str>, size: usize) -> RangeRequest {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return RangeRequest::Full;
    };
    // Multipart responses are not produced; multi-range requests get the full body.
    if spec.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return RangeRequest::Unsatisfiable;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // Suffix range: the last N bytes.
        return match end.parse::<usize>() {
            Ok(0) | Err(_) => RangeRequest::Unsatisfiable,
            Ok(_) if size == 0 => RangeRequest::Unsatisfiable,
            Ok(n) => RangeRequest::Single(size.saturating_sub(n)..size),
        };
    }

    let Ok(start) = start.parse::<usize>() else {
        return RangeRequest::Unsatisfiable;
    };
    if start >= size {
        return RangeRequest::Unsatisfiable;
    }
    let end = if end.is_empty() {
        size - 1
    } else {
        match end.parse::<usize>() {
            Ok(end) if end >= start => end.min(size - 1),
            _ => return RangeRequest::Unsatisfiable,
        }
    };
    RangeRequest::Single(start..end + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::header::http_date;
    use crate::http::Response;

    const BODY: &[u8] = b"0123456789";

    fn modified() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_136_214_245)
    }

    async fn serve(req: Request, stored: &[(&str, &str)]) -> Response {
        let mut w = Response::recorder();
        for (name, value) in stored {
            w.headers_mut().insert(*name, *value);
        }
        serve_content(&req, Some(modified()), &Bytes::from_static(BODY), &mut w)
            .await
            .unwrap();
        w
    }

    fn get() -> Request {
        Request::new(Method::Get, "http://example.com/file")
    }

    #[tokio::test]
    async fn full_body_with_length_and_accept_ranges() {
        let res = serve(get(), &[("Content-Type", "text/plain")]).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.header_map().get("content-length"), Some("10"));
        assert_eq!(res.header_map().get("accept-ranges"), Some("bytes"));
        assert_eq!(&res.body_bytes()[..], BODY);
    }

    #[tokio::test]
    async fn matching_etag_is_not_modified() {
        let req = get().with_header("If-None-Match", r#""other", W/"v1""#);
        let res = serve(req, &[("ETag", r#""v1""#), ("Content-Type", "text/plain")]).await;
        assert_eq!(res.status(), 304);
        assert!(res.body_bytes().is_empty());
        assert!(!res.header_map().contains("content-type"));
        assert_eq!(res.header_map().get("etag"), Some(r#""v1""#));
    }

    #[tokio::test]
    async fn mismatched_etag_serves_body() {
        let req = get().with_header("If-None-Match", r#""v2""#);
        let res = serve(req, &[("ETag", r#""v1""#)]).await;
        assert_eq!(res.status(), 200);
    }

    #[tokio::test]
    async fn if_modified_since() {
        let unchanged = get().with_header("If-Modified-Since", http_date(modified()));
        assert_eq!(serve(unchanged, &[]).await.status(), 304);

        let older = http_date(modified() - Duration::from_secs(60));
        let changed = get().with_header("If-Modified-Since", older);
        assert_eq!(serve(changed, &[]).await.status(), 200);
    }

    #[tokio::test]
    async fn single_range_is_partial() {
        let res = serve(get().with_header("Range", "bytes=2-5"), &[]).await;
        assert_eq!(res.status(), 206);
        assert_eq!(res.header_map().get("content-range"), Some("bytes 2-5/10"));
        assert_eq!(res.header_map().get("content-length"), Some("4"));
        assert_eq!(&res.body_bytes()[..], b"2345");
    }

    #[tokio::test]
    async fn suffix_and_open_ranges() {
        let res = serve(get().with_header("Range", "bytes=-3"), &[]).await;
        assert_eq!(&res.body_bytes()[..], b"789");
        let res = serve(get().with_header("Range", "bytes=8-"), &[]).await;
        assert_eq!(&res.body_bytes()[..], b"89");
        let res = serve(get().with_header("Range", "bytes=5-100"), &[]).await;
        assert_eq!(res.header_map().get("content-range"), Some("bytes 5-9/10"));
    }

    #[tokio::test]
    async fn unsatisfiable_range() {
        let res = serve(get().with_header("Range", "bytes=20-30"), &[]).await;
        assert_eq!(res.status(), 416);
        assert_eq!(res.header_map().get("content-range"), Some("bytes */10"));
    }

    #[tokio::test]
    async fn multi_range_serves_full_body() {
        let res = serve(get().with_header("Range", "bytes=0-1,4-5"), &[]).await;
        assert_eq!(res.status(), 200);
        assert_eq!(&res.body_bytes()[..], BODY);
    }

    #[tokio::test]
    async fn head_gets_headers_only() {
        let res = serve(Request::new(Method::Head, "http://example.com/file"), &[]).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.header_map().get("content-length"), Some("10"));
        assert!(res.body_bytes().is_empty());
    }

    #[tokio::test]
    async fn bodiless_head_keeps_stored_length() {
        let mut w = Response::recorder();
        w.headers_mut().set("Content-Length", "42");
        let head = Request::new(Method::Head, "http://example.com/file");
        serve_content(&head, None, &Bytes::new(), &mut w).await.unwrap();
        assert_eq!(w.status(), 200);
        assert_eq!(w.header_map().get("content-length"), Some("42"));
        assert!(w.body_bytes().is_empty());
    }

    #[test]
    fn range_parsing_edge_cases() {
        assert_eq!(parse_range(None, 10), RangeRequest::Full);
        assert_eq!(parse_range(Some("items=0-1"), 10), RangeRequest::Full);
        assert_eq!(parse_range(Some("bytes=0-0"), 10), RangeRequest::Single(0..1));
        assert_eq!(parse_range(Some("bytes=5-2"), 10), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-0"), 10), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=-20"), 10), RangeRequest::Single(0..10));
        assert_eq!(parse_range(Some("bytes=abc"), 10), RangeRequest::Unsatisfiable);
    }
}
