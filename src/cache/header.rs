//! Typed reads of cache-relevant header fields.

use std::time::SystemTime;

use super::error::HeaderError;
use crate::http::Headers;

/// Reads `name` as a non-negative integer (`Age`, `Content-Length`).
pub fn int_header(headers: &Headers, name: &str) -> Result<u64, HeaderError> {
    let value = headers
        .get(name)
        .ok_or_else(|| HeaderError::Missing(name.to_owned()))?;
    value
        .trim()
        .parse()
        .map_err(|_| HeaderError::NotAnInteger {
            name: name.to_owned(),
            value: value.to_owned(),
        })
}

/// Reads `name` as an HTTP-date (`Date`, `Expires`, `Last-Modified`, `Proxy-Date`).
///
/// All three formats of RFC 9110 §5.6.7 are accepted.
pub fn time_header(headers: &Headers, name: &str) -> Result<SystemTime, HeaderError> {
    let value = headers
        .get(name)
        .ok_or_else(|| HeaderError::Missing(name.to_owned()))?;
    httpdate::parse_http_date(value.trim()).map_err(|_| HeaderError::NotADate {
        name: name.to_owned(),
        value: value.to_owned(),
    })
}

/// Formats `time` as an IMF-fixdate.
pub fn http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn time_header_parses_http_date() {
        let mut h = Headers::new();
        h.insert("Date", "Mon, 02 Jan 2006 15:04:05 GMT");

        let date = time_header(&h, "Date").unwrap();
        // 2006-01-02T15:04:05Z
        assert_eq!(date, UNIX_EPOCH + Duration::from_secs(1_136_214_245));
        assert_eq!(http_date(date), "Mon, 02 Jan 2006 15:04:05 GMT");
    }

    #[test]
    fn time_header_rejects_garbage() {
        let mut h = Headers::new();
        h.insert("Expires", "0");
        assert!(matches!(
            time_header(&h, "Expires"),
            Err(HeaderError::NotADate { .. })
        ));
        assert!(matches!(
            time_header(&h, "Date"),
            Err(HeaderError::Missing(_))
        ));
    }

    #[test]
    fn int_header_parses_age() {
        let mut h = Headers::new();
        h.insert("Age", "65537");
        assert_eq!(int_header(&h, "Age").unwrap(), 65537);
    }

    #[test]
    fn int_header_rejects_negative() {
        let mut h = Headers::new();
        h.insert("Age", "-4");
        assert!(int_header(&h, "age").is_err());
    }
}
