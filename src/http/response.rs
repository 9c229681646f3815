//! Buffered HTTP/1.1 response.
//!
//! [`Response`] is a [`ResponseWriter`] that records everything written to
//! it. Tests use it as a recorder; embedders that want a fully materialized
//! response can serialize it to wire bytes with [`Response::into_bytes`].

use std::io;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, ResponseWriter, StatusCode, reason_for};

/// An HTTP/1.1 response held entirely in memory.
///
/// # Examples
///
/// ```
/// use keepsake::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Default)]
pub struct Response {
    status: Option<u16>,
    headers: Headers,
    body: BytesMut,
}

impl Response {
    /// Creates a response with the given status already committed.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: Some(status.as_u16()),
            ..Self::default()
        }
    }

    /// Creates an empty recorder with no status committed yet.
    pub fn recorder() -> Self {
        Self::default()
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body with a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = BytesMut::from(body.into().as_bytes());
        self
    }

    /// The committed status, or 200 when nothing was committed.
    pub fn status(&self) -> u16 {
        match self.status {
            None | Some(0) => 200,
            Some(code) => code,
        }
    }

    /// The status exactly as committed, if any.
    pub fn committed_status(&self) -> Option<u16> {
        self.status
    }

    /// Response headers.
    pub fn header_map(&self) -> &Headers {
        &self.headers
    }

    /// Body bytes written so far.
    pub fn body_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Any `Content-Length` header is replaced with the buffered body length.
    pub fn into_bytes(mut self) -> BytesMut {
        let status = self.status();
        let content_length = self.body.len();
        self.headers.remove("content-length");

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(format!("HTTP/1.1 {} {}\r\n", status, reason_for(status)).as_bytes());
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_ref());

        buf
    }
}

#[async_trait]
impl ResponseWriter for Response {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_header(&mut self, status: u16) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.body.extend_from_slice(buf);
        Ok(())
    }
}
