//! The outgoing side of a request: a streaming response writer.

use std::io;

use async_trait::async_trait;

use super::Headers;

/// Destination for a handler's response.
///
/// Handlers set headers through [`headers_mut`](Self::headers_mut), commit
/// the status with [`write_header`](Self::write_header) and then stream the
/// body with [`write`](Self::write). Writers may wrap other writers; the
/// cache's capture stream is one.
///
/// # Contract
///
/// - Only the first `write_header` call is authoritative; later calls are
///   ignored.
/// - A `write` before any `write_header` implies the writer's default
///   status (200 on the wire).
/// - Header changes after the status is committed may not reach the client.
#[async_trait]
pub trait ResponseWriter: Send {
    /// The response headers.
    fn headers(&self) -> &Headers;

    /// Mutable access to the response headers.
    fn headers_mut(&mut self) -> &mut Headers;

    /// Commits the response status.
    fn write_header(&mut self, status: u16);

    /// Writes a chunk of the response body.
    async fn write(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Writes a short plain-text error response.
pub async fn write_error(w: &mut dyn ResponseWriter, status: u16, message: &str) -> io::Result<()> {
    let headers = w.headers_mut();
    headers.set("Content-Type", "text/plain; charset=utf-8");
    headers.set("Content-Length", (message.len() + 1).to_string());
    w.write_header(status);
    w.write(message.as_bytes()).await?;
    w.write(b"\n").await
}
