//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a
//! [`Handler`]. Responses stream to the socket through a
//! [`ConnectionWriter`] as the handler writes them. Supports HTTP/1.1
//! persistent connections (keep-alive) out of the box.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::http::{
    Headers, Method, ResponseWriter, StatusCode, reason_for,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::Handler;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The keepsake HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// [`Handler`].
///
/// # Examples
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use keepsake::http::{Request, ResponseWriter};
/// use keepsake::middleware::Handler;
/// use keepsake::server::Server;
///
/// struct Hello;
///
/// #[async_trait]
/// impl Handler for Hello {
///     async fn serve(&self, _req: &Request, w: &mut dyn ResponseWriter) {
///         let _ = w.write(b"Hello!").await;
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(Hello).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is wrapped in an [`Arc`] and shared across all spawned
    /// Tokio tasks. Runs until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H>(self, handler: H) -> Result<(), ServerError>
    where
        H: Handler + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops accepting connections once
    /// `shutdown` resolves. Connections already accepted finish on their own.
    pub async fn run_until<H, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Handler + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "keepsake listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => {
                    info!("shutdown requested, no longer accepting connections");
                    return Ok(());
                }
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or a response can only be delimited by closing.
async fn handle_connection<S, H>(
    mut stream: S,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler + ?Sized,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut need_read = true;

    loop {
        if need_read {
            let bytes_read = stream.read_buf(&mut buf).await?;
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }
        need_read = true;

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .header("Connection", "close")
                .body("Request entity too large");
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Headers not yet fully received, read more data.
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .header("Connection", "close")
                    .body(format!("Bad Request: {e}"));
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            continue;
        }
        let request = request.with_body(buf.split_to(total_needed).split_off(body_offset).freeze());

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let mut writer = ConnectionWriter::new(&mut stream, &request);
        handler.serve(&request, &mut writer).await;
        writer.finish().await?;

        if !writer.keep_alive() {
            debug!(peer = %peer_addr, "closing connection after response");
            break;
        }

        // A pipelined request may already be buffered.
        need_read = buf.is_empty();
    }

    Ok(())
}

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Sent before the status is known.
    Pending,
    /// HEAD, 1xx, 204 and 304 responses.
    NoBody,
    Length,
    Chunked,
    /// HTTP/1.0 without a length: the body ends when the connection closes.
    Close,
}

/// Streams one response onto a connection.
///
/// The status line and headers go out on the first body write (or at
/// [`finish`](Self::finish) for empty bodies). HTTP/1.1 bodies without a
/// `Content-Length` are sent with `Transfer-Encoding: chunked`; HTTP/1.0
/// bodies without one are delimited by closing the connection.
pub struct ConnectionWriter<W> {
    io: W,
    headers: Headers,
    status: Option<u16>,
    framing: Framing,
    version: u8,
    head_request: bool,
    keep_alive: bool,
}

impl<W: AsyncWrite + Unpin + Send> ConnectionWriter<W> {
    /// A writer for the response to `request`.
    pub fn new(io: W, request: &Request) -> Self {
        Self {
            io,
            headers: Headers::new(),
            status: None,
            framing: Framing::Pending,
            version: request.version(),
            head_request: *request.method() == Method::Head,
            keep_alive: request.is_keep_alive(),
        }
    }

    /// Whether the connection can carry another request after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Completes the response: sends the head if nothing was written and
    /// terminates a chunked body.
    pub async fn finish(&mut self) -> io::Result<()> {
        if self.framing == Framing::Pending {
            self.send_head(true).await?;
        }
        if self.framing == Framing::Chunked {
            self.io.write_all(b"0\r\n\r\n").await?;
        }
        self.io.flush().await
    }

    async fn send_head(&mut self, finishing: bool) -> io::Result<()> {
        let status = match self.status {
            None | Some(0) => 200,
            Some(code) => code,
        };

        let has_length = self
            .headers
            .get("content-length")
            .is_some_and(|v| v.trim().parse::<u64>().is_ok());

        if self
            .headers
            .get_all("connection")
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("close"))
        {
            self.keep_alive = false;
        }

        // Framing fields go to the wire only; the handler's map stays as written.
        let mut framing_headers: Vec<(&str, &str)> = Vec::with_capacity(2);
        self.framing = if self.head_request || status < 200 || status == 204 || status == 304 {
            Framing::NoBody
        } else if has_length {
            Framing::Length
        } else if finishing {
            framing_headers.push(("Content-Length", "0"));
            Framing::Length
        } else if self.version >= 1 {
            framing_headers.push(("Transfer-Encoding", "chunked"));
            Framing::Chunked
        } else {
            self.keep_alive = false;
            Framing::Close
        };

        if !self.keep_alive {
            framing_headers.push(("Connection", "close"));
        } else if self.version == 0 {
            framing_headers.push(("Connection", "keep-alive"));
        }

        let mut head = BytesMut::with_capacity(128 + self.headers.len() * 64);
        head.put(format!("HTTP/1.{} {} {}\r\n", self.version.min(1), status, reason_for(status)).as_bytes());
        if !self.headers.contains("date") {
            head.put(format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())).as_bytes());
        }
        for (name, value) in self.headers.iter() {
            if is_framing_header(name) {
                continue;
            }
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }
        for (name, value) in framing_headers {
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }
        head.put(&b"\r\n"[..]);
        self.io.write_all(&head).await
    }
}

/// Fields the connection owns. Values a handler set are replaced by what
/// this writer's framing decides.
fn is_framing_header(name: &str) -> bool {
    ["transfer-encoding", "connection", "keep-alive"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseWriter for ConnectionWriter<W> {
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
        if self.framing == Framing::Pending {
            self.send_head(false).await?;
        }
        if buf.is_empty() {
            return Ok(());
        }
        match self.framing {
            Framing::NoBody | Framing::Pending => Ok(()),
            Framing::Length | Framing::Close => self.io.write_all(buf).await,
            Framing::Chunked => {
                self.io.write_all(format!("{:x}\r\n", buf.len()).as_bytes()).await?;
                self.io.write_all(buf).await?;
                self.io.write_all(b"\r\n").await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::cache::{CacheEngine, CacheLayer, MemoryStore};

    struct Chunks;

    #[async_trait]
    impl Handler for Chunks {
        async fn serve(&self, req: &Request, w: &mut dyn ResponseWriter) {
            w.headers_mut().set("Content-Type", "text/plain");
            w.write_header(200);
            let _ = w.write(b"hello ").await;
            let _ = w.write(req.path().as_bytes()).await;
        }
    }

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn serve(&self, req: &Request, w: &mut dyn ResponseWriter) {
            let body = req.body().clone();
            w.headers_mut().set("Content-Length", body.len().to_string());
            w.write_header(201);
            let _ = w.write(&body).await;
        }
    }

    struct Empty(u16);

    #[async_trait]
    impl Handler for Empty {
        async fn serve(&self, _req: &Request, w: &mut dyn ResponseWriter) {
            w.write_header(self.0);
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    async fn exchange<H: Handler + 'static>(handler: H, raw: &str) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(server, peer(), Arc::new(handler)));
        client.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap().unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn http11_without_length_is_chunked() {
        let out = exchange(Chunks, "GET /x HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\n6\r\nhello \r\n2\r\n/x\r\n0\r\n\r\n"), "{out}");
    }

    #[tokio::test]
    async fn content_length_is_passed_through() {
        let raw = "POST /echo HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping";
        let out = exchange(Echo, raw).await;
        assert!(out.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(!out.contains("chunked"));
        assert!(out.ends_with("\r\n\r\nping"));
    }

    #[tokio::test]
    async fn http10_body_is_close_delimited() {
        let out = exchange(Chunks, "GET /old HTTP/1.0\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("Transfer-Encoding"));
        assert!(out.ends_with("\r\n\r\nhello /old"));
    }

    #[tokio::test]
    async fn head_and_not_modified_have_no_body() {
        let out = exchange(Chunks, "HEAD /x HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").await;
        assert!(out.ends_with("\r\n\r\n"));
        assert!(!out.contains("hello"));

        let out = exchange(Empty(304), "GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!out.contains("Content-Length"));
    }

    #[tokio::test]
    async fn empty_body_gets_zero_length() {
        let out = exchange(Empty(0), "GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn keep_alive_serves_pipelined_requests() {
        let raw = "GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n";
        let out = exchange(Chunks, raw).await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(out.contains("hello \r\n4\r\n/one"));
        assert!(out.contains("hello \r\n4\r\n/two"));
    }

    struct Timestamp;

    #[async_trait]
    impl Handler for Timestamp {
        async fn serve(&self, _req: &Request, w: &mut dyn ResponseWriter) {
            w.headers_mut().set("Cache-Control", "max-age=60");
            w.write_header(200);
            let _ = w.write(b"generated").await;
        }
    }

    #[tokio::test]
    async fn framing_headers_stay_off_the_handler_map() {
        let (mut client, server) = duplex(4096);
        let req = Request::new(Method::Get, "/x").with_header("Host", "a");
        let mut writer = ConnectionWriter::new(server, &req);
        writer.write_header(200);
        writer.write(b"abc").await.unwrap();
        writer.finish().await.unwrap();

        assert!(!writer.headers().contains("transfer-encoding"));
        assert!(!writer.headers().contains("connection"));
        drop(writer);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Transfer-Encoding: chunked\r\n"));
    }

    async fn read_response(client: &mut DuplexStream, terminator: &[u8]) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while !out.ends_with(terminator) {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn cache_hit_is_framed_for_its_own_connection() {
        let engine = Arc::new(CacheEngine::new(MemoryStore::new()));
        let layer = CacheLayer::new(Arc::clone(&engine), Timestamp);
        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(server, peer(), Arc::new(layer)));

        client.write_all(b"GET /time HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
        let miss = read_response(&mut client, b"0\r\n\r\n").await;
        assert!(miss.contains("X-Cache: SKIP\r\n"), "{miss}");
        assert!(miss.ends_with("9\r\ngenerated\r\n0\r\n\r\n"), "{miss}");
        assert!(engine.drain(Duration::from_secs(5)).await);

        client
            .write_all(b"GET /time HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap().unwrap();
        let hit = String::from_utf8(out).unwrap();

        assert!(hit.contains("X-Cache: HIT\r\n"), "{hit}");
        assert!(hit.contains("Content-Length: 9\r\n"), "{hit}");
        assert!(!hit.contains("Transfer-Encoding"), "{hit}");
        assert_eq!(hit.matches("Connection:").count(), 1, "{hit}");
        assert!(hit.ends_with("\r\n\r\ngenerated"), "{hit}");
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let out = exchange(Chunks, "NOT HTTP\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
    }
}
