//! Dual-consumer response capture.
//!
//! [`CaptureStream`] wraps the client-facing [`ResponseWriter`]. Every body
//! chunk is appended once to a shared in-memory spool and then forwarded to
//! the client; the client path never waits on a capture consumer. Any
//! number of [`CaptureReader`]s can read the spool concurrently, each from
//! offset zero, blocking until more bytes arrive or the stream is closed.
//!
//! Chunks are stored as [`Bytes`], so readers share the buffered data
//! instead of copying it.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};

use super::error::CaptureError;
use crate::http::{Headers, ResponseWriter};

#[derive(Default)]
struct SpoolState {
    chunks: Vec<Bytes>,
    len: usize,
    closed: bool,
    error: Option<CaptureError>,
}

#[derive(Default)]
struct Spool {
    state: Mutex<SpoolState>,
    changed: Notify,
}

impl Spool {
    fn update(&self, f: impl FnOnce(&mut SpoolState)) {
        f(&mut self.state.lock());
        self.changed.notify_waiters();
    }
}

/// Resolves once the wrapped response's status is known.
#[derive(Clone)]
pub struct HeaderSignal {
    rx: watch::Receiver<Option<u16>>,
}

impl HeaderSignal {
    /// Waits for the status. Returns `None` if the stream was dropped first.
    pub async fn wait(&mut self) -> Option<u16> {
        self.rx.wait_for(Option::is_some).await.ok().and_then(|s| *s)
    }
}

/// Single-writer, multi-reader tee between a handler and the client.
///
/// # Examples
///
/// ```
/// use keepsake::cache::CaptureStream;
/// use keepsake::http::{Response, ResponseWriter};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut client = Response::recorder();
/// let mut capture = CaptureStream::new(&mut client, None);
/// let reader = capture.reader();
///
/// capture.write_header(200);
/// capture.write(b"hello").await.unwrap();
/// capture.close();
///
/// assert_eq!(&reader.read_to_end().await.unwrap()[..], b"hello");
/// drop(capture);
/// assert_eq!(&client.body_bytes()[..], b"hello");
/// # }
/// ```
pub struct CaptureStream<'w> {
    inner: &'w mut dyn ResponseWriter,
    status: Option<u16>,
    signal: watch::Sender<Option<u16>>,
    spool: Arc<Spool>,
    limit: Option<usize>,
}

impl<'w> CaptureStream<'w> {
    /// Wraps `inner`. `limit` caps the captured body size; beyond it the
    /// capture is abandoned while forwarding continues.
    pub fn new(inner: &'w mut dyn ResponseWriter, limit: Option<usize>) -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            inner,
            status: None,
            signal,
            spool: Arc::default(),
            limit,
        }
    }

    /// A new reader positioned at the start of the captured body.
    pub fn reader(&self) -> CaptureReader {
        CaptureReader {
            spool: Arc::clone(&self.spool),
            next_chunk: 0,
        }
    }

    /// A handle that resolves once the status is written.
    pub fn header_signal(&self) -> HeaderSignal {
        HeaderSignal {
            rx: self.signal.subscribe(),
        }
    }

    /// The status recorded by the first `write_header`, or `0` if the
    /// handler never set one.
    pub fn status(&self) -> u16 {
        self.status.unwrap_or(0)
    }

    /// The capture error, if capture has failed.
    pub fn error(&self) -> Option<CaptureError> {
        self.spool.state.lock().error.clone()
    }

    /// Marks the end of the body. Readers drain what is buffered and then
    /// see end-of-stream.
    pub fn close(&self) {
        self.spool.update(|state| state.closed = true);
    }

    fn fire_signal(&self, status: u16) {
        self.signal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        });
    }

    fn capture(&self, buf: &[u8]) {
        let limit = self.limit;
        self.spool.update(|state| {
            if state.error.is_some() || state.closed {
                return;
            }
            if let Some(limit) = limit {
                if state.len + buf.len() > limit {
                    state.chunks = Vec::new();
                    state.error = Some(CaptureError::Overflow { limit });
                    return;
                }
            }
            state.len += buf.len();
            state.chunks.push(Bytes::copy_from_slice(buf));
        });
    }

    fn fail(&self, error: CaptureError) {
        self.spool.update(|state| {
            state.chunks = Vec::new();
            state.error.get_or_insert(error);
        });
    }
}

#[async_trait]
impl ResponseWriter for CaptureStream<'_> {
    fn headers(&self) -> &Headers {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut Headers {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: u16) {
        if self.status.is_some() {
            return;
        }
        self.status = Some(status);
        self.inner.write_header(status);
        self.fire_signal(status);
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.status.is_none() {
            // The inner writer commits its default status on first write.
            self.status = Some(0);
            self.fire_signal(0);
        }
        self.capture(buf);
        let forwarded = self.inner.write(buf).await;
        if let Err(e) = &forwarded {
            self.fail(CaptureError::Forward(e.to_string()));
        }
        forwarded
    }
}

impl Drop for CaptureStream<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer side of a [`CaptureStream`].
pub struct CaptureReader {
    spool: Arc<Spool>,
    next_chunk: usize,
}

impl CaptureReader {
    /// The next captured chunk, waiting for one if necessary.
    ///
    /// Returns `Ok(None)` at end-of-stream.
    ///
    /// # Errors
    ///
    /// The capture error once capture has failed, even if earlier chunks
    /// were already read.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CaptureError> {
        loop {
            // Register before checking so a write between the check and the
            // await is not missed.
            let changed = self.spool.changed.notified();
            {
                let state = self.spool.state.lock();
                if let Some(error) = &state.error {
                    return Err(error.clone());
                }
                if let Some(chunk) = state.chunks.get(self.next_chunk) {
                    self.next_chunk += 1;
                    return Ok(Some(chunk.clone()));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            changed.await;
        }
    }

    /// Reads until end-of-stream and returns the whole body.
    pub async fn read_to_end(mut self) -> Result<Bytes, CaptureError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            chunks.push(chunk);
        }
        if chunks.len() == 1 {
            if let Some(only) = chunks.pop() {
                return Ok(only);
            }
        }
        let mut body = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in &chunks {
            body.extend_from_slice(chunk);
        }
        Ok(body.freeze())
    }
}
