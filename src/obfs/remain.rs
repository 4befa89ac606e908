//! RemainBuffer wrapper
//!
//! Wraps a raw stream connection and injects previously sniffed look-ahead
//! bytes back into the read path, and not-yet-sent header bytes in front of
//! the next write. This is the foundation the obfuscation framer builds on,
//! and doubles as the plain passthrough path for accepted connections that
//! do not speak the disguise protocol.
//!
//! The split halves carry no locking of their own; callers serialize access.

use super::{ObfsError, RawStream, TunnelStream};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Boxed raw connection underneath the wrapper chain
pub type BoxedRaw = Box<dyn RawStream>;

/// Read half with a look-ahead buffer that is drained before the connection
pub(crate) struct RemainReader {
    inner: ReadHalf<BoxedRaw>,
    remain: BytesMut,
}

impl RemainReader {
    /// Read look-ahead bytes first; only an empty buffer touches the
    /// underlying connection.
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remain.is_empty() {
            return self.inner.read(buf).await;
        }
        let n = buf.len().min(self.remain.len());
        buf[..n].copy_from_slice(&self.remain[..n]);
        self.remain.advance(n);
        Ok(n)
    }

    /// Queue bytes to be delivered ahead of the underlying connection
    pub(crate) fn unread(&mut self, bytes: &[u8]) {
        self.remain.extend_from_slice(bytes);
    }
}

/// Write half with a pending prefix that rides along with the next write
pub(crate) struct RemainWriter {
    inner: WriteHalf<BoxedRaw>,
    wremain: BytesMut,
}

impl RemainWriter {
    /// Write `buf`, prepending any pending prefix in a single underlying
    /// write. The prefix is not counted against the caller.
    pub(crate) async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.wremain.is_empty() {
            self.inner.write_all(buf).await?;
            self.inner.flush().await?;
            return Ok(buf.len());
        }
        let mut joined = BytesMut::with_capacity(self.wremain.len() + buf.len());
        joined.extend_from_slice(&self.wremain);
        joined.extend_from_slice(buf);
        self.inner.write_all(&joined).await?;
        self.inner.flush().await?;
        self.wremain.clear();
        Ok(buf.len())
    }

    /// Queue bytes to precede the next write
    pub(crate) fn queue(&mut self, bytes: &[u8]) {
        self.wremain.extend_from_slice(bytes);
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// A raw connection with look-ahead and pending-prefix buffers.
///
/// `remain` and `wremain` are each consumed exactly once, in full, before
/// reads and writes fall through to the underlying connection.
pub struct RemainStream {
    reader: RemainReader,
    writer: RemainWriter,
}

impl RemainStream {
    /// Wrap a raw connection
    pub fn new(conn: BoxedRaw) -> Self {
        let (rd, wr) = tokio::io::split(conn);
        Self {
            reader: RemainReader {
                inner: rd,
                remain: BytesMut::new(),
            },
            writer: RemainWriter {
                inner: wr,
                wremain: BytesMut::new(),
            },
        }
    }

    /// Queue already-read bytes for redelivery on the next read
    pub fn set_lookahead(&mut self, bytes: &[u8]) {
        self.reader.unread(bytes);
    }

    /// Queue bytes to be sent ahead of the next write
    pub fn queue_write(&mut self, bytes: &[u8]) {
        self.writer.queue(bytes);
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf).await
    }

    pub(crate) fn into_split(self) -> (RemainReader, RemainWriter) {
        (self.reader, self.writer)
    }
}

/// Unframed passthrough for accepted connections that did not present the
/// disguise handshake. Carries the sniffed bytes as look-ahead.
pub struct PlainStream {
    rd: Mutex<RemainReader>,
    wr: Mutex<RemainWriter>,
    destroyed: AtomicBool,
}

impl PlainStream {
    pub fn new(stream: RemainStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            rd: Mutex::new(rd),
            wr: Mutex::new(wr),
            destroyed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TunnelStream for PlainStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        let mut rd = self.rd.lock().await;
        Ok(rd.read(buf).await?)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ObfsError> {
        let mut wr = self.wr.lock().await;
        Ok(wr.write(buf).await?)
    }

    async fn close(&self) -> Result<(), ObfsError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.wr.lock().await.shutdown().await?;
        Ok(())
    }
}
