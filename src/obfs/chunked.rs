//! Obfuscation framer
//!
//! Makes an arbitrary byte stream resemble HTTP chunked-transfer traffic:
//!
//! - a one-time HTTP-shaped header exchange as a handshake
//! - every write framed as `<hex-len>\r\n<payload>\r\n`; an empty write is
//!   the end-of-stream marker
//! - a graceful close that drains to the peer's end-of-stream marker and
//!   returns the underlying connection to a reuse pool
//!
//! Reads are mutually exclusive: a read that finds another read in flight
//! fails fast instead of blocking, while the closer's drain loop waits for
//! the in-flight read to reach a safe point by queueing on the same lock.

use super::remain::{RemainReader, RemainStream, RemainWriter};
use super::{ObfsError, Role, TunnelStream};
use crate::http::HeaderAcceptor;
use crate::pool::ConnPool;
use crate::BUFFER_SIZE;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Inbound side of the framer: the remain-aware read half plus the chunk
/// state machine that decodes it.
pub(crate) struct ReadState {
    inner: Option<RemainReader>,
    role: Role,
    /// Bytes left in the current inbound chunk, including its 2-byte
    /// trailing terminator. Zero means "parse a new chunk header next".
    chunk_remaining: usize,
    eos: bool,
}

impl ReadState {
    /// Consume the one-time disguise header off the wire. Bytes past the
    /// header boundary are payload: as much as fits goes straight into
    /// `buf`, the rest is re-queued as look-ahead for the next read.
    async fn read_obfs_header(&mut self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        let mut acceptor = match self.role {
            Role::AwaitingRequestHeader => HeaderAcceptor::request(),
            Role::AwaitingResponseHeader => HeaderAcceptor::response(),
            Role::Framing => return Ok(0),
        };
        let reader = self.inner.as_mut().ok_or(ObfsError::Closed)?;

        let mut scratch = vec![0u8; BUFFER_SIZE];
        let n = reader.read(&mut scratch).await?;
        if n == 0 {
            return Err(ObfsError::ShortRead);
        }

        let mut it = 0;
        let mut done = false;
        while it < n && !done {
            done = acceptor.feed(scratch[it])?;
            it += 1;
        }
        if !done {
            return Err(ObfsError::UnexpectedHeader);
        }
        self.role = Role::Framing;
        debug!("obfuscation handshake complete");

        let leftover = &scratch[it..n];
        if leftover.is_empty() {
            return Ok(0);
        }
        let copied = buf.len().min(leftover.len());
        buf[..copied].copy_from_slice(&leftover[..copied]);
        if copied < leftover.len() {
            reader.unread(&leftover[copied..]);
        }
        Ok(copied)
    }

    /// Read from the connection, consuming the disguise header first if the
    /// handshake has not completed yet.
    async fn do_read(&mut self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        if self.role != Role::Framing {
            let n = self.read_obfs_header(buf).await?;
            if n != 0 {
                return Ok(n);
            }
        }
        let reader = self.inner.as_mut().ok_or(ObfsError::Closed)?;
        Ok(reader.read(buf).await?)
    }

    /// Read exactly `buf.len()` bytes, honoring the look-ahead buffer.
    async fn read_full(&mut self, buf: &mut [u8]) -> Result<(), ObfsError> {
        let reader = self.inner.as_mut().ok_or(ObfsError::Closed)?;
        let mut off = 0;
        while off < buf.len() {
            let n = reader.read(&mut buf[off..]).await?;
            if n == 0 {
                return Err(ObfsError::ShortRead);
            }
            off += n;
        }
        Ok(())
    }

    /// One step of the inbound chunk state machine.
    pub(crate) async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.eos {
            return Err(ObfsError::EndOfStream);
        }

        // Trailer bytes left over from a chunk a previous read drained
        if self.chunk_remaining > 0 && self.chunk_remaining <= 2 {
            let mut trailer = [0u8; 2];
            let k = self.chunk_remaining;
            self.read_full(&mut trailer[..k]).await?;
            self.chunk_remaining = 0;
        }

        if self.chunk_remaining == 0 {
            self.chunk_remaining = self.parse_chunk_header(buf).await? + 2;
        }

        // An empty chunk straight after its header is the end-of-stream marker
        if self.chunk_remaining == 2 {
            let mut trailer = [0u8; 2];
            self.read_full(&mut trailer).await?;
            self.eos = true;
            return Err(ObfsError::EndOfStream);
        }

        let want = self.chunk_remaining.min(buf.len());
        let n = self.do_read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ObfsError::ShortRead);
        }
        self.chunk_remaining -= n;
        // Bytes read past the payload boundary are the trailing terminator;
        // they are consumed but never exposed to the caller.
        let mut produced = n;
        if self.chunk_remaining < 2 {
            produced -= 2 - self.chunk_remaining;
        }
        Ok(produced)
    }

    /// Parse `<lowercase-hex length>\r\n`, one byte at a time so that no
    /// payload byte is ever consumed ahead of its header.
    async fn parse_chunk_header(&mut self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        let mut len: usize = 0;
        let mut digits = 0usize;
        loop {
            let n = self.do_read(&mut buf[..1]).await?;
            if n == 0 {
                return Err(ObfsError::ShortRead);
            }
            match buf[0] {
                b @ (b'0'..=b'9' | b'a'..=b'f') => {
                    let digit = match b {
                        b'0'..=b'9' => (b - b'0') as usize,
                        _ => (b - b'a' + 10) as usize,
                    };
                    len = len
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(digit))
                        .ok_or(ObfsError::LengthOverflow)?;
                    digits += 1;
                }
                b'\r' => {}
                b'\n' => break,
                other => return Err(ObfsError::InvalidLengthByte(other as char)),
            }
        }
        if digits == 0 {
            return Err(ObfsError::EmptyChunkLength);
        }
        Ok(len)
    }
}

/// A connection framed as HTTP chunked-transfer traffic.
///
/// Exactly one framer wraps one [`RemainStream`]. All methods take `&self`;
/// share the framer between tasks with [`std::sync::Arc`].
pub struct ObfsStream {
    rd: Mutex<ReadState>,
    wr: Mutex<Option<RemainWriter>>,
    destroyed: AtomicBool,
    pool: Option<ConnPool>,
}

impl ObfsStream {
    fn with_role(stream: RemainStream, role: Role, pool: Option<ConnPool>) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            rd: Mutex::new(ReadState {
                inner: Some(reader),
                role,
                chunk_remaining: 0,
                eos: false,
            }),
            wr: Mutex::new(Some(writer)),
            destroyed: AtomicBool::new(false),
            pool,
        }
    }

    /// Framer in plain framing mode (handshake already done or not wanted)
    pub fn new(stream: RemainStream, pool: Option<ConnPool>) -> Self {
        Self::with_role(stream, Role::Framing, pool)
    }

    /// Accept-role framer: expects to consume an HTTP-request-shaped header
    /// before the first chunk. The caller queues the sniffed bytes as
    /// look-ahead and the disguise response as the pending write prefix.
    pub fn accepting(stream: RemainStream, pool: Option<ConnPool>) -> Self {
        Self::with_role(stream, Role::AwaitingRequestHeader, pool)
    }

    /// Arm the framer for a dial: an HTTP-response-shaped header is expected
    /// from the peer before the first chunk, and `header` is sent ahead of
    /// the first payload write. Used both on freshly wrapped connections and
    /// on framers reused from the pool.
    pub async fn expect_response(&self, header: &[u8]) -> Result<(), ObfsError> {
        {
            let mut rd = self.rd.lock().await;
            if rd.inner.is_none() {
                return Err(ObfsError::Closed);
            }
            rd.role = Role::AwaitingResponseHeader;
        }
        let mut wr = self.wr.lock().await;
        wr.as_mut().ok_or(ObfsError::Closed)?.queue(header);
        Ok(())
    }

    /// Arm the framer for a new accepted session: an HTTP-request-shaped
    /// header is expected from the peer, and `response` is sent ahead of
    /// the first reply write. Used when a listener revives a framer from
    /// its pool.
    pub async fn expect_request(&self, response: &[u8]) -> Result<(), ObfsError> {
        {
            let mut rd = self.rd.lock().await;
            if rd.inner.is_none() {
                return Err(ObfsError::Closed);
            }
            rd.role = Role::AwaitingRequestHeader;
        }
        let mut wr = self.wr.lock().await;
        wr.as_mut().ok_or(ObfsError::Closed)?.queue(response);
        Ok(())
    }

    /// Read decoded payload bytes.
    ///
    /// Fails fast with [`ObfsError::ConcurrentRead`] if another read is in
    /// flight; this is a caller-misuse guard, not a queueing mechanism. The
    /// peer's end-of-stream marker surfaces as [`ObfsError::EndOfStream`].
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ObfsError::Closed);
        }
        let mut rd = self
            .rd
            .try_lock()
            .map_err(|_| ObfsError::ConcurrentRead)?;
        rd.read_chunk(buf).await
    }

    /// Write `buf` as one chunk. An empty `buf` emits the end-of-stream
    /// marker. The full frame is assembled in one buffer so the chunk header
    /// is never split from its body.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, ObfsError> {
        let mut frame = BytesMut::with_capacity(buf.len() + 16);
        frame.extend_from_slice(format!("{:x}\r\n", buf.len()).as_bytes());
        frame.extend_from_slice(buf);
        frame.extend_from_slice(b"\r\n");

        let mut wr = self.wr.lock().await;
        let writer = wr.as_mut().ok_or(ObfsError::Closed)?;
        writer.write(&frame).await?;
        Ok(buf.len())
    }

    /// Close the connection, gracefully when a pool is attached.
    ///
    /// Idempotent. Without a pool this is an ordinary close. With a pool the
    /// end-of-stream marker is written, inbound chunks are drained until the
    /// peer's own marker arrives, and a fresh framer over the same underlying
    /// connection is handed to the pool; any failure before the marker tears
    /// the connection down instead.
    pub async fn close(&self) -> Result<(), ObfsError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(pool) = self.pool.clone() else {
            return self.hard_close().await;
        };

        if let Err(e) = self.write(&[]).await {
            warn!("graceful close: end-of-stream write failed: {e}");
            return self.hard_close().await;
        }

        let mut scratch = vec![0u8; BUFFER_SIZE];
        loop {
            // Queue behind any in-flight read; it finishes at a safe point.
            let mut rd = self.rd.lock().await;
            if rd.eos {
                break;
            }
            match rd.read_chunk(&mut scratch).await {
                Ok(_) => {}
                Err(ObfsError::EndOfStream) => break,
                Err(e) => {
                    drop(rd);
                    warn!("graceful close: drain failed, tearing down: {e}");
                    return self.hard_close().await;
                }
            }
        }

        let reader = self.rd.lock().await.inner.take();
        let writer = self.wr.lock().await.take();
        if let (Some(reader), Some(writer)) = (reader, writer) {
            let fresh = ObfsStream::from_parts(reader, writer, Some(pool.clone()));
            if let Err(fresh) = pool.put(fresh) {
                warn!("graceful close: pool rejected connection, tearing down");
                return fresh.hard_close().await;
            }
            debug!("graceful close: connection returned to pool");
        }
        Ok(())
    }

    fn from_parts(reader: RemainReader, writer: RemainWriter, pool: Option<ConnPool>) -> Self {
        Self {
            rd: Mutex::new(ReadState {
                inner: Some(reader),
                role: Role::Framing,
                chunk_remaining: 0,
                eos: false,
            }),
            wr: Mutex::new(Some(writer)),
            destroyed: AtomicBool::new(false),
            pool,
        }
    }

    async fn hard_close(&self) -> Result<(), ObfsError> {
        self.rd.lock().await.inner.take();
        if let Some(mut writer) = self.wr.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObfsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfsStream")
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[async_trait]
impl TunnelStream for ObfsStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        ObfsStream::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ObfsError> {
        ObfsStream::write(self, buf).await
    }

    async fn close(&self) -> Result<(), ObfsError> {
        ObfsStream::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn framed_pair() -> (ObfsStream, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(crate::BUFFER_SIZE);
        (ObfsStream::new(RemainStream::new(Box::new(a)), None), b)
    }

    fn framed_both() -> (ObfsStream, ObfsStream) {
        let (a, b) = tokio::io::duplex(crate::BUFFER_SIZE);
        (
            ObfsStream::new(RemainStream::new(Box::new(a)), None),
            ObfsStream::new(RemainStream::new(Box::new(b)), None),
        )
    }

    #[tokio::test]
    async fn test_write_produces_chunk_frame() {
        let (stream, mut peer) = framed_pair();
        let n = stream.write(b"ping").await.unwrap();
        assert_eq!(n, 4);

        let mut buf = [0u8; 32];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"4\r\nping\r\n");
    }

    #[tokio::test]
    async fn test_empty_write_is_end_of_stream_marker() {
        let (stream, mut peer) = framed_pair();
        stream.write(&[]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_chunk_roundtrip() {
        let (a, b) = framed_both();
        a.write(b"hello chunked world").await.unwrap();

        let mut buf = [0u8; 64];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello chunked world");
    }

    #[tokio::test]
    async fn test_end_of_stream_surfaces_as_signal() {
        let (a, b) = framed_both();
        a.write(&[]).await.unwrap();

        let mut buf = [0u8; 16];
        let err = b.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ObfsError::EndOfStream));
    }

    #[tokio::test]
    async fn test_invalid_hex_digit_is_framing_error() {
        let (stream, mut peer) = framed_pair();
        peer.write_all(b"g\r\nxx\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ObfsError::InvalidLengthByte('g')));
    }

    #[tokio::test]
    async fn test_empty_chunk_length_is_framing_error() {
        let (stream, mut peer) = framed_pair();
        peer.write_all(b"\r\n").await.unwrap();

        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ObfsError::EmptyChunkLength));
    }

    #[tokio::test]
    async fn test_chunk_streams_into_small_buffers() {
        let (stream, mut peer) = framed_pair();
        peer.write_all(b"8\r\ndeadbeef\r\n4\r\nnext\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        while out.len() < 8 {
            let n = stream.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&out, b"deadbeef");

        // framing state survives the partial reads
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"next");
    }

    #[tokio::test]
    async fn test_concurrent_read_fails_fast() {
        let (stream, mut peer) = framed_pair();
        let stream = Arc::new(stream);

        let reader = stream.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = reader.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ObfsError::ConcurrentRead));

        // the in-flight read still decodes correct framing
        peer.write_all(b"3\r\nabc\r\n").await.unwrap();
        assert_eq!(pending.await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_read_after_close_is_rejected() {
        let (stream, _peer) = framed_pair();
        stream.close().await.unwrap();
        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, ObfsError::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (stream, _peer) = framed_pair();
        stream.close().await.unwrap();
        stream.close().await.unwrap();
    }
}
