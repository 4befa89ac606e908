//! Write-coalescing wrapper
//!
//! A passive observer can fingerprint proxy traffic from the sizes and
//! timing of individual writes. [`DelayStream`] batches small writes in a
//! fixed buffer and flushes them in one underlying write after a short
//! delay, trading a few milliseconds of latency for fewer, larger segments.
//!
//! The background flush task is started lazily on the first buffered write
//! and stops when the connection is closed.

use super::{ObfsError, TunnelStream};
use crate::BUFFER_SIZE;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::warn;

/// How long the flush task waits after a write for more data to coalesce
pub const DELAY_TICK: Duration = Duration::from_millis(10);

struct DelayBuf {
    data: Vec<u8>,
    off: usize,
    started: bool,
}

struct DelayShared<S> {
    inner: S,
    wbuf: Mutex<DelayBuf>,
    /// Signals the flush task that buffered data is available
    wakeup: Notify,
    /// Signals the flush task to stop
    die: Notify,
    destroyed: AtomicBool,
}

impl<S: TunnelStream> DelayShared<S> {
    async fn shutdown(&self) -> Result<(), ObfsError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.die.notify_one();
        self.wakeup.notify_one();
        self.inner.close().await
    }
}

/// Wraps a stream and coalesces small writes on a short timer.
pub struct DelayStream<S: TunnelStream + 'static> {
    shared: Arc<DelayShared<S>>,
}

impl<S: TunnelStream + 'static> Clone for DelayStream<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: TunnelStream + 'static> DelayStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            shared: Arc::new(DelayShared {
                inner,
                wbuf: Mutex::new(DelayBuf {
                    data: vec![0u8; BUFFER_SIZE],
                    off: 0,
                    started: false,
                }),
                wakeup: Notify::new(),
                die: Notify::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Reads are not delayed; they go straight to the wrapped stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        self.shared.inner.read(buf).await
    }

    /// Buffer `buf` for a coalesced flush. A write that would reach the
    /// buffer capacity flushes buffered bytes and `buf` together in one
    /// immediate underlying write instead.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, ObfsError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(ObfsError::Closed);
        }

        let mut wbuf = self.shared.wbuf.lock().await;
        if wbuf.off + buf.len() >= BUFFER_SIZE {
            let mut joined = Vec::with_capacity(wbuf.off + buf.len());
            joined.extend_from_slice(&wbuf.data[..wbuf.off]);
            joined.extend_from_slice(buf);
            wbuf.off = 0;
            self.shared.inner.write(&joined).await?;
            return Ok(buf.len());
        }

        let off = wbuf.off;
        wbuf.data[off..off + buf.len()].copy_from_slice(buf);
        wbuf.off += buf.len();
        if !wbuf.started {
            wbuf.started = true;
            tokio::spawn(flush_loop(Arc::clone(&self.shared)));
        }
        drop(wbuf);
        self.shared.wakeup.notify_one();
        Ok(buf.len())
    }

    /// Idempotent: stops the flush task and closes the wrapped stream.
    pub async fn close(&self) -> Result<(), ObfsError> {
        self.shared.shutdown().await
    }
}

async fn flush_loop<S: TunnelStream + 'static>(shared: Arc<DelayShared<S>>) {
    loop {
        // Wait until there is something to flush
        loop {
            if shared.destroyed.load(Ordering::SeqCst) {
                return;
            }
            if shared.wbuf.lock().await.off > 0 {
                break;
            }
            shared.wakeup.notified().await;
        }

        // Let a burst of writes pile up before flushing
        tokio::select! {
            _ = shared.die.notified() => return,
            _ = sleep(DELAY_TICK) => {}
        }

        let mut wbuf = shared.wbuf.lock().await;
        if shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if wbuf.off == 0 {
            continue;
        }
        let res = shared.inner.write(&wbuf.data[..wbuf.off]).await;
        wbuf.off = 0;
        drop(wbuf);
        if let Err(e) = res {
            warn!("coalesced flush failed, closing connection: {e}");
            let _ = shared.shutdown().await;
            return;
        }
    }
}

#[async_trait]
impl<S: TunnelStream + 'static> TunnelStream for DelayStream<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        DelayStream::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ObfsError> {
        DelayStream::write(self, buf).await
    }

    async fn close(&self) -> Result<(), ObfsError> {
        DelayStream::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every underlying write for coalescing assertions.
    struct RecordingStream {
        writes: std::sync::Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl RecordingStream {
        fn new() -> Self {
            Self {
                writes: std::sync::Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TunnelStream for Arc<RecordingStream> {
        async fn read(&self, _buf: &mut [u8]) -> Result<usize, ObfsError> {
            Ok(0)
        }

        async fn write(&self, buf: &[u8]) -> Result<usize, ObfsError> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        async fn close(&self) -> Result<(), ObfsError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_burst_collapses_into_one_write() {
        let recorder = Arc::new(RecordingStream::new());
        let delayed = DelayStream::new(recorder.clone());

        delayed.write(b"a").await.unwrap();
        delayed.write(b"b").await.unwrap();
        delayed.write(b"c").await.unwrap();

        tokio::time::sleep(DELAY_TICK * 6).await;

        let writes = recorder.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], b"abc");
    }

    #[tokio::test]
    async fn test_bytes_preserved_in_order_across_ticks() {
        let recorder = Arc::new(RecordingStream::new());
        let delayed = DelayStream::new(recorder.clone());

        delayed.write(b"first").await.unwrap();
        tokio::time::sleep(DELAY_TICK * 6).await;
        delayed.write(b"second").await.unwrap();
        tokio::time::sleep(DELAY_TICK * 6).await;

        let flat: Vec<u8> = recorder.writes().concat();
        assert_eq!(flat, b"firstsecond");
        assert!(recorder.writes().len() <= 2);
    }

    #[tokio::test]
    async fn test_overflow_flushes_immediately() {
        let recorder = Arc::new(RecordingStream::new());
        let delayed = DelayStream::new(recorder.clone());

        delayed.write(b"small").await.unwrap();
        let big = vec![0x42u8; BUFFER_SIZE];
        delayed.write(&big).await.unwrap();

        // no timer involved: the combined bytes are already out
        let writes = recorder.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 5 + BUFFER_SIZE);
        assert_eq!(&writes[0][..5], b"small");

        // offset was reset: the next small write coalesces as usual
        delayed.write(b"tail").await.unwrap();
        tokio::time::sleep(DELAY_TICK * 6).await;
        assert_eq!(recorder.writes().last().unwrap(), b"tail");
    }

    #[tokio::test]
    async fn test_empty_write_is_a_no_op() {
        let recorder = Arc::new(RecordingStream::new());
        let delayed = DelayStream::new(recorder.clone());

        assert_eq!(delayed.write(&[]).await.unwrap(), 0);
        tokio::time::sleep(DELAY_TICK * 4).await;
        assert!(recorder.writes().is_empty());
    }

    #[tokio::test]
    async fn test_close_stops_flush_and_is_idempotent() {
        let recorder = Arc::new(RecordingStream::new());
        let delayed = DelayStream::new(recorder.clone());

        delayed.write(b"pending").await.unwrap();
        delayed.close().await.unwrap();
        delayed.close().await.unwrap();
        assert!(recorder.closed.load(Ordering::SeqCst));

        let err = delayed.write(b"late").await.unwrap_err();
        assert!(matches!(err, ObfsError::Closed));
    }
}
