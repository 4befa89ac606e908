//! Connection-wrapping layer
//!
//! Provides the three wrappers that turn a raw connection into
//! HTTP-chunked-looking traffic:
//! - [`RemainStream`]: look-ahead / pending-prefix buffering
//! - [`ObfsStream`]: handshake, chunk framing, graceful pooled close
//! - [`DelayStream`]: write coalescing against size/timing fingerprinting
//!
//! plus the [`dial_obfs`]/[`accept_obfs`] entry points that assemble the
//! chain for the outbound and inbound roles.

mod chunked;
mod delay;
mod remain;

pub use chunked::ObfsStream;
pub use delay::{DelayStream, DELAY_TICK};
pub use remain::{BoxedRaw, PlainStream, RemainStream};

use crate::config::Config;
use crate::http::{self, HttpError, REQUEST_METHOD};
use crate::pool::ConnPool;
use crate::BUFFER_SIZE;
use async_trait::async_trait;
use rand::Rng;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Any raw byte stream the wrappers can sit on
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// Obfuscation layer errors
#[derive(Debug, Error)]
pub enum ObfsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake header error: {0}")]
    Http(#[from] HttpError),

    #[error("unexpected obfuscation header")]
    UnexpectedHeader,

    #[error("short read")]
    ShortRead,

    #[error("invalid chunk length character: {0:?}")]
    InvalidLengthByte(char),

    #[error("empty chunk length")]
    EmptyChunkLength,

    #[error("chunk length overflow")]
    LengthOverflow,

    /// The peer's end-of-stream marker. Not a fault: the session is over
    /// and the connection may be reused.
    #[error("end of stream")]
    EndOfStream,

    #[error("concurrent read on the same connection")]
    ConcurrentRead,

    #[error("connection closed")]
    Closed,
}

impl ObfsError {
    /// Whether this is the distinguished end-of-stream signal rather than a
    /// fault. Applications treat it as ordinary stream closure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ObfsError::EndOfStream)
    }
}

/// Handshake progress of a framed connection.
///
/// The passthrough case is not a variant here: a connection that never
/// presented the disguise handshake is a [`PlainStream`], so a framer can
/// never be in an ambiguous "neither role nor framing" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Acceptor waiting to consume an HTTP-request-shaped header
    AwaitingRequestHeader,
    /// Dialer waiting to consume an HTTP-response-shaped header
    AwaitingResponseHeader,
    /// Handshake done; all I/O is chunk framed
    Framing,
}

/// Object-safe contract shared by every wrapper in the chain.
///
/// Methods take `&self` so that a close may run concurrently with an
/// in-flight read; share a stream between tasks with [`std::sync::Arc`].
#[async_trait]
pub trait TunnelStream: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ObfsError>;
    async fn write(&self, buf: &[u8]) -> Result<usize, ObfsError>;
    async fn close(&self) -> Result<(), ObfsError>;
}

/// An inbound connection after protocol sniffing
pub enum AcceptedStream {
    /// The peer spoke the disguise handshake; traffic is chunk framed
    Obfuscated(ObfsStream),
    /// Anything else; bytes pass through unframed
    Plain(PlainStream),
}

impl AcceptedStream {
    pub fn is_obfuscated(&self) -> bool {
        matches!(self, AcceptedStream::Obfuscated(_))
    }
}

#[async_trait]
impl TunnelStream for AcceptedStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ObfsError> {
        match self {
            AcceptedStream::Obfuscated(s) => s.read(buf).await,
            AcceptedStream::Plain(s) => s.read(buf).await,
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, ObfsError> {
        match self {
            AcceptedStream::Obfuscated(s) => s.write(buf).await,
            AcceptedStream::Plain(s) => s.write(buf).await,
        }
    }

    async fn close(&self) -> Result<(), ObfsError> {
        match self {
            AcceptedStream::Obfuscated(s) => s.close().await,
            AcceptedStream::Plain(s) => s.close().await,
        }
    }
}

/// Dial an obfuscated connection to `target`.
///
/// A pooled connection is reused when one is available without blocking;
/// otherwise a fresh TCP connection is opened. Either way the framer is
/// armed with a disguise request for one of the configured hosts and
/// expects the disguise response ahead of the first read.
pub async fn dial_obfs(target: &str, config: &Config) -> Result<ObfsStream, crate::Error> {
    let header = http::build_request(config.pick_obfs_host());
    let stream = match config.pool.as_ref().and_then(|p| p.try_get()) {
        Some(stream) => {
            debug!("reusing pooled connection for {target}");
            stream
        }
        None => {
            let conn = TcpStream::connect(target).await?;
            debug!("dialed new connection to {target}");
            ObfsStream::new(RemainStream::new(Box::new(conn)), config.pool.clone())
        }
    };
    stream.expect_response(&header).await?;
    Ok(stream)
}

/// Dial and wrap in the write coalescer, the full outbound chain.
pub async fn dial(target: &str, config: &Config) -> Result<DelayStream<ObfsStream>, crate::Error> {
    Ok(DelayStream::new(dial_obfs(target, config).await?))
}

/// Classify and wrap an inbound connection.
///
/// The first segment is sniffed: if it starts with the disguise method
/// token the connection is framed (accept role, response header queued,
/// listener pool attached), otherwise it passes through unframed with the
/// sniffed bytes as look-ahead.
pub async fn accept_obfs(
    conn: BoxedRaw,
    pool: Option<ConnPool>,
) -> Result<AcceptedStream, ObfsError> {
    let mut stream = RemainStream::new(conn);
    let mut buf = vec![0u8; BUFFER_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(ObfsError::ShortRead);
    }
    stream.set_lookahead(&buf[..n]);

    if n < REQUEST_METHOD.len() || &buf[..REQUEST_METHOD.len()] != REQUEST_METHOD.as_bytes() {
        debug!("accepted plain connection ({n} byte first segment)");
        return Ok(AcceptedStream::Plain(PlainStream::new(stream)));
    }

    stream.queue_write(&http::build_response());
    debug!("accepted obfuscated connection");
    Ok(AcceptedStream::Obfuscated(ObfsStream::accepting(stream, pool)))
}

pub(crate) fn pick_host_index(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}
