//! # httpveil
//!
//! A traffic-obfuscating transport layer for proxy tunnels. It disguises an
//! encrypted proxy session as ordinary HTTP traffic so that it survives
//! protocol-aware middleboxes, and it amortizes connection setup cost by
//! returning gracefully closed connections to a reuse pool.
//!
//! ## Features
//!
//! - **HTTP masquerading**: a one-time HTTP request/response handshake
//!   followed by chunked-transfer-style framing of the raw byte stream
//! - **Graceful close**: both sides drain to an end-of-stream marker and the
//!   underlying connection rejoins a pool instead of being torn down
//! - **Write coalescing**: small writes are batched on a short timer to
//!   defeat packet-size and timing fingerprinting
//! - **Plain passthrough**: accepted connections that do not speak the
//!   disguise protocol are forwarded unframed
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Application Layer                    │
//! │        (encryption, SOCKS5/HTTP proxying)            │
//! ├─────────────────────────────────────────────────────┤
//! │              Write-coalescing wrapper                │
//! │          (DelayStream, dial side only)               │
//! ├─────────────────────────────────────────────────────┤
//! │                Obfuscation framer                    │
//! │   (ObfsStream: handshake, chunk framing, pooling)    │
//! ├─────────────────────────────────────────────────────┤
//! │                RemainBuffer wrapper                  │
//! │    (RemainStream: look-ahead and pending bytes)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Raw connection                      │
//! │                  (TCP, TLS, ...)                     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod http;
pub mod obfs;
pub mod pool;

pub use config::Config;
pub use obfs::{
    accept_obfs, dial, dial_obfs, AcceptedStream, DelayStream, ObfsError, ObfsStream,
    PlainStream, RemainStream, TunnelStream,
};
pub use pool::ConnPool;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of the per-connection scratch and coalescing buffers (8 KB)
pub const BUFFER_SIZE: usize = 8192;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Obfuscation error: {0}")]
    Obfs(#[from] obfs::ObfsError),

    #[error("HTTP header error: {0}")]
    Http(#[from] http::HttpError),

    #[error("Configuration error: {0}")]
    Config(String),
}
