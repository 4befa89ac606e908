//! Disguise header construction and parsing
//!
//! The obfuscation handshake exchanges one HTTP-shaped header block in each
//! direction: the dialer sends a request referencing a configurable disguise
//! host, the acceptor answers with a response. Both sides advertise
//! `Transfer-Encoding: chunked` so that the chunk framing applied to the
//! rest of the stream is plausible to a protocol-aware observer.
//!
//! Incoming headers are consumed one byte at a time by [`HeaderAcceptor`] so
//! that the framer can hand any bytes past the header boundary back to its
//! look-ahead buffer.

use thiserror::Error;

/// Method token the acceptor sniffs for to recognize the disguise handshake
pub const REQUEST_METHOD: &str = "POST";

/// Disguise host used when the configuration supplies none
pub const DEFAULT_OBFS_HOST: &str = "www.bing.com";

/// Upper bound on an accepted header block, matching the sniff buffer
const MAX_HEADER_SIZE: usize = crate::BUFFER_SIZE;

/// HTTP header errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed start line: {0:?}")]
    BadStartLine(String),

    #[error("header block exceeds {MAX_HEADER_SIZE} bytes")]
    TooLarge,
}

/// Build the disguise request sent ahead of the first dial-side write.
///
/// `X-Online-Host` mirrors `Host` for middleboxes that route on it.
pub fn build_request(host: &str) -> Vec<u8> {
    format!(
        "{REQUEST_METHOD} / HTTP/1.1\r\n\
         Host: {host}\r\n\
         X-Online-Host: {host}\r\n\
         User-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36\r\n\
         Accept: */*\r\n\
         Content-Type: application/octet-stream\r\n\
         Transfer-Encoding: chunked\r\n\
         Connection: keep-alive\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Build the disguise response queued ahead of the first accept-side write.
pub fn build_response() -> Vec<u8> {
    b"HTTP/1.1 200 OK\r\n\
      Server: nginx/1.18.0\r\n\
      Content-Type: application/octet-stream\r\n\
      Transfer-Encoding: chunked\r\n\
      Connection: keep-alive\r\n\
      \r\n"
        .to_vec()
}

/// Which header shape an acceptor expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderKind {
    Request,
    Response,
}

/// Byte-at-a-time acceptor for one HTTP header block.
///
/// Feed bytes until [`feed`](HeaderAcceptor::feed) returns `Ok(true)` (the
/// terminating empty line was seen) or an error. The acceptor validates only
/// the start line shape; header fields are opaque to this layer.
pub struct HeaderAcceptor {
    kind: HeaderKind,
    line: Vec<u8>,
    start_line_done: bool,
    total: usize,
}

impl HeaderAcceptor {
    /// Acceptor for an HTTP-request-shaped header (server side)
    pub fn request() -> Self {
        Self::new(HeaderKind::Request)
    }

    /// Acceptor for an HTTP-response-shaped header (client side)
    pub fn response() -> Self {
        Self::new(HeaderKind::Response)
    }

    fn new(kind: HeaderKind) -> Self {
        Self {
            kind,
            line: Vec::new(),
            start_line_done: false,
            total: 0,
        }
    }

    /// Consume one byte; returns `Ok(true)` once the header block is complete.
    pub fn feed(&mut self, byte: u8) -> Result<bool, HttpError> {
        self.total += 1;
        if self.total > MAX_HEADER_SIZE {
            return Err(HttpError::TooLarge);
        }
        if byte != b'\n' {
            self.line.push(byte);
            return Ok(false);
        }
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        if !self.start_line_done {
            self.check_start_line()?;
            self.start_line_done = true;
        } else if self.line.is_empty() {
            return Ok(true);
        }
        self.line.clear();
        Ok(false)
    }

    fn check_start_line(&self) -> Result<(), HttpError> {
        let line = &self.line[..];
        let ok = match self.kind {
            HeaderKind::Request => {
                line.starts_with(REQUEST_METHOD.as_bytes())
                    && line.get(REQUEST_METHOD.len()) == Some(&b' ')
                    && ends_with_http_version(line)
            }
            HeaderKind::Response => {
                line.starts_with(b"HTTP/1.") && has_status_code(line)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(HttpError::BadStartLine(
                String::from_utf8_lossy(line).into_owned(),
            ))
        }
    }
}

fn ends_with_http_version(line: &[u8]) -> bool {
    line.windows(8).any(|w| w == b" HTTP/1.")
}

fn has_status_code(line: &[u8]) -> bool {
    // "HTTP/1.x NNN ..." - three ASCII digits after the first space
    let mut parts = line.splitn(3, |&b| b == b' ');
    let _version = parts.next();
    match parts.next() {
        Some(code) => code.len() == 3 && code.iter().all(|b| b.is_ascii_digit()),
        None => false,
    }
}
