//! Idle-connection pool
//!
//! Gracefully closed framed connections park here instead of being torn
//! down, and the dialer picks them up again ahead of opening new TCP
//! connections. Both operations are non-blocking and both may come up
//! empty-handed; callers fall back to dialing fresh or closing outright.

use crate::obfs::ObfsStream;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Default number of idle connections kept per pool
pub const DEFAULT_CAPACITY: usize = 32;

/// Bounded FIFO of reusable framed connections. Cheap to clone; clones
/// share the same pool.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    conns: Mutex<VecDeque<ObfsStream>>,
    capacity: usize,
}

impl ConnPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                conns: Mutex::new(VecDeque::new()),
                capacity,
            }),
        }
    }

    /// Take an idle connection without blocking; `None` when the pool is
    /// empty.
    pub fn try_get(&self) -> Option<ObfsStream> {
        let mut conns = self.inner.conns.lock().ok()?;
        let stream = conns.pop_front();
        if stream.is_some() {
            debug!("pool: reusing idle connection ({} left)", conns.len());
        }
        stream
    }

    /// Park a connection for reuse. A full pool hands the connection back
    /// in `Err`; the caller tears it down.
    pub fn put(&self, stream: ObfsStream) -> Result<(), ObfsStream> {
        let Ok(mut conns) = self.inner.conns.lock() else {
            return Err(stream);
        };
        if conns.len() >= self.inner.capacity {
            return Err(stream);
        }
        conns.push_back(stream);
        debug!("pool: parked idle connection ({} total)", conns.len());
        Ok(())
    }

    /// Number of idle connections currently parked
    pub fn len(&self) -> usize {
        self.inner.conns.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.len())
            .finish()
    }
}
