//! Bounded retry around device control calls
//!
//! V4L2 nodes are opened non-blocking, so any ioctl may answer `EAGAIN` while
//! the driver is busy. The guard is the only place such conditions are
//! absorbed: it waits on device readiness for a bounded time and tries again,
//! up to a fixed number of attempts. Everything else in the crate treats a
//! failed device call as final.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::RetryConfig;

/// Attempts per call, matching what V4L2 drivers need to settle after
/// `STREAMON`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Readiness wait between attempts.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Why the guard gave up on a call.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The call (or the readiness wait) failed with a non-transient error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The device did not become ready within the bounded wait.
    #[error("device not ready within {0:?}")]
    Timeout(Duration),

    /// Every attempt reported a transient condition.
    #[error("still busy after {0} attempts")]
    RetriesExhausted(u32),
}

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// "Try again" conditions: `EAGAIN`/`EWOULDBLOCK` and `EINTR`.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryGuard {
    max_attempts: u32,
    wait: Duration,
}

impl Default for RetryGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WAIT)
    }
}

impl From<&RetryConfig> for RetryGuard {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.wait_ms))
    }
}

impl RetryGuard {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Run `op` under the retry policy.
    ///
    /// `wait_ready` is called with the bounded wait duration after every
    /// transient failure except the last one. `op` runs at most
    /// `max_attempts` times.
    pub fn run<T, W, F>(&self, mut wait_ready: W, mut op: F) -> Result<T, RetryError>
    where
        W: FnMut(Duration) -> io::Result<Readiness>,
        F: FnMut() -> io::Result<T>,
    {
        self.run_with(&mut (), |_, wait| wait_ready(wait), |_| op())
    }

    /// Like [`run`](Self::run), for an operation and a readiness wait that
    /// both need the same `&mut` target (usually the device).
    pub fn run_with<C, T, W, F>(
        &self,
        target: &mut C,
        mut wait_ready: W,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        C: ?Sized,
        W: FnMut(&mut C, Duration) -> io::Result<Readiness>,
        F: FnMut(&mut C) -> io::Result<T>,
    {
        for attempt in 1..=self.max_attempts {
            match op(target) {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => {
                    debug!(attempt, "device busy: {}", err);
                    metrics::counter!("camloop_transient_retries").increment(1);
                }
                Err(err) => return Err(RetryError::Io(err)),
            }

            if attempt == self.max_attempts {
                break;
            }

            match wait_ready(target, self.wait) {
                Ok(Readiness::Ready) => {}
                Ok(Readiness::TimedOut) => {
                    warn!("device readiness wait timed out after {:?}", self.wait);
                    return Err(RetryError::Timeout(self.wait));
                }
                Err(err) if is_transient(&err) => {}
                Err(err) => {
                    warn!("device readiness wait failed: {}", err);
                    return Err(RetryError::Io(err));
                }
            }
        }

        Err(RetryError::RetriesExhausted(self.max_attempts))
    }
}
