//! Typed failures surfaced by the capture core

use std::io;

use thiserror::Error;

use crate::capture::retry::RetryError;

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

/// Every failure a capture session can report to its caller.
///
/// Transient driver conditions never show up here: they are absorbed by the
/// retry guard and only surface as [`CaptureError::FatalIo`] once the guard
/// gives up.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture device matches `{0}`")]
    DeviceNotFound(String),

    #[error("device `{device}` is held by another session")]
    Acquire {
        device: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("format negotiation failed: {0}")]
    Configure(String),

    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("mapping buffer slot {index} ({length} bytes) failed")]
    Map {
        index: u32,
        length: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to start streaming: {0}")]
    StreamStart(String),

    #[error("fatal device I/O during {op}")]
    FatalIo {
        op: &'static str,
        #[source]
        source: RetryError,
    },

    #[error("control `{0}` is not supported by the device")]
    ControlUnsupported(&'static str),

    #[error("operation `{op}` is not valid while {state:?}")]
    InvalidState {
        op: &'static str,
        state: crate::capture::SessionState,
    },

    #[error("camera manager unavailable: {0}")]
    Manager(String),
}

impl CaptureError {
    /// Whether the session was torn down as a consequence of this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::FatalIo { .. })
    }

    pub(crate) fn fatal(op: &'static str, source: impl Into<RetryError>) -> Self {
        CaptureError::FatalIo {
            op,
            source: source.into(),
        }
    }
}
