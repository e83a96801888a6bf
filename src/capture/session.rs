//! What both backends have in common: lifecycle, controls and delivery

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capture::dispatch::{CaptureStats, FrameHandler};
use crate::capture::frame::NegotiatedFormat;
use crate::error::Result;
use crate::CaptureConfig;

/// Capture session lifecycle.
///
/// Moves strictly forward, except `Streaming -> Configured` on stop and any
/// state to `Closed` on close or fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    Configured,
    Streaming,
}

/// Which camera stack a session talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Synchronous dequeue/requeue against a `/dev/videoN` node.
    #[default]
    V4l2,
    /// Asynchronous request/completion through libcamera.
    Libcamera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureMode {
    Auto,
    Manual,
    ShutterPriority,
    AperturePriority,
}

/// Named device controls a session forwards to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    FrameRate(u32),
    ExposureMode(ExposureMode),
    /// Microseconds.
    ExposureTime(u32),
}

impl Control {
    pub fn name(&self) -> &'static str {
        match self {
            Control::FrameRate(_) => "frame-rate",
            Control::ExposureMode(_) => "exposure-mode",
            Control::ExposureTime(_) => "exposure-time",
        }
    }
}

/// One capture session, whichever backend drives it.
///
/// `dispatch` is how a caller moves frames: the V4L2 backend grabs one frame
/// and hands it to the handler, the libcamera backend delivers whatever
/// completions arrived. Either way the handler runs on the calling thread.
pub trait CaptureSession: Send {
    fn state(&self) -> SessionState;

    /// Format the device settled on; `None` until configured.
    fn format(&self) -> Option<NegotiatedFormat>;

    fn start_streaming(&mut self, frame_rate_hint: u32) -> Result<()>;

    fn stop_streaming(&mut self) -> Result<()>;

    fn close(&mut self);

    fn set_control(&mut self, control: Control) -> Result<()>;

    fn on_frame(&mut self, handler: FrameHandler);

    /// Deliver ready frames to the handler; returns how many were delivered.
    fn dispatch(&mut self) -> Result<usize>;

    /// Shared delivery counters; cheap to clone onto a statistics thread.
    fn stats(&self) -> Arc<CaptureStats>;

    fn set_frame_rate_hint(&mut self, fps: u32) -> Result<()> {
        self.set_control(Control::FrameRate(fps))
    }

    fn set_exposure_mode(&mut self, mode: ExposureMode) -> Result<()> {
        self.set_control(Control::ExposureMode(mode))
    }

    fn set_exposure_time(&mut self, micros: u32) -> Result<()> {
        self.set_control(Control::ExposureTime(micros))
    }
}

/// Open a configured session on the backend `config` selects.
pub fn open_session(config: &CaptureConfig) -> Result<Box<dyn CaptureSession>> {
    match config.backend {
        Backend::V4l2 => Ok(Box::new(crate::capture::V4l2Capture::open(config)?)),
        #[cfg(feature = "libcamera")]
        Backend::Libcamera => Ok(Box::new(crate::capture::LibcameraCapture::open(config)?)),
        #[cfg(not(feature = "libcamera"))]
        Backend::Libcamera => Err(crate::error::CaptureError::Manager(
            "built without libcamera support".into(),
        )),
    }
}
