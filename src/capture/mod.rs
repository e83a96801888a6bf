pub mod device;
pub mod dispatch;
pub mod frame;
#[cfg(feature = "libcamera")]
pub mod libcamera;
pub mod manager;
pub mod pool;
pub mod retry;
pub mod session;
pub mod v4l2;

pub use device::{CaptureDevice, DeviceFormat, V4l2Device};
pub use dispatch::{
    CaptureStats, FrameHandler, PullDispatcher, PushDispatcher, StatsSnapshot, WorkPool,
};
pub use frame::{Frame, FrameDescriptor, NegotiatedFormat, PixelFormat};
#[cfg(feature = "libcamera")]
pub use libcamera::{LibcameraCapture, LibcameraDevices};
pub use manager::DeviceManager;
pub use pool::{BufferPool, Owner};
pub use retry::{RetryError, RetryGuard};
pub use session::{open_session, Backend, CaptureSession, Control, ExposureMode, SessionState};
pub use v4l2::V4l2Capture;
