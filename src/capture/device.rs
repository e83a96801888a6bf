//! Raw V4L2 device access
//!
//! [`CaptureDevice`] is the seam between the capture loop and the kernel: one
//! method per ioctl the loop needs, no policy. Retries, ownership tracking and
//! teardown all live above it in [`V4l2Capture`](crate::capture::V4l2Capture).

use std::fs::File;
use std::io;
use std::mem;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::raw::c_void;
use std::path::Path;
use std::ptr::NonNull;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::control::{Control, Value};
use v4l::memory::Memory;
use v4l::parameters::Capabilities as ParamFlags;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::capture::dispatch::Dequeued;
use crate::capture::pool::SlotInfo;
use crate::capture::retry::Readiness;
use crate::error::{CaptureError, Result};

pub use v4l::v4l_sys::{V4L2_CID_EXPOSURE_ABSOLUTE, V4L2_CID_EXPOSURE_AUTO};

/// Buffer and stream ioctls. `v4l` only drives these through its own stream
/// types, which own the buffers; the pool needs them one at a time.
///
/// # Safety
///
/// `arg` must be the argument type the kernel expects for `request`.
unsafe fn buffer_ioctl<T>(fd: RawFd, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    v4l2::ioctl(fd, request, arg as *mut T as *mut c_void)
}

/// Format as reported back by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
    /// Bytes a full frame needs; zero when the driver does not say.
    pub size_image: u32,
}

/// Kernel interface of a synchronous capture device.
///
/// Every call is a single attempt. A busy device answers with
/// [`io::ErrorKind::WouldBlock`]; callers decide whether to retry.
pub trait CaptureDevice {
    /// Human-readable name (card name or path).
    fn name(&self) -> &str;

    fn set_format(&mut self, width: u32, height: u32, fourcc: [u8; 4]) -> io::Result<DeviceFormat>;

    /// Ask for `fps` frames per second. `Unsupported` if the driver has no
    /// frame interval control.
    fn set_frame_rate(&mut self, fps: u32) -> io::Result<()>;

    /// Reserve `count` mmap buffers; zero frees them.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn query_buffer(&mut self, index: u32) -> io::Result<SlotInfo>;

    fn map_buffer(&mut self, length: usize, offset: u32) -> io::Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `base`/`length` must describe a live mapping returned by
    /// [`map_buffer`](CaptureDevice::map_buffer) that nobody reads afterwards.
    unsafe fn unmap_buffer(&mut self, base: NonNull<u8>, length: usize) -> io::Result<()>;

    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()>;

    /// Wait up to `timeout` for the device to have a filled buffer.
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness>;
}

/// A V4L2 node opened non-blocking and held under an exclusive `flock`.
pub struct V4l2Device {
    device: Device,
    /// Duplicate of the device fd carrying the lock; the lock belongs to the
    /// shared open file description.
    lock: Flock<File>,
    name: String,
}

impl V4l2Device {
    /// Open and exclusively acquire the capture node at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let device = Device::with_path(path).map_err(|e| match e.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
                CaptureError::DeviceNotFound(display.clone())
            }
            Some(libc::EBUSY) => CaptureError::Acquire {
                device: display.clone(),
                source: Some(e),
            },
            _ => CaptureError::Configure(format!("opening {}: {}", display, e)),
        })?;

        // SAFETY: the handle keeps the fd open for the duration of the borrow.
        let dup = unsafe { BorrowedFd::borrow_raw(device.handle().fd()) }
            .try_clone_to_owned()
            .map_err(|e| CaptureError::Configure(format!("duplicating {}: {}", display, e)))?;
        let lock = Flock::lock(File::from(dup), FlockArg::LockExclusiveNonblock).map_err(
            |(_, errno)| CaptureError::Acquire {
                device: display.clone(),
                source: Some(io::Error::from(errno)),
            },
        )?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::Configure(format!("{} is not a V4L2 device: {}", display, e)))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(Flags::STREAMING)
        {
            return Err(CaptureError::Configure(format!(
                "{} does not support streaming capture",
                display
            )));
        }
        info!("Opened {} ({}, driver {})", display, caps.card, caps.driver);

        Ok(Self {
            device,
            lock,
            name: if caps.card.is_empty() { display } else { caps.card },
        })
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }
}

fn mmap_buffer_query(index: u32) -> v4l2_buffer {
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = Memory::Mmap as u32;
    buf
}

impl CaptureDevice for V4l2Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_format(&mut self, width: u32, height: u32, fourcc: [u8; 4]) -> io::Result<DeviceFormat> {
        let wanted = Format::new(width, height, FourCC::new(&fourcc));
        let got = Capture::set_format(&self.device, &wanted)?;
        Ok(DeviceFormat {
            width: got.width,
            height: got.height,
            fourcc: got.fourcc.repr,
            size_image: got.size,
        })
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<()> {
        if fps == 0 {
            return Ok(());
        }

        let applied = Capture::set_params(&self.device, &Parameters::with_fps(fps))?;
        if !applied.capabilities.contains(ParamFlags::TIME_PER_FRAME) {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;

        // SAFETY: `req` is a valid v4l2_requestbuffers for REQBUFS.
        unsafe { buffer_ioctl(self.fd(), vidioc::VIDIOC_REQBUFS, &mut req) }?;
        debug!(requested = count, granted = req.count, "REQBUFS");
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<SlotInfo> {
        let mut buf = mmap_buffer_query(index);
        // SAFETY: `buf` is a valid v4l2_buffer for QUERYBUF.
        unsafe { buffer_ioctl(self.fd(), vidioc::VIDIOC_QUERYBUF, &mut buf) }?;
        Ok(SlotInfo {
            length: buf.length as usize,
            // SAFETY: MMAP buffers report their offset in `m.offset`.
            offset: unsafe { buf.m.offset },
        })
    }

    fn map_buffer(&mut self, length: usize, offset: u32) -> io::Result<NonNull<u8>> {
        let length = NonZeroUsize::new(length)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length buffer"))?;

        // SAFETY: a fresh shared mapping of device memory; nothing else in the
        // process aliases it.
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.lock.as_fd(),
                offset as libc::off_t,
            )
        }?;
        Ok(base.cast())
    }

    unsafe fn unmap_buffer(&mut self, base: NonNull<u8>, length: usize) -> io::Result<()> {
        munmap(base.cast(), length).map_err(io::Error::from)
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = mmap_buffer_query(index);
        // SAFETY: `buf` is a valid v4l2_buffer for QBUF.
        unsafe { buffer_ioctl(self.fd(), vidioc::VIDIOC_QBUF, &mut buf) }?;
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        let mut buf = mmap_buffer_query(0);
        // SAFETY: `buf` is a valid v4l2_buffer for DQBUF.
        unsafe { buffer_ioctl(self.fd(), vidioc::VIDIOC_DQBUF, &mut buf) }?;

        let ts = buf.timestamp;
        let timestamp = (ts.tv_sec > 0 || ts.tv_usec > 0).then(|| {
            Duration::from_secs(ts.tv_sec.max(0) as u64)
                + Duration::from_micros(ts.tv_usec.max(0) as u64)
        });

        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence as u64,
            timestamp,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut kind = Type::VideoCapture as u32;
        // SAFETY: STREAMON reads the buffer type.
        unsafe { buffer_ioctl(self.fd(), vidioc::VIDIOC_STREAMON, &mut kind) }?;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut kind = Type::VideoCapture as u32;
        // SAFETY: STREAMOFF reads the buffer type.
        unsafe { buffer_ioctl(self.fd(), vidioc::VIDIOC_STREAMOFF, &mut kind) }?;
        Ok(())
    }

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()> {
        self.device.set_control(Control {
            id,
            value: Value::Integer(value as i64),
        })
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.lock.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Ok(Readiness::TimedOut),
            Ok(_) => Ok(Readiness::Ready),
            Err(Errno::EINTR) => Err(io::Error::from(io::ErrorKind::Interrupted)),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

/// Whether a failed control call means "the driver has no such control".
pub fn is_unsupported(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Unsupported
        || matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOTTY))
}

impl std::fmt::Debug for V4l2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Device")
            .field("fd", &self.fd())
            .field("name", &self.name)
            .finish()
    }
}
