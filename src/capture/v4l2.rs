//! Synchronous V4L2 capture with zero-copy mmap slots

use std::io;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::{
    is_unsupported, CaptureDevice, V4l2Device, V4L2_CID_EXPOSURE_ABSOLUTE, V4L2_CID_EXPOSURE_AUTO,
};
use crate::capture::dispatch::{
    CaptureStats, Dequeued, FrameHandler, PullDispatcher, SlotQueue,
};
use crate::capture::frame::{FrameDescriptor, NegotiatedFormat};
use crate::capture::pool::{BufferPool, BufferSource, Owner, SlotInfo};
use crate::capture::retry::{RetryError, RetryGuard};
use crate::capture::session::{CaptureSession, Control, ExposureMode, SessionState};
use crate::error::{CaptureError, Result};
use crate::CaptureConfig;

/// Device plus the retry policy every call on it goes through.
struct DeviceLink<D> {
    device: D,
    guard: RetryGuard,
}

impl<D: CaptureDevice> DeviceLink<D> {
    fn call<T>(&mut self, op: impl FnMut(&mut D) -> io::Result<T>) -> Result<T, RetryError> {
        self.guard
            .run_with(&mut self.device, |d: &mut D, wait| d.wait_ready(wait), op)
    }
}

impl<D: CaptureDevice> BufferSource for DeviceLink<D> {
    fn request_buffers(&mut self, count: u32) -> Result<u32, RetryError> {
        self.call(|d| d.request_buffers(count))
    }

    fn query_buffer(&mut self, index: u32) -> Result<SlotInfo, RetryError> {
        self.call(|d| d.query_buffer(index))
    }

    fn map(&mut self, length: usize, offset: u32) -> io::Result<std::ptr::NonNull<u8>> {
        self.device.map_buffer(length, offset)
    }

    unsafe fn unmap(&mut self, base: std::ptr::NonNull<u8>, length: usize) -> io::Result<()> {
        self.device.unmap_buffer(base, length)
    }
}

/// Device queue with the pool's ownership bookkeeping attached.
struct SlotRing<'a, D> {
    link: &'a mut DeviceLink<D>,
    pool: &'a mut BufferPool,
}

impl<D: CaptureDevice> SlotQueue for SlotRing<'_, D> {
    fn submit(&mut self, index: u32) -> Result<()> {
        self.pool.hand_to_driver(index)?;
        self.link
            .call(|d| d.queue_buffer(index))
            .map_err(|e| CaptureError::fatal("queue buffer", e))
    }

    fn reap(&mut self) -> Result<Dequeued> {
        let filled = self
            .link
            .call(|d| d.dequeue_buffer())
            .map_err(|e| CaptureError::fatal("dequeue buffer", e))?;
        self.pool.hand_to_application(filled.index)?;
        Ok(filled)
    }
}

/// Pull-model capture session on a V4L2 node
pub struct V4l2Capture<D: CaptureDevice = V4l2Device> {
    link: Option<DeviceLink<D>>,
    pool: BufferPool,
    name: String,
    state: SessionState,
    format: Option<NegotiatedFormat>,
    pull: PullDispatcher,
    handler: Option<FrameHandler>,
    stats: Arc<CaptureStats>,
}

impl V4l2Capture<V4l2Device> {
    /// Open, acquire and configure the node named by `config.device`.
    ///
    /// Device calls are retried according to the process-wide
    /// [`RetryConfig`](crate::RetryConfig).
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {}", config.device);
        let device = V4l2Device::open(&config.device)?;
        let guard = RetryGuard::from(&crate::CONFIG.load().retry);
        Self::with_device(device, config, guard)
    }
}

impl<D: CaptureDevice> V4l2Capture<D> {
    /// Build a session around an already opened device.
    ///
    /// Negotiates the format and maps the buffer pool; the session comes back
    /// `Configured`. On failure the device is released before returning.
    #[instrument(skip(device, guard))]
    pub fn with_device(device: D, config: &CaptureConfig, guard: RetryGuard) -> Result<Self> {
        let mut session = Self {
            name: device.name().to_string(),
            link: Some(DeviceLink { device, guard }),
            pool: BufferPool::default(),
            state: SessionState::Opened,
            format: None,
            pull: PullDispatcher::new(),
            handler: None,
            stats: Arc::new(CaptureStats::default()),
        };

        if let Err(err) = session.configure(config) {
            error!("Configuring {} failed: {}", session.name, err);
            session.close();
            return Err(err);
        }
        Ok(session)
    }

    fn configure(&mut self, config: &CaptureConfig) -> Result<()> {
        let state = self.state;
        let link = self.link.as_mut().ok_or(CaptureError::InvalidState {
            op: "configure",
            state,
        })?;
        let requested = config.format.fourcc();

        let got = link
            .call(|d| d.set_format(config.width, config.height, requested))
            .map_err(|e| CaptureError::Configure(format!("S_FMT: {}", e)))?;

        if got.fourcc != requested || got.width != config.width || got.height != config.height {
            warn!(
                "Device adjusted format: asked {}x{} {}, got {}x{} {}",
                config.width,
                config.height,
                String::from_utf8_lossy(&requested),
                got.width,
                got.height,
                String::from_utf8_lossy(&got.fourcc)
            );
        }

        self.pool = BufferPool::allocate(link, config.buffer_count)?;
        let format = NegotiatedFormat {
            width: got.width,
            height: got.height,
            fourcc: got.fourcc,
            buffer_count: self.pool.len() as u32,
        };
        info!(
            "Negotiated {}x{} {} with {} buffers",
            format.width,
            format.height,
            String::from_utf8_lossy(&format.fourcc),
            format.buffer_count
        );

        self.format = Some(format);
        self.state = SessionState::Configured;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn format(&self) -> Option<NegotiatedFormat> {
        self.format
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    pub fn on_frame(&mut self, handler: FrameHandler) {
        self.handler = Some(handler);
    }

    /// Enable the stream. Slots are queued lazily by the first grab.
    ///
    /// `frame_rate_hint` of zero leaves the device's rate alone; a driver
    /// without frame interval support is logged and ignored.
    #[instrument(skip(self))]
    pub fn start_streaming(&mut self, frame_rate_hint: u32) -> Result<()> {
        self.expect_state("start_streaming", SessionState::Configured)?;
        let link = self.link_mut("start_streaming")?;

        if frame_rate_hint > 0 {
            if let Err(e) = link.call(|d| d.set_frame_rate(frame_rate_hint)) {
                warn!("Frame rate hint of {} fps not applied: {}", frame_rate_hint, e);
            }
        }

        link.call(|d| d.stream_on())
            .map_err(|e| CaptureError::StreamStart(e.to_string()))?;

        self.pull.reset();
        self.state = SessionState::Streaming;
        info!("Capture stream started with {} buffers", self.pool.len());
        Ok(())
    }

    /// Disable the stream; driver-owned slots come back without being
    /// delivered. Does nothing unless streaming.
    #[instrument(skip(self))]
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            debug!("stop_streaming while {:?}: nothing to do", self.state);
            return Ok(());
        }

        let stopped = self.link_mut("stop_streaming")?.call(|d| d.stream_off());
        if let Err(e) = stopped {
            error!("STREAMOFF failed on {}: {}", self.name, e);
            self.close();
            return Err(CaptureError::fatal("stream off", e));
        }

        let cancelled = self.pool.owned_by(Owner::Driver);
        for _ in 0..cancelled {
            self.stats.record_cancelled();
        }
        self.pool.reclaim_all();
        self.pull.reset();
        self.state = SessionState::Configured;
        info!("Capture stream stopped ({} queued slots discarded)", cancelled);
        Ok(())
    }

    /// Block until the next frame is filled and borrow it.
    ///
    /// The slot stays with the application until the next call, so the
    /// returned descriptor borrows the session. Any device failure tears the
    /// session down and comes back as [`CaptureError::FatalIo`].
    pub fn grab_frame(&mut self) -> Result<FrameDescriptor<'_>> {
        let filled = self.next_filled()?;
        self.stats.record_delivered();
        self.describe(filled)
    }

    /// Grab one frame and hand it to the registered handler.
    pub fn dispatch(&mut self) -> Result<usize> {
        let filled = self.next_filled()?;
        let mut handler = self.handler.take();

        let delivered = match handler.as_mut() {
            Some(handler) => self.describe(filled).map(|frame| {
                handler(&frame);
                self.stats.record_delivered();
                1
            }),
            None => {
                self.stats.record_dropped();
                Ok(0)
            }
        };

        self.handler = handler;
        delivered
    }

    fn next_filled(&mut self) -> Result<Dequeued> {
        self.expect_state("grab_frame", SessionState::Streaming)?;
        let state = self.state;
        let slot_count = self.pool.len() as u32;

        let result = match self.link.as_mut() {
            Some(link) => {
                let mut ring = SlotRing {
                    link,
                    pool: &mut self.pool,
                };
                self.pull.next(&mut ring, slot_count)
            }
            None => Err(CaptureError::InvalidState {
                op: "grab_frame",
                state,
            }),
        };

        result.map_err(|err| {
            error!("Capture on {} failed, closing session: {}", self.name, err);
            self.close();
            err
        })
    }

    fn describe(&self, filled: Dequeued) -> Result<FrameDescriptor<'_>> {
        let format = self.format.ok_or_else(|| self.invalid("grab_frame"))?;
        let data = self
            .pool
            .frame_bytes(filled.index, filled.bytes_used)
            .ok_or_else(|| self.invalid("grab_frame"))?;

        Ok(FrameDescriptor {
            width: format.width,
            height: format.height,
            data,
            sequence: filled.sequence,
            slot: filled.index,
            device_timestamp: filled.timestamp,
        })
    }

    /// Forward a named control to the driver.
    #[instrument(skip(self))]
    pub fn set_control(&mut self, control: Control) -> Result<()> {
        if !matches!(
            self.state,
            SessionState::Configured | SessionState::Streaming
        ) {
            return Err(self.invalid(control.name()));
        }
        let link = self.link_mut(control.name())?;

        let applied = match control {
            Control::FrameRate(fps) => link.call(|d| d.set_frame_rate(fps)),
            Control::ExposureMode(mode) => {
                let value = match mode {
                    ExposureMode::Auto => 0,
                    ExposureMode::Manual => 1,
                    ExposureMode::ShutterPriority => 2,
                    ExposureMode::AperturePriority => 3,
                };
                link.call(|d| d.set_control(V4L2_CID_EXPOSURE_AUTO, value))
            }
            Control::ExposureTime(micros) => {
                // V4L2 counts exposure in 100 µs steps
                let value = ((micros.saturating_add(50)) / 100).max(1) as i32;
                link.call(|d| d.set_control(V4L2_CID_EXPOSURE_ABSOLUTE, value))
            }
        };

        applied.map_err(|err| match &err {
            RetryError::Io(io) if is_unsupported(io) => CaptureError::ControlUnsupported(control.name()),
            _ => CaptureError::Configure(format!("setting {}: {}", control.name(), err)),
        })
    }

    /// Unmap the pool, free the kernel buffers and drop the device.
    /// Safe to call any number of times.
    pub fn close(&mut self) {
        let Some(mut link) = self.link.take() else {
            self.state = SessionState::Closed;
            return;
        };

        if self.state == SessionState::Streaming {
            if let Err(e) = link.call(|d| d.stream_off()) {
                warn!("STREAMOFF during close failed: {}", e);
            }
            self.pool.reclaim_all();
        }

        if !self.pool.is_empty() {
            self.pool.release(&mut link);
            if let Err(e) = link.request_buffers(0) {
                warn!("Freeing device buffers failed: {}", e);
            }
        }

        self.pull.reset();
        self.format = None;
        self.state = SessionState::Closed;
        info!("Closed {}", self.name);
    }

    fn link_mut(&mut self, op: &'static str) -> Result<&mut DeviceLink<D>> {
        let state = self.state;
        self.link
            .as_mut()
            .ok_or(CaptureError::InvalidState { op, state })
    }

    fn expect_state(&self, op: &'static str, want: SessionState) -> Result<()> {
        if self.state == want {
            Ok(())
        } else {
            Err(self.invalid(op))
        }
    }

    fn invalid(&self, op: &'static str) -> CaptureError {
        CaptureError::InvalidState {
            op,
            state: self.state,
        }
    }
}

impl<D: CaptureDevice> Drop for V4l2Capture<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: CaptureDevice + Send> CaptureSession for V4l2Capture<D> {
    fn state(&self) -> SessionState {
        self.state
    }

    fn format(&self) -> Option<NegotiatedFormat> {
        self.format
    }

    fn start_streaming(&mut self, frame_rate_hint: u32) -> Result<()> {
        V4l2Capture::start_streaming(self, frame_rate_hint)
    }

    fn stop_streaming(&mut self) -> Result<()> {
        V4l2Capture::stop_streaming(self)
    }

    fn close(&mut self) {
        V4l2Capture::close(self)
    }

    fn set_control(&mut self, control: Control) -> Result<()> {
        V4l2Capture::set_control(self, control)
    }

    fn on_frame(&mut self, handler: FrameHandler) {
        V4l2Capture::on_frame(self, handler)
    }

    fn dispatch(&mut self) -> Result<usize> {
        V4l2Capture::dispatch(self)
    }

    fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }
}
