//! Asynchronous capture through libcamera
//!
//! Every buffer slot is bound to one request. Completed requests are handed
//! from libcamera's event thread to the session over a channel; the caller's
//! [`LibcameraCapture::dispatch`] delivers them to the frame handler and
//! queues them again.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use libcamera::camera::{ActiveCamera, CameraConfiguration, CameraConfigurationStatus};
use libcamera::camera_manager::CameraManager;
use libcamera::control::ControlList;
use libcamera::controls::{AeEnable, ControlId, ExposureTime, FrameDurationLimits};
use libcamera::framebuffer::AsFrameBuffer;
use libcamera::framebuffer_allocator::{FrameBuffer, FrameBufferAllocator};
use libcamera::framebuffer_map::MemoryMappedFrameBuffer;
use libcamera::geometry::Size;
use libcamera::pixel_format::PixelFormat as LcPixelFormat;
use libcamera::request::{Request, RequestStatus, ReuseFlag};
use libcamera::stream::{Stream, StreamRole};
use once_cell::sync::Lazy;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::dispatch::{
    CaptureStats, CompletedWork, Disposition, FrameHandler, PushDispatcher, Resubmit, WorkPool,
};
use crate::capture::frame::{FrameDescriptor, NegotiatedFormat};
use crate::capture::manager::DeviceManager;
use crate::capture::pool::MIN_BUFFERS;
use crate::capture::session::{CaptureSession, Control, ExposureMode, SessionState};
use crate::error::{CaptureError, Result};
use crate::CaptureConfig;

type MappedBuffer = MemoryMappedFrameBuffer<FrameBuffer>;

/// libcamera's manager, shared by every session in the process.
pub struct SharedManager(CameraManager);

// SAFETY: libcamera's CameraManager is thread-safe; the wrapper only exposes
// camera enumeration, which it serializes internally.
unsafe impl Send for SharedManager {}
unsafe impl Sync for SharedManager {}

impl SharedManager {
    pub fn manager(&self) -> &CameraManager {
        &self.0
    }
}

/// The process-wide camera manager.
pub static CAMERA_MANAGER: Lazy<DeviceManager<SharedManager>> = Lazy::new(DeviceManager::new);

fn camera_manager() -> Result<Arc<SharedManager>> {
    CAMERA_MANAGER.init(|| {
        CameraManager::new()
            .map(SharedManager)
            .map_err(|e| CaptureError::Manager(e.to_string()))
    })
}

/// Enumerates libcamera camera ids.
pub struct LibcameraDevices;

impl LibcameraDevices {
    /// Snapshot of the cameras libcamera knows right now; call again to
    /// rescan.
    pub fn iter() -> Result<std::vec::IntoIter<String>> {
        let shared = camera_manager()?;
        let cameras = shared.manager().cameras();
        let ids: Vec<String> = (0..cameras.len())
            .filter_map(|i| cameras.get(i).map(|cam| cam.id().to_string()))
            .collect();
        debug!("libcamera reports {} cameras", ids.len());
        Ok(ids.into_iter())
    }
}

/// Per-request controls, applied every time a request is queued.
#[derive(Debug, Default, Clone, Copy)]
struct RequestControls {
    frame_duration_us: Option<i64>,
    ae_enable: Option<bool>,
    exposure_time_us: Option<i32>,
}

impl RequestControls {
    fn apply(&self, list: &mut ControlList) {
        if let Some(us) = self.frame_duration_us {
            if let Err(e) = list.set(FrameDurationLimits([us, us])) {
                warn!("FrameDurationLimits rejected: {:?}", e);
            }
        }
        if let Some(enable) = self.ae_enable {
            if let Err(e) = list.set(AeEnable(enable)) {
                warn!("AeEnable rejected: {:?}", e);
            }
        }
        if let Some(us) = self.exposure_time_us {
            if let Err(e) = list.set(ExposureTime(us)) {
                warn!("ExposureTime rejected: {:?}", e);
            }
        }
    }
}

/// A request libcamera handed back.
struct CompletedRequest<'s> {
    request: Request,
    stream: &'s Stream,
    format: NegotiatedFormat,
}

impl CompletedWork for CompletedRequest<'_> {
    fn is_cancelled(&self) -> bool {
        self.request.status() == RequestStatus::Cancelled
    }

    fn for_each_frame(&self, visit: &mut dyn FnMut(&FrameDescriptor<'_>)) {
        let Some(buffer) = self.request.buffer::<MappedBuffer>(self.stream) else {
            warn!("completed request {} carries no buffer", self.request.cookie());
            return;
        };
        let planes = buffer.data();
        let Some(plane) = planes.first() else {
            return;
        };

        let (used, sequence, timestamp) = match buffer.metadata() {
            Some(meta) => (
                meta.planes()
                    .get(0)
                    .map(|p| p.bytes_used as usize)
                    .unwrap_or(plane.len()),
                meta.sequence() as u64,
                Some(Duration::from_nanos(meta.timestamp())),
            ),
            None => (plane.len(), self.request.sequence() as u64, None),
        };

        visit(&FrameDescriptor {
            width: self.format.width,
            height: self.format.height,
            data: &plane[..used.min(plane.len())],
            sequence,
            slot: self.request.cookie() as u32,
            device_timestamp: timestamp,
        });
    }
}

/// Queues requests on the running camera.
struct Requeue<'c> {
    camera: &'c ActiveCamera<'static>,
    controls: RequestControls,
}

impl Requeue<'_> {
    fn queue(&self, mut request: Request) -> io::Result<()> {
        request.reuse(ReuseFlag::REUSE_BUFFERS);
        self.controls.apply(request.controls_mut());
        self.camera.queue_request(request)
    }
}

// libcamera consumes the request even when queueing fails.
impl Resubmit<Request> for Requeue<'_> {
    fn resubmit(&mut self, work: Request) -> Result<()> {
        self.queue(work)
            .map_err(|e| CaptureError::fatal("queue request", e))
    }
}

impl Resubmit<CompletedRequest<'_>> for Requeue<'_> {
    fn resubmit(&mut self, work: CompletedRequest<'_>) -> Result<()> {
        Resubmit::<Request>::resubmit(self, work.request)
    }
}

/// Everything that only exists while the camera is acquired. Fields drop in
/// order: requests before the camera, the camera before the manager.
struct Acquired {
    idle: WorkPool<Request>,
    completions: flume::Receiver<Request>,
    stream: Stream,
    _allocator: FrameBufferAllocator,
    _config: CameraConfiguration,
    camera: ActiveCamera<'static>,
    _manager: Arc<SharedManager>,
}

/// Push-model capture session on a libcamera camera
pub struct LibcameraCapture {
    acquired: Option<Acquired>,
    name: String,
    state: SessionState,
    format: Option<NegotiatedFormat>,
    controls: RequestControls,
    push: PushDispatcher,
    wait: Duration,
}

// SAFETY: the camera, its requests and buffers are only touched through
// `&mut self`; libcamera's own thread only sees the completion channel.
unsafe impl Send for LibcameraCapture {}

impl LibcameraCapture {
    /// Acquire and configure the camera with id `config.device`; an empty id
    /// picks the first camera.
    #[instrument]
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        info!("Initializing libcamera capture: {:?}", config.device);
        let manager = camera_manager()?;
        let retry = crate::CONFIG.load().retry.clone();

        let mut session = Self {
            acquired: None,
            name: config.device.clone(),
            state: SessionState::Closed,
            format: None,
            controls: RequestControls::default(),
            push: PushDispatcher::new(Arc::new(CaptureStats::default())),
            wait: Duration::from_millis(retry.wait_ms),
        };

        if let Err(err) = session.acquire_and_configure(manager, config) {
            error!("Configuring camera {:?} failed: {}", config.device, err);
            session.close();
            return Err(err);
        }
        Ok(session)
    }

    fn acquire_and_configure(
        &mut self,
        manager: Arc<SharedManager>,
        config: &CaptureConfig,
    ) -> Result<()> {
        let mut camera = {
            let cameras = manager.manager().cameras();
            let camera = (0..cameras.len())
                .filter_map(|i| cameras.get(i))
                .find(|cam| config.device.is_empty() || cam.id() == config.device)
                .ok_or_else(|| CaptureError::DeviceNotFound(config.device.clone()))?;
            self.name = camera.id().to_string();

            let active = camera.acquire().map_err(|e| CaptureError::Acquire {
                device: self.name.clone(),
                source: Some(e),
            })?;
            // SAFETY: the camera borrows the manager, which `Acquired` keeps
            // alive in an `Arc` declared after (so dropped after) the camera.
            unsafe { std::mem::transmute::<ActiveCamera<'_>, ActiveCamera<'static>>(active) }
        };
        self.state = SessionState::Opened;

        let mut cfgs = camera
            .generate_configuration(&[StreamRole::VideoRecording])
            .ok_or_else(|| CaptureError::Configure("no configuration for VideoRecording".into()))?;
        let requested = config.format.fourcc();
        {
            let mut cfg = cfgs
                .get_mut(0)
                .ok_or_else(|| CaptureError::Configure("missing stream configuration".into()))?;
            cfg.set_pixel_format(LcPixelFormat::new(u32::from_le_bytes(requested), 0));
            cfg.set_size(Size {
                width: config.width,
                height: config.height,
            });
            cfg.set_buffer_count(config.buffer_count);
        }

        match cfgs.validate() {
            CameraConfigurationStatus::Valid => {}
            CameraConfigurationStatus::Adjusted => warn!("Camera adjusted the requested configuration"),
            CameraConfigurationStatus::Invalid => {
                return Err(CaptureError::Configure(format!(
                    "{}x{} {} rejected",
                    config.width,
                    config.height,
                    String::from_utf8_lossy(&requested)
                )))
            }
        }
        camera
            .configure(&mut cfgs)
            .map_err(|e| CaptureError::Configure(e.to_string()))?;

        let (format, stream) = {
            let cfg = cfgs
                .get(0)
                .ok_or_else(|| CaptureError::Configure("missing stream configuration".into()))?;
            let size = cfg.get_size();
            let format = NegotiatedFormat {
                width: size.width,
                height: size.height,
                fourcc: cfg.get_pixel_format().fourcc().to_le_bytes(),
                buffer_count: cfg.get_buffer_count(),
            };
            let stream = cfg
                .stream()
                .ok_or_else(|| CaptureError::Configure("configured stream missing".into()))?;
            (format, stream)
        };

        let mut allocator = FrameBufferAllocator::new(&camera);
        let buffers = allocator
            .alloc(&stream)
            .map_err(|e| CaptureError::Allocation(e.to_string()))?;
        if (buffers.len() as u32) < MIN_BUFFERS {
            return Err(CaptureError::Allocation(format!(
                "camera granted {} buffers, need at least {}",
                buffers.len(),
                MIN_BUFFERS
            )));
        }

        let mut idle = Vec::with_capacity(buffers.len());
        for (index, buffer) in buffers.into_iter().enumerate() {
            let mapped = MappedBuffer::new(buffer).map_err(|e| {
                CaptureError::Allocation(format!("mapping buffer {}: {:?}", index, e))
            })?;
            let mut request = camera.create_request(Some(index as u64)).ok_or_else(|| {
                CaptureError::Allocation(format!("creating request {}", index))
            })?;
            request
                .add_buffer(&stream, mapped)
                .map_err(|e| CaptureError::Allocation(e.to_string()))?;
            idle.push(request);
        }

        let (tx, completions) = flume::unbounded();
        camera.on_request_completed(move |request| {
            // Runs on libcamera's thread: hand off and return.
            let _ = tx.send(request);
        });

        let format = NegotiatedFormat {
            buffer_count: idle.len() as u32,
            ..format
        };
        info!(
            "Negotiated {}x{} {} with {} requests on {}",
            format.width,
            format.height,
            String::from_utf8_lossy(&format.fourcc),
            format.buffer_count,
            self.name
        );

        self.acquired = Some(Acquired {
            idle: WorkPool::new(idle),
            completions,
            stream,
            _allocator: allocator,
            _config: cfgs,
            camera,
            _manager: manager,
        });
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

    pub fn stats(&self) -> &Arc<CaptureStats> {
        self.push.stats()
    }

    pub fn on_frame(&mut self, handler: FrameHandler) {
        self.push.on_frame(handler);
    }

    /// Start the camera and queue every request.
    ///
    /// If queueing fails the camera is stopped again. The session stays
    /// configured only when every request came back; otherwise it closes.
    #[instrument(skip(self))]
    pub fn start_streaming(&mut self, frame_rate_hint: u32) -> Result<()> {
        if self.state != SessionState::Configured {
            return Err(self.invalid("start_streaming"));
        }
        let state = self.state;
        let acquired = self.acquired.as_mut().ok_or(CaptureError::InvalidState {
            op: "start_streaming",
            state,
        })?;

        if frame_rate_hint > 0 {
            if exposes(&acquired.camera, ControlId::FrameDurationLimits) {
                self.controls.frame_duration_us = Some(1_000_000 / frame_rate_hint as i64);
            } else {
                debug!("camera has no FrameDurationLimits; ignoring {} fps hint", frame_rate_hint);
            }
        }

        let mut start_controls = ControlList::new();
        self.controls.apply(&mut start_controls);
        acquired
            .camera
            .start(Some(&*start_controls))
            .map_err(|e| CaptureError::StreamStart(e.to_string()))?;

        let mut requeue = Requeue {
            camera: &acquired.camera,
            controls: self.controls,
        };
        if let Err(e) = acquired.idle.submit_all(&mut requeue) {
            self.state = SessionState::Streaming;
            self.halt();

            let complete = self
                .acquired
                .as_ref()
                .is_some_and(|acquired| acquired.idle.is_complete());
            if !complete {
                error!("Camera {} lost a request while starting, closing session", self.name);
                self.close();
            }
            return Err(CaptureError::StreamStart(format!("queueing requests: {}", e)));
        }

        self.state = SessionState::Streaming;
        info!("Camera {} streaming", self.name);
        Ok(())
    }

    /// Deliver completed requests to the handler and queue them again.
    ///
    /// Waits up to `wait` for the first completion (not at all for `None`),
    /// then drains whatever else is ready. Returns the number of requests
    /// delivered. A failed requeue closes the session.
    pub fn dispatch(&mut self, wait: Option<Duration>) -> Result<usize> {
        let (Some(format), SessionState::Streaming) = (self.format, self.state) else {
            return Err(self.invalid("dispatch"));
        };
        let Some(acquired) = self.acquired.as_mut() else {
            return Err(self.invalid("dispatch"));
        };

        let first = match wait {
            Some(wait) => acquired.completions.recv_timeout(wait).ok(),
            None => acquired.completions.try_recv().ok(),
        };
        let Some(first) = first else {
            return Ok(0);
        };

        let mut requeue = Requeue {
            camera: &acquired.camera,
            controls: self.controls,
        };
        let mut delivered = 0;
        let mut failure = None;

        for request in std::iter::once(first).chain(acquired.completions.try_iter()) {
            let work = CompletedRequest {
                request,
                stream: &acquired.stream,
                format,
            };
            match self.push.complete(work, &mut requeue) {
                Ok(Disposition::Resubmitted) => delivered += 1,
                Ok(Disposition::Discarded(work)) => acquired.idle.park(work.request),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            error!("Requeue on {} failed, closing session: {}", self.name, err);
            self.close();
            return Err(err);
        }
        Ok(delivered)
    }

    /// Stop the camera. In-flight requests come back cancelled and are kept
    /// for the next start; none of them reach the handler.
    #[instrument(skip(self))]
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.state != SessionState::Streaming {
            debug!("stop_streaming while {:?}: nothing to do", self.state);
            return Ok(());
        }
        self.halt();
        info!("Camera {} stopped", self.name);
        Ok(())
    }

    fn halt(&mut self) {
        let Some(acquired) = self.acquired.as_mut() else {
            return;
        };
        if let Err(e) = acquired.camera.stop() {
            warn!("Stopping camera {} failed: {}", self.name, e);
        }

        // stop() returns once every queued request completed as cancelled
        let stats = self.push.stats();
        for mut request in acquired.completions.try_iter() {
            stats.record_cancelled();
            request.reuse(ReuseFlag::REUSE_BUFFERS);
            acquired.idle.park(request);
        }
        self.state = SessionState::Configured;
    }

    /// Forward a named control; it applies to every request queued from now on.
    pub fn set_control(&mut self, control: Control) -> Result<()> {
        let Some(acquired) = self.acquired.as_ref() else {
            return Err(self.invalid(control.name()));
        };
        let camera = &acquired.camera;

        match control {
            Control::FrameRate(fps) => {
                if !exposes(camera, ControlId::FrameDurationLimits) {
                    return Err(CaptureError::ControlUnsupported(control.name()));
                }
                self.controls.frame_duration_us = (fps > 0).then(|| 1_000_000 / fps as i64);
            }
            Control::ExposureMode(mode) => {
                if !exposes(camera, ControlId::AeEnable) {
                    return Err(CaptureError::ControlUnsupported(control.name()));
                }
                self.controls.ae_enable = Some(match mode {
                    ExposureMode::Auto => true,
                    ExposureMode::Manual => false,
                    ExposureMode::ShutterPriority | ExposureMode::AperturePriority => {
                        return Err(CaptureError::ControlUnsupported(control.name()))
                    }
                });
            }
            Control::ExposureTime(micros) => {
                if !exposes(camera, ControlId::ExposureTime) {
                    return Err(CaptureError::ControlUnsupported(control.name()));
                }
                self.controls.exposure_time_us = Some(micros.min(i32::MAX as u32) as i32);
            }
        }
        debug!(?control, "control staged");
        Ok(())
    }

    /// Stop if needed, free every request and release the camera.
    pub fn close(&mut self) {
        if self.state == SessionState::Streaming {
            self.halt();
        }
        if self.acquired.take().is_some() {
            info!("Released camera {}", self.name);
        }
        self.format = None;
        self.state = SessionState::Closed;
    }

    fn invalid(&self, op: &'static str) -> CaptureError {
        CaptureError::InvalidState {
            op,
            state: self.state,
        }
    }
}

fn exposes(camera: &ActiveCamera<'static>, id: ControlId) -> bool {
    camera.controls().find(id.into()).map(|_| true).unwrap_or(false)
}

impl Drop for LibcameraCapture {
    fn drop(&mut self) {
        self.close();
    }
}

impl CaptureSession for LibcameraCapture {
    fn state(&self) -> SessionState {
        self.state
    }

    fn format(&self) -> Option<NegotiatedFormat> {
        self.format
    }

    fn start_streaming(&mut self, frame_rate_hint: u32) -> Result<()> {
        LibcameraCapture::start_streaming(self, frame_rate_hint)
    }

    fn stop_streaming(&mut self) -> Result<()> {
        LibcameraCapture::stop_streaming(self)
    }

    fn close(&mut self) {
        LibcameraCapture::close(self)
    }

    fn set_control(&mut self, control: Control) -> Result<()> {
        LibcameraCapture::set_control(self, control)
    }

    fn on_frame(&mut self, handler: FrameHandler) {
        LibcameraCapture::on_frame(self, handler)
    }

    fn dispatch(&mut self) -> Result<usize> {
        let wait = self.wait;
        LibcameraCapture::dispatch(self, Some(wait))
    }

    fn stats(&self) -> Arc<CaptureStats> {
        self.push.stats().clone()
    }
}
