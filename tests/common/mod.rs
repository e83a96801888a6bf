#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use camloop::capture::device::{CaptureDevice, DeviceFormat};
use camloop::capture::dispatch::Dequeued;
use camloop::capture::pool::SlotInfo;
use camloop::capture::retry::{Readiness, RetryGuard};
use camloop::CaptureConfig;

/// Scriptable in-memory stand-in for a V4L2 capture node.
#[derive(Debug)]
pub struct FakeState {
    pub grant: u32,
    pub slot_len: usize,
    pub frame_len: usize,
    /// Format reported back instead of the requested one.
    pub adjust_to: Option<DeviceFormat>,
    pub reject_format: bool,
    pub fail_stream_on: bool,
    pub fail_dequeue: bool,
    /// EAGAIN answers before each successful dequeue.
    pub busy_dequeues: u32,
    pub no_frame_rate: bool,
    pub unsupported_controls: bool,

    pub buffers: Vec<Vec<u8>>,
    pub queued: VecDeque<u32>,
    pub streaming: bool,
    pub sequence: u64,
    pub reqbufs: Vec<u32>,
    pub maps: usize,
    pub unmaps: usize,
    pub waits: usize,
    pub busy_left: u32,
    pub frame_rate: Option<u32>,
    pub controls: Vec<(u32, i32)>,
    pub dropped: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            grant: 4,
            slot_len: 4096,
            frame_len: 1500,
            adjust_to: None,
            reject_format: false,
            fail_stream_on: false,
            fail_dequeue: false,
            busy_dequeues: 0,
            no_frame_rate: false,
            unsupported_controls: false,
            buffers: Vec::new(),
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
            reqbufs: Vec::new(),
            maps: 0,
            unmaps: 0,
            waits: 0,
            busy_left: 0,
            frame_rate: None,
            controls: Vec::new(),
            dropped: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeHandle(Arc<Mutex<FakeState>>);

impl FakeHandle {
    pub fn get(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }

    pub fn device(&self) -> FakeDevice {
        FakeDevice(self.0.clone())
    }
}

pub struct FakeDevice(Arc<Mutex<FakeState>>);

impl FakeDevice {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.0.lock().unwrap()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.state().dropped = true;
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl CaptureDevice for FakeDevice {
    fn name(&self) -> &str {
        "fake"
    }

    fn set_format(&mut self, width: u32, height: u32, fourcc: [u8; 4]) -> io::Result<DeviceFormat> {
        let state = self.state();
        if state.reject_format {
            return Err(errno(libc::EINVAL));
        }
        Ok(state.adjust_to.unwrap_or(DeviceFormat {
            width,
            height,
            fourcc,
            size_image: state.slot_len as u32,
        }))
    }

    fn set_frame_rate(&mut self, fps: u32) -> io::Result<()> {
        let mut state = self.state();
        if state.no_frame_rate {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }
        state.frame_rate = Some(fps);
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut state = self.state();
        state.reqbufs.push(count);
        let granted = count.min(state.grant);
        let len = state.slot_len;
        state.buffers = (0..granted).map(|_| vec![0u8; len]).collect();
        Ok(granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<SlotInfo> {
        let state = self.state();
        if index as usize >= state.buffers.len() {
            return Err(errno(libc::EINVAL));
        }
        Ok(SlotInfo {
            length: state.slot_len,
            offset: index * state.slot_len as u32,
        })
    }

    fn map_buffer(&mut self, length: usize, offset: u32) -> io::Result<NonNull<u8>> {
        let mut state = self.state();
        let index = offset as usize / state.slot_len;
        if length != state.slot_len {
            return Err(errno(libc::EINVAL));
        }
        state.maps += 1;
        let buffer = state
            .buffers
            .get_mut(index)
            .ok_or_else(|| errno(libc::EINVAL))?;
        Ok(NonNull::new(buffer.as_mut_ptr()).unwrap())
    }

    unsafe fn unmap_buffer(&mut self, _base: NonNull<u8>, _length: usize) -> io::Result<()> {
        self.state().unmaps += 1;
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut state = self.state();
        if index as usize >= state.buffers.len() || state.queued.contains(&index) {
            return Err(errno(libc::EINVAL));
        }
        state.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        let mut state = self.state();
        if !state.streaming {
            return Err(errno(libc::EINVAL));
        }
        if state.fail_dequeue {
            return Err(errno(libc::EIO));
        }
        if state.busy_left > 0 {
            state.busy_left -= 1;
            return Err(errno(libc::EAGAIN));
        }
        let Some(index) = state.queued.pop_front() else {
            return Err(errno(libc::EAGAIN));
        };

        state.busy_left = state.busy_dequeues;
        state.sequence += 1;
        let sequence = state.sequence;
        let frame_len = state.frame_len;
        let buffer = &mut state.buffers[index as usize];
        buffer[..frame_len].fill(sequence as u8);

        Ok(Dequeued {
            index,
            bytes_used: frame_len,
            sequence,
            timestamp: Some(Duration::from_millis(33 * sequence)),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_stream_on {
            return Err(errno(libc::EIO));
        }
        state.streaming = true;
        state.busy_left = state.busy_dequeues;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut state = self.state();
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }

    fn set_control(&mut self, id: u32, value: i32) -> io::Result<()> {
        let mut state = self.state();
        if state.unsupported_controls {
            return Err(errno(libc::EINVAL));
        }
        state.controls.push((id, value));
        Ok(())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> io::Result<Readiness> {
        let mut state = self.state();
        state.waits += 1;
        Ok(if state.queued.is_empty() {
            Readiness::TimedOut
        } else {
            Readiness::Ready
        })
    }
}

pub fn fast_guard() -> RetryGuard {
    RetryGuard::new(10, Duration::from_millis(1))
}

/// 1280x720 MJPEG with four buffers.
pub fn capture_config() -> CaptureConfig {
    CaptureConfig::default()
}
