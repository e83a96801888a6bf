//! Hardware-mapped buffer slots shared with the capture driver
//!
//! The pool never copies frame data. Each slot is a region of kernel memory
//! mapped into the process once, handed back and forth between the driver
//! and the application every capture cycle, and unmapped exactly once.

use std::io;
use std::ptr::NonNull;

use tracing::{debug, info, warn};

use crate::capture::retry::RetryError;
use crate::error::{CaptureError, Result};

/// Double buffering is the least a capture loop can run with.
pub const MIN_BUFFERS: u32 = 2;

/// Who may touch a slot right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Queued on the device; the driver may write into it at any moment.
    Driver,
    /// Dequeued (or never queued); readable by the application.
    Application,
}

/// Placement of one device buffer, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub length: usize,
    pub offset: u32,
}

/// Device side of pool setup: reserves buffers and maps them.
pub trait BufferSource {
    /// Ask the device for `count` buffers; returns how many it granted.
    /// A count of zero frees the device's buffers.
    fn request_buffers(&mut self, count: u32) -> Result<u32, RetryError>;

    fn query_buffer(&mut self, index: u32) -> Result<SlotInfo, RetryError>;

    fn map(&mut self, length: usize, offset: u32) -> io::Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `base` and `length` must come from a prior successful [`map`] call on
    /// this source, and the region must not be used afterwards.
    ///
    /// [`map`]: BufferSource::map
    unsafe fn unmap(&mut self, base: NonNull<u8>, length: usize) -> io::Result<()>;
}

#[derive(Debug)]
pub struct BufferSlot {
    index: u32,
    base: NonNull<u8>,
    length: usize,
    owner: Owner,
}

impl BufferSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }
}

/// Ordered collection of mapped slots; the slot count is fixed once allocated.
#[derive(Debug, Default)]
pub struct BufferPool {
    slots: Vec<BufferSlot>,
}

// SAFETY: the pool only holds addresses of process-wide shared mappings. Access
// to the memory behind them is gated by `&self`/`&mut self` on the pool.
unsafe impl Send for BufferPool {}

impl BufferPool {
    /// Reserve `count` device buffers and map every one of them.
    ///
    /// Fails if the device grants fewer than [`MIN_BUFFERS`] or any mapping
    /// fails; slots mapped before the failure are unmapped again and the
    /// device's reservation is dropped.
    pub fn allocate<S: BufferSource>(source: &mut S, count: u32) -> Result<Self> {
        let granted = source
            .request_buffers(count)
            .map_err(|e| CaptureError::Allocation(format!("requesting {} buffers: {}", count, e)))?;

        if granted < MIN_BUFFERS {
            let _ = source.request_buffers(0);
            return Err(CaptureError::Allocation(format!(
                "device granted {} buffers, need at least {}",
                granted, MIN_BUFFERS
            )));
        }

        let mut pool = BufferPool {
            slots: Vec::with_capacity(granted as usize),
        };

        for index in 0..granted {
            let mapped = source
                .query_buffer(index)
                .map_err(|e| CaptureError::Allocation(format!("querying slot {}: {}", index, e)))
                .and_then(|info| pool.map_slot(source, index, info.length, info.offset));

            if let Err(err) = mapped {
                pool.release(source);
                let _ = source.request_buffers(0);
                return Err(match err {
                    CaptureError::Map { .. } => CaptureError::Allocation(err.to_string()),
                    other => other,
                });
            }
        }

        info!(
            "Mapped {} buffer slots ({} bytes total)",
            pool.len(),
            pool.total_bytes()
        );
        Ok(pool)
    }

    /// Map one slot and append it to the pool. Slots must be mapped in index
    /// order.
    pub fn map_slot<S: BufferSource>(
        &mut self,
        source: &mut S,
        index: u32,
        length: usize,
        offset: u32,
    ) -> Result<()> {
        if index as usize != self.slots.len() {
            return Err(CaptureError::Map {
                index,
                length,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("expected slot {}", self.slots.len()),
                ),
            });
        }

        let base = source
            .map(length, offset)
            .map_err(|source| CaptureError::Map {
                index,
                length,
                source,
            })?;

        debug!(index, length, offset, "mapped slot");
        self.slots.push(BufferSlot {
            index,
            base,
            length,
            owner: Owner::Application,
        });
        Ok(())
    }

    /// Unmap every slot. Calling it again, or on an empty pool, does nothing.
    pub fn release<S: BufferSource>(&mut self, source: &mut S) {
        if self.slots.is_empty() {
            return;
        }

        for slot in self.slots.drain(..) {
            // SAFETY: each slot was produced by `source.map` and is dropped
            // from the pool here, so it is unmapped exactly once.
            if let Err(e) = unsafe { source.unmap(slot.base, slot.length) } {
                warn!("Failed to unmap slot {}: {}", slot.index, e);
            }
        }
        debug!("buffer pool released");
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.slots.iter().map(|s| s.length).sum()
    }

    pub fn slot(&self, index: u32) -> Option<&BufferSlot> {
        self.slots.get(index as usize)
    }

    pub fn owned_by(&self, owner: Owner) -> usize {
        self.slots.iter().filter(|s| s.owner == owner).count()
    }

    /// Record that `index` was queued on the device.
    pub fn hand_to_driver(&mut self, index: u32) -> Result<()> {
        self.transition(index, Owner::Application, Owner::Driver)
    }

    /// Record that `index` was dequeued from the device.
    pub fn hand_to_application(&mut self, index: u32) -> Result<()> {
        self.transition(index, Owner::Driver, Owner::Application)
    }

    /// The device dropped its whole queue (stream off): every slot is back
    /// with the application.
    pub fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            slot.owner = Owner::Application;
        }
    }

    /// Borrow the first `used` bytes of an application-owned slot.
    pub fn frame_bytes(&self, index: u32, used: usize) -> Option<&[u8]> {
        let slot = self.slot(index)?;
        if slot.owner != Owner::Application {
            return None;
        }
        let len = used.min(slot.length);
        // SAFETY: the mapping is live for as long as the slot is in the pool,
        // the slot is application-owned so the driver is not writing to it,
        // and the returned slice borrows `self`.
        Some(unsafe { std::slice::from_raw_parts(slot.base.as_ptr(), len) })
    }

    fn transition(&mut self, index: u32, from: Owner, to: Owner) -> Result<()> {
        let slot = self.slots.get_mut(index as usize).ok_or_else(|| {
            CaptureError::fatal(
                "slot transition",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("device reported unknown slot {}", index),
                ),
            )
        })?;

        if slot.owner != from {
            return Err(CaptureError::fatal(
                "slot transition",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("slot {} is {:?}-owned, expected {:?}", index, slot.owner, from),
                ),
            ));
        }

        slot.owner = to;
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            warn!(
                "Buffer pool dropped with {} slots still mapped",
                self.slots.len()
            );
        }
    }
}
