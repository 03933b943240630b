//! Frame buffer ownership.
//!
//! The device fills one pixel buffer per configured sequence. The manager
//! hands out at most one live [`FrameBuffer`] at a time and counts every
//! allocation and release. A buffer is released either explicitly with
//! [`FrameBufferManager::release`], which hands back the samples, or by being
//! dropped on an error path; both count exactly once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::AllocationError;

#[derive(Debug, Default)]
struct Ledger {
    live: AtomicBool,
    allocated: AtomicUsize,
    released: AtomicUsize,
}

/// Snapshot of buffer accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    /// Buffers handed out.
    pub allocated: usize,
    /// Buffers given back.
    pub released: usize,
    /// Whether a buffer is currently outstanding.
    pub live: bool,
}

/// Allocates and releases the pixel buffer of an acquisition.
#[derive(Debug, Clone, Default)]
pub struct FrameBufferManager {
    ledger: Arc<Ledger>,
}

impl FrameBufferManager {
    /// Create a manager with no outstanding buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer of at least `byte_len` bytes of 16-bit samples.
    ///
    /// Fails when `byte_len` is zero, when a buffer is already live, or when the
    /// memory cannot be reserved.
    pub fn allocate(&self, byte_len: u32) -> Result<FrameBuffer, AllocationError> {
        if byte_len == 0 {
            return Err(AllocationError::ZeroLength);
        }
        if self
            .ledger
            .live
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AllocationError::BufferInUse);
        }

        let samples = (byte_len as usize).div_ceil(2);
        let mut data = Vec::new();
        if data.try_reserve_exact(samples).is_err() {
            self.ledger.live.store(false, Ordering::Release);
            return Err(AllocationError::OutOfMemory { bytes: byte_len });
        }
        data.resize(samples, 0u16);

        self.ledger.allocated.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(bytes = byte_len, samples, "Frame buffer allocated");
        Ok(FrameBuffer {
            data,
            byte_len,
            ledger: Arc::clone(&self.ledger),
            released: false,
        })
    }

    /// Release `buffer`, returning its samples.
    pub fn release(&self, mut buffer: FrameBuffer) -> Vec<u16> {
        buffer.mark_released();
        std::mem::take(&mut buffer.data)
    }

    /// Current accounting.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            allocated: self.ledger.allocated.load(Ordering::Acquire),
            released: self.ledger.released.load(Ordering::Acquire),
            live: self.ledger.live.load(Ordering::Acquire),
        }
    }
}

/// Pixel storage for one acquisition. Released on drop if not released explicitly.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u16>,
    byte_len: u32,
    ledger: Arc<Ledger>,
    released: bool,
}

impl FrameBuffer {
    /// Size requested by the device.
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    /// Samples in the buffer.
    pub fn samples(&self) -> &[u16] {
        &self.data
    }

    /// Mutable samples, for handing to the device.
    pub fn samples_mut(&mut self) -> &mut [u16] {
        &mut self.data
    }

    fn mark_released(&mut self) {
        if !self.released {
            self.released = true;
            self.ledger.released.fetch_add(1, Ordering::AcqRel);
            self.ledger.live.store(false, Ordering::Release);
            tracing::debug!(bytes = self.byte_len, "Frame buffer released");
        }
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.mark_released();
    }
}
