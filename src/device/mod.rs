//! PVCAM device abstraction.
//!
//! [`PvcamDevice`] is the seam between the acquisition core and the camera
//! library. Each method corresponds to one `pl_*` call and reports failures as
//! a [`DeviceError`] carrying the library's error code.
//!
//! Two implementations exist:
//! - [`mock::MockPvcam`] - an instrumented simulated camera used by the tests and
//!   the `--mock` CLI mode.
//! - `pvcam::PvcamSdk` - the real SDK through `pvcam-sys` (feature `pvcam_hardware`).
//!
//! All methods take `&self` so a device can be shared as `Arc<dyn PvcamDevice>`;
//! implementations use interior mutability where they keep state.

pub mod mock;
#[cfg(feature = "pvcam_hardware")]
pub mod pvcam;

use std::time::Duration;

use crate::error::DeviceError;
use crate::region::{RegionDescriptor, TimingMode};

/// Camera handle (wraps the PVCAM `int16` handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CameraHandle(pub i16);

/// Raw PVCAM image status codes (`PL_IMAGE_STATUSES`).
pub mod raw_status {
    /// `READOUT_NOT_ACTIVE`
    pub const READOUT_NOT_ACTIVE: i16 = 0;
    /// `EXPOSURE_IN_PROGRESS`
    pub const EXPOSURE_IN_PROGRESS: i16 = 1;
    /// `READOUT_IN_PROGRESS`
    pub const READOUT_IN_PROGRESS: i16 = 2;
    /// `READOUT_COMPLETE`
    pub const READOUT_COMPLETE: i16 = 3;
    /// `FRAME_AVAILABLE`, equivalent to `READOUT_COMPLETE` for sequence acquisition.
    pub const FRAME_AVAILABLE: i16 = 4;
    /// `READOUT_FAILED`
    pub const READOUT_FAILED: i16 = 5;
    /// `ACQUISITION_IN_PROGRESS`
    pub const ACQUISITION_IN_PROGRESS: i16 = 6;
}

/// State of the current exposure as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    /// No exposure active.
    Idle,
    /// Exposing or reading out.
    Running,
    /// Pixel data is in the buffer.
    ReadoutComplete,
    /// The device gave up on the readout.
    ReadoutFailed,
}

impl SequenceStatus {
    /// Classify a raw PVCAM status code. Unknown codes are treated as failures.
    pub fn from_raw(code: i16) -> Self {
        use raw_status::*;
        match code {
            READOUT_NOT_ACTIVE => SequenceStatus::Idle,
            EXPOSURE_IN_PROGRESS | READOUT_IN_PROGRESS | ACQUISITION_IN_PROGRESS => {
                SequenceStatus::Running
            }
            READOUT_COMPLETE | FRAME_AVAILABLE => SequenceStatus::ReadoutComplete,
            _ => SequenceStatus::ReadoutFailed,
        }
    }

    /// `ReadoutComplete` and `ReadoutFailed` end polling.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SequenceStatus::ReadoutComplete | SequenceStatus::ReadoutFailed
        )
    }
}

/// Result of one `pl_exp_check_status` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    /// Raw status code.
    pub raw: i16,
    /// Bytes of pixel data that have arrived so far.
    pub bytes_arrived: u32,
}

impl StatusReport {
    /// Classified status.
    pub fn status(&self) -> SequenceStatus {
        SequenceStatus::from_raw(self.raw)
    }
}

/// Arguments of `pl_exp_setup_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSetup {
    /// Exposures captured per started sequence.
    pub exposures: u16,
    /// Region read out (always a single region).
    pub region: RegionDescriptor,
    /// Timing mode.
    pub mode: TimingMode,
    /// Exposure duration.
    pub exposure: Duration,
}

/// PVCAM library operations used by the acquisition workflow.
pub trait PvcamDevice: Send + Sync {
    /// `pl_pvcam_init`
    fn init_library(&self) -> Result<(), DeviceError>;

    /// `pl_pvcam_uninit`
    fn uninit_library(&self) -> Result<(), DeviceError>;

    /// `pl_cam_get_name`
    fn camera_name(&self, index: i16) -> Result<String, DeviceError>;

    /// `pl_cam_open` in exclusive mode.
    fn open_camera(&self, name: &str) -> Result<CameraHandle, DeviceError>;

    /// `pl_cam_close`
    fn close_camera(&self, handle: CameraHandle) -> Result<(), DeviceError>;

    /// `pl_exp_init_seq`
    fn init_sequence(&self) -> Result<(), DeviceError>;

    /// `pl_exp_uninit_seq`
    fn uninit_sequence(&self) -> Result<(), DeviceError>;

    /// `pl_exp_setup_seq`. Returns the pixel stream size in bytes.
    fn setup_sequence(
        &self,
        handle: CameraHandle,
        setup: &SequenceSetup,
    ) -> Result<u32, DeviceError>;

    /// `pl_exp_start_seq`. Returns immediately; the device fills `buffer` while
    /// the exposure runs, so it must stay alive and unmoved until the sequence is
    /// finished or aborted.
    fn start_sequence(&self, handle: CameraHandle, buffer: &mut [u16])
        -> Result<(), DeviceError>;

    /// `pl_exp_check_status`
    fn check_status(&self, handle: CameraHandle) -> Result<StatusReport, DeviceError>;

    /// `pl_exp_finish_seq`
    fn finish_sequence(&self, handle: CameraHandle, buffer: &mut [u16])
        -> Result<(), DeviceError>;

    /// `pl_exp_abort` with `CCS_HALT`.
    fn abort(&self, handle: CameraHandle) -> Result<(), DeviceError>;
}
