//! Single-workflow CCD acquisition for Princeton Instruments PIXIS cameras.
//!
//! The library opens a camera through PVCAM, runs a timed exposure sequence
//! over a region of interest, polls until readout completes and writes the
//! frame as a 16-bit FITS image. The device layer is a trait so the same
//! control flow runs against the real SDK (feature `pvcam_hardware`) or the
//! instrumented [`device::mock::MockPvcam`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use pixis_capture::acquisition::SequenceController;
//! use pixis_capture::device::mock::MockPvcam;
//! use pixis_capture::region::{ExposureConfig, RegionDescriptor};
//! use pixis_capture::session::{CameraSelector, DeviceSession};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = DeviceSession::open(Arc::new(MockPvcam::new()), &CameraSelector::Index(0))?;
//! let mut controller = SequenceController::new(&session, "testfile.fits");
//! let frame = controller.run_acquisition(
//!     ExposureConfig::new(10, 1)?,
//!     RegionDescriptor::full_frame(2048, 2048)?,
//! )?;
//! println!("{} pixels", frame.pixels.len());
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod fits;
pub mod logging;
pub mod region;
pub mod session;

pub use acquisition::{Frame, SequenceController};
pub use config::CaptureConfig;
pub use error::{AcqResult, AcquisitionError, DeviceError, EncodeError};
