//! Error types for the acquisition workflow.
//!
//! Every fallible step of an acquisition maps onto one variant of
//! [`AcquisitionError`]. Failures reported by the camera carry the PVCAM error
//! code and message captured at the moment of failure ([`DeviceError`]) so that
//! the caller can diagnose the hardware state after the run has been torn down.
//!
//! ## Error Hierarchy
//!
//! - **Setup** (`Init`, `DeviceName`, `Open`, `Config`): fatal for the run, never retried.
//! - **Buffer** (`Allocation`): the device asked for an unusable buffer or memory ran out.
//! - **Exposure loop** (`Start`, `ReadoutFailed`, `PollTimeout`, `Cancelled`): abort the
//!   remaining frames of the sequence; the buffer is still released.
//! - **Teardown** (`Finalize`): the post-exposure clean-up call was rejected.
//!
//! Encoding problems are reported through [`EncodeError`]. They never turn a
//! captured frame into an [`AcquisitionError`]; the frame is returned with the
//! encode outcome attached instead.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcquisitionError>;

/// A failed device call, as reported by the PVCAM error facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    /// Value of `pl_error_code()` right after the failure.
    pub code: i16,
    /// Value of `pl_error_message()` for `code`.
    pub message: String,
}

impl DeviceError {
    /// Create a device error from a code and message.
    pub fn new(code: i16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {} - {}", self.code, self.message)
    }
}

impl std::error::Error for DeviceError {}

/// Which initialisation step was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    /// `pl_pvcam_init`
    Library,
    /// `pl_exp_init_seq`
    Sequence,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitStage::Library => write!(f, "library"),
            InitStage::Sequence => write!(f, "sequence subsystem"),
        }
    }
}

/// Frame buffer allocation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// Sequence setup reported 0 bytes per frame.
    #[error("device reported a zero-length frame buffer")]
    ZeroLength,

    /// The previous buffer was never released.
    #[error("a frame buffer is already live for this acquisition")]
    BufferInUse,

    /// The allocator refused the request.
    #[error("could not reserve {bytes} bytes for the frame buffer")]
    OutOfMemory {
        /// Requested size.
        bytes: u32,
    },
}

/// Errors that end an acquisition run.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// The library or the sequence subsystem refused to initialise.
    #[error("{stage} initialisation failed: {source}")]
    Init {
        /// Step that failed.
        stage: InitStage,
        /// Device error reported for it.
        #[source]
        source: DeviceError,
    },

    /// No camera name for the requested index.
    #[error("could not read name of camera {index}: {source}")]
    DeviceName {
        /// Camera index that was looked up.
        index: i16,
        /// Device error reported for the lookup.
        #[source]
        source: DeviceError,
    },

    /// The camera could not be opened exclusively.
    #[error("could not open camera '{name}': {source}")]
    Open {
        /// Camera name passed to the open call.
        name: String,
        /// Device error reported for the open.
        #[source]
        source: DeviceError,
    },

    /// Sequence setup was rejected or described an unusable frame.
    #[error("exposure setup rejected: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
        /// Device error, when the device rejected the call.
        #[source]
        source: Option<DeviceError>,
    },

    /// No buffer could be allocated for the frame.
    #[error("frame buffer allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// Starting an exposure was rejected.
    #[error("could not start exposure {frame}: {source}")]
    Start {
        /// 1-based exposure number.
        frame: u16,
        /// Device error reported for the start.
        #[source]
        source: DeviceError,
    },

    /// The device reported a failed readout.
    #[error("readout failed during exposure {frame} ({remaining} frames not acquired)")]
    ReadoutFailed {
        /// 1-based exposure number.
        frame: u16,
        /// Exposures of the run that were never started.
        remaining: u16,
        /// Device error, when the status query itself failed.
        #[source]
        source: Option<DeviceError>,
    },

    /// Status polling hit its bound before readout finished.
    #[error("exposure {frame} did not finish after {attempts} status polls ({elapsed:?})")]
    PollTimeout {
        /// 1-based exposure number.
        frame: u16,
        /// Status queries made.
        attempts: u32,
        /// Time spent polling.
        elapsed: Duration,
    },

    /// The cancel token was set before or during this exposure.
    #[error("acquisition cancelled during exposure {frame}")]
    Cancelled {
        /// 1-based exposure number.
        frame: u16,
    },

    /// The post-exposure clean-up call was rejected.
    #[error("post-exposure clean-up failed: {source}")]
    Finalize {
        /// Device error reported for it.
        #[source]
        source: DeviceError,
    },
}

impl AcquisitionError {
    /// The device error code attached to this failure, if any.
    pub fn device_code(&self) -> Option<i16> {
        match self {
            AcquisitionError::Init { source, .. }
            | AcquisitionError::DeviceName { source, .. }
            | AcquisitionError::Open { source, .. }
            | AcquisitionError::Start { source, .. }
            | AcquisitionError::Finalize { source } => Some(source.code),
            AcquisitionError::Config { source, .. }
            | AcquisitionError::ReadoutFailed { source, .. } => source.as_ref().map(|e| e.code),
            AcquisitionError::Allocation(_)
            | AcquisitionError::PollTimeout { .. }
            | AcquisitionError::Cancelled { .. } => None,
        }
    }
}

/// Errors raised while persisting a frame as a FITS image.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The pixel payload does not fill the declared image.
    #[error("pixel payload has {actual} samples but image is {width}x{height}")]
    DimensionMismatch {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
        /// Samples supplied.
        actual: usize,
    },

    /// Malformed or reserved header keyword name.
    #[error("invalid header keyword '{0}'")]
    InvalidKeyword(String),

    /// Sink calls were made out of order.
    #[error("image file used out of order: {0}")]
    State(&'static str),

    /// The file was closed before every pixel was written.
    #[error("FITS file is truncated: {0}")]
    Truncated(String),

    /// The file is not a 16-bit 2-D image.
    #[error("not a supported FITS image: {0}")]
    Format(String),

    /// CFITSIO reported a failure.
    #[error("CFITSIO error {status}: {message}")]
    Library {
        /// CFITSIO status code.
        status: i32,
        /// CFITSIO error text.
        message: String,
    },

    /// Built without the `storage_fits` feature.
    #[error("FITS output is not compiled in; rebuild with the `storage_fits` feature")]
    Unavailable,

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
