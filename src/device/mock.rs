//! Simulated PVCAM camera.
//!
//! `MockPvcam` behaves like a single PIXIS attached to the host: it tracks
//! library, camera and sequence state, reports a buffer size derived from the
//! configured region, and walks every started exposure through a few
//! `Running` polls before reporting `READOUT_COMPLETE`. Every call is recorded
//! so tests can assert on exact call sequences, and failures can be injected
//! per call kind or per exposure.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{raw_status, CameraHandle, PvcamDevice, SequenceSetup, StatusReport};
use crate::error::DeviceError;

/// Name reported for camera 0 unless overridden.
pub const DEFAULT_CAMERA_NAME: &str = "PIXIS 2048F";

/// Error codes used by the simulated library.
pub mod codes {
    /// Library call made before `pl_pvcam_init`.
    pub const NOT_INITIALIZED: i16 = 2;
    /// Camera index or name not known.
    pub const NO_SUCH_CAMERA: i16 = 3;
    /// Camera handle not open.
    pub const CAMERA_NOT_OPEN: i16 = 4;
    /// Sequence call made before `pl_exp_init_seq` or `pl_exp_setup_seq`.
    pub const SEQUENCE_NOT_READY: i16 = 5;
    /// Buffer passed to start/finish is smaller than the setup size.
    pub const BUFFER_TOO_SMALL: i16 = 6;
    /// Readout failure injected by a test.
    pub const READOUT_FAILED: i16 = 185;
}

/// Device calls recorded by [`MockPvcam`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    /// [`PvcamDevice::init_library`]
    InitLibrary,
    /// [`PvcamDevice::uninit_library`]
    UninitLibrary,
    /// [`PvcamDevice::camera_name`]
    CameraName,
    /// [`PvcamDevice::open_camera`]
    OpenCamera,
    /// [`PvcamDevice::close_camera`]
    CloseCamera,
    /// [`PvcamDevice::init_sequence`]
    InitSequence,
    /// [`PvcamDevice::uninit_sequence`]
    UninitSequence,
    /// [`PvcamDevice::setup_sequence`]
    SetupSequence,
    /// [`PvcamDevice::start_sequence`]
    StartSequence,
    /// [`PvcamDevice::check_status`]
    CheckStatus,
    /// [`PvcamDevice::finish_sequence`]
    FinishSequence,
    /// [`PvcamDevice::abort`]
    Abort,
}

/// Pixel value the simulated sensor produces at binned `(x, y)` of exposure `frame`.
pub fn mock_pixel(x: u32, y: u32, frame: u16) -> u16 {
    ((x + y + u32::from(frame) * 7) % 65_536) as u16
}

#[derive(Debug, Default)]
struct MockState {
    cameras: Vec<String>,
    library_initialized: bool,
    open_handle: Option<CameraHandle>,
    next_handle: i16,
    sequence_initialized: bool,
    setup: Option<SequenceSetup>,
    setup_bytes: u32,
    exposures_started: u16,
    exposure_active: bool,
    polls_this_exposure: u32,
    calls: Vec<MockCall>,
}

#[derive(Debug, Default)]
struct MockBehaviour {
    failures: HashMap<MockCall, DeviceError>,
    buffer_bytes: Option<u32>,
    polls_per_exposure: u32,
    readout_failure_on: Option<u16>,
    status_error_on: Option<u16>,
    never_complete: bool,
}

/// Instrumented simulated camera.
pub struct MockPvcam {
    behaviour: MockBehaviour,
    state: Mutex<MockState>,
}

impl MockPvcam {
    /// One camera named [`DEFAULT_CAMERA_NAME`]; exposures complete after two `Running` polls.
    pub fn new() -> Self {
        Self {
            behaviour: MockBehaviour {
                polls_per_exposure: 2,
                ..MockBehaviour::default()
            },
            state: Mutex::new(MockState {
                cameras: vec![DEFAULT_CAMERA_NAME.to_string()],
                next_handle: 1,
                ..MockState::default()
            }),
        }
    }

    /// Replace the list of attached cameras.
    pub fn with_cameras(self, names: &[&str]) -> Self {
        self.state.lock().cameras = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Make every call of kind `call` fail with `error`.
    pub fn failing(mut self, call: MockCall, error: DeviceError) -> Self {
        self.behaviour.failures.insert(call, error);
        self
    }

    /// Report `bytes` from `setup_sequence` instead of the region's true size.
    pub fn with_buffer_bytes(mut self, bytes: u32) -> Self {
        self.behaviour.buffer_bytes = Some(bytes);
        self
    }

    /// Number of `Running` polls each exposure reports before completing.
    pub fn with_polls_per_exposure(mut self, polls: u32) -> Self {
        self.behaviour.polls_per_exposure = polls;
        self
    }

    /// Report `READOUT_FAILED` for the `exposure`th started exposure (1-based).
    pub fn fail_readout_on(mut self, exposure: u16) -> Self {
        self.behaviour.readout_failure_on = Some(exposure);
        self
    }

    /// Make `check_status` itself fail during the `exposure`th exposure (1-based).
    pub fn fail_status_query_on(mut self, exposure: u16) -> Self {
        self.behaviour.status_error_on = Some(exposure);
        self
    }

    /// Keep reporting `EXPOSURE_IN_PROGRESS` forever.
    pub fn never_complete(mut self) -> Self {
        self.behaviour.never_complete = true;
        self
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// How many times `call` was made.
    pub fn count(&self, call: MockCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Whether the library is currently initialised.
    pub fn is_library_initialized(&self) -> bool {
        self.state.lock().library_initialized
    }

    /// Whether a camera is currently open.
    pub fn is_camera_open(&self) -> bool {
        self.state.lock().open_handle.is_some()
    }

    /// Whether the sequence subsystem is currently initialised.
    pub fn is_sequence_initialized(&self) -> bool {
        self.state.lock().sequence_initialized
    }

    /// The most recent `setup_sequence` arguments.
    pub fn last_setup(&self) -> Option<SequenceSetup> {
        self.state.lock().setup
    }

    /// Record `call` and return the injected failure for it, if any.
    fn enter(&self, state: &mut MockState, call: MockCall) -> Result<(), DeviceError> {
        state.calls.push(call);
        match self.behaviour.failures.get(&call) {
            Some(err) => {
                tracing::debug!(?call, code = err.code, "Mock PVCAM injecting failure");
                Err(err.clone())
            }
            None => Ok(()),
        }
    }

    fn check_open(state: &MockState, handle: CameraHandle) -> Result<(), DeviceError> {
        if state.open_handle == Some(handle) {
            Ok(())
        } else {
            Err(DeviceError::new(
                codes::CAMERA_NOT_OPEN,
                format!("camera handle {} is not open", handle.0),
            ))
        }
    }

    fn check_buffer(state: &MockState, buffer: &[u16]) -> Result<(), DeviceError> {
        let capacity = buffer.len() * 2;
        if capacity < state.setup_bytes as usize {
            return Err(DeviceError::new(
                codes::BUFFER_TOO_SMALL,
                format!(
                    "buffer holds {} bytes, sequence needs {}",
                    capacity, state.setup_bytes
                ),
            ));
        }
        Ok(())
    }
}

impl Default for MockPvcam {
    fn default() -> Self {
        Self::new()
    }
}

impl PvcamDevice for MockPvcam {
    fn init_library(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::InitLibrary)?;
        state.library_initialized = true;
        tracing::info!("Mock PVCAM library initialized");
        Ok(())
    }

    fn uninit_library(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::UninitLibrary)?;
        state.open_handle = None;
        state.sequence_initialized = false;
        state.library_initialized = false;
        tracing::info!("Mock PVCAM library uninitialized");
        Ok(())
    }

    fn camera_name(&self, index: i16) -> Result<String, DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::CameraName)?;
        if !state.library_initialized {
            return Err(DeviceError::new(codes::NOT_INITIALIZED, "library not initialized"));
        }
        usize::try_from(index)
            .ok()
            .and_then(|i| state.cameras.get(i).cloned())
            .ok_or_else(|| {
                DeviceError::new(codes::NO_SUCH_CAMERA, format!("no camera at index {}", index))
            })
    }

    fn open_camera(&self, name: &str) -> Result<CameraHandle, DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::OpenCamera)?;
        if !state.library_initialized {
            return Err(DeviceError::new(codes::NOT_INITIALIZED, "library not initialized"));
        }
        if !state.cameras.iter().any(|c| c == name) {
            return Err(DeviceError::new(
                codes::NO_SUCH_CAMERA,
                format!("no camera named '{}'", name),
            ));
        }
        let handle = CameraHandle(state.next_handle);
        state.next_handle += 1;
        state.open_handle = Some(handle);
        tracing::info!(camera = name, handle = handle.0, "Mock camera opened");
        Ok(handle)
    }

    fn close_camera(&self, handle: CameraHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::CloseCamera)?;
        Self::check_open(&state, handle)?;
        state.open_handle = None;
        tracing::info!(handle = handle.0, "Mock camera closed");
        Ok(())
    }

    fn init_sequence(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::InitSequence)?;
        if !state.library_initialized {
            return Err(DeviceError::new(codes::NOT_INITIALIZED, "library not initialized"));
        }
        state.sequence_initialized = true;
        Ok(())
    }

    fn uninit_sequence(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::UninitSequence)?;
        state.sequence_initialized = false;
        state.setup = None;
        Ok(())
    }

    fn setup_sequence(
        &self,
        handle: CameraHandle,
        setup: &SequenceSetup,
    ) -> Result<u32, DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::SetupSequence)?;
        Self::check_open(&state, handle)?;
        if !state.sequence_initialized {
            return Err(DeviceError::new(
                codes::SEQUENCE_NOT_READY,
                "sequence functions not initialized",
            ));
        }
        let natural = setup.region.pixel_count() as u64 * 2 * u64::from(setup.exposures);
        let bytes = self
            .behaviour
            .buffer_bytes
            .unwrap_or_else(|| u32::try_from(natural).unwrap_or(u32::MAX));
        state.setup = Some(*setup);
        state.setup_bytes = bytes;
        tracing::debug!(bytes, region = %setup.region, "Mock sequence configured");
        Ok(bytes)
    }

    fn start_sequence(
        &self,
        handle: CameraHandle,
        buffer: &mut [u16],
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::StartSequence)?;
        Self::check_open(&state, handle)?;
        let setup = state.setup.ok_or_else(|| {
            DeviceError::new(codes::SEQUENCE_NOT_READY, "sequence not configured")
        })?;
        Self::check_buffer(&state, buffer)?;

        state.exposures_started += 1;
        state.exposure_active = true;
        state.polls_this_exposure = 0;

        let frame = state.exposures_started;
        let width = setup.region.width().max(1);
        for (i, px) in buffer.iter_mut().enumerate() {
            let i = i as u32;
            *px = mock_pixel(i % width, i / width, frame);
        }
        tracing::debug!(exposure = frame, "Mock exposure started");
        Ok(())
    }

    fn check_status(&self, handle: CameraHandle) -> Result<StatusReport, DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::CheckStatus)?;
        Self::check_open(&state, handle)?;
        if !state.exposure_active {
            return Ok(StatusReport {
                raw: raw_status::READOUT_NOT_ACTIVE,
                bytes_arrived: 0,
            });
        }

        let exposure = state.exposures_started;
        if self.behaviour.status_error_on == Some(exposure) {
            return Err(DeviceError::new(
                codes::READOUT_FAILED,
                "status query failed",
            ));
        }
        if self.behaviour.readout_failure_on == Some(exposure) {
            state.exposure_active = false;
            return Ok(StatusReport {
                raw: raw_status::READOUT_FAILED,
                bytes_arrived: 0,
            });
        }

        state.polls_this_exposure += 1;
        if self.behaviour.never_complete
            || state.polls_this_exposure <= self.behaviour.polls_per_exposure
        {
            let progress = state.polls_this_exposure.saturating_sub(1);
            let total = self.behaviour.polls_per_exposure.max(1);
            let bytes_arrived =
                (u64::from(state.setup_bytes) * u64::from(progress.min(total)) / u64::from(total)) as u32;
            return Ok(StatusReport {
                raw: raw_status::EXPOSURE_IN_PROGRESS,
                bytes_arrived,
            });
        }

        state.exposure_active = false;
        Ok(StatusReport {
            raw: raw_status::READOUT_COMPLETE,
            bytes_arrived: state.setup_bytes,
        })
    }

    fn finish_sequence(
        &self,
        handle: CameraHandle,
        buffer: &mut [u16],
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::FinishSequence)?;
        Self::check_open(&state, handle)?;
        Self::check_buffer(&state, buffer)?;
        Ok(())
    }

    fn abort(&self, handle: CameraHandle) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        self.enter(&mut state, MockCall::Abort)?;
        Self::check_open(&state, handle)?;
        state.exposure_active = false;
        Ok(())
    }
}
