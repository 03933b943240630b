//! Sequence controller.
//!
//! Runs one acquisition on an open [`DeviceSession`]: initialise the sequence
//! functions, configure a single-exposure sequence for the region, allocate
//! the pixel buffer, then start and poll `frame_count` exposures into that
//! buffer. After the last readout the sequence is finished, the buffer is
//! encoded as a FITS image and everything is torn down in reverse order.
//!
//! Any failure after the sequence is initialised still uninitialises it and
//! releases the buffer. Exposures that fail, time out or are cancelled are
//! aborted with `CCS_HALT` first.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::buffer::{BufferStats, FrameBufferManager};
use super::cancel::CancelToken;
use super::poller::{poll_until_terminal, PollError, PollPolicy};
use crate::device::{CameraHandle, PvcamDevice, SequenceSetup, SequenceStatus};
use crate::session::DeviceSession;
use crate::error::{AcqResult, AcquisitionError, EncodeError, InitStage};
use crate::fits::{self, FitsFile, ImageSink};
use crate::region::{ExposureConfig, ImageMetadata, RegionDescriptor};

/// Result of a completed acquisition.
#[derive(Debug)]
pub struct Frame {
    /// Contents of the frame buffer after the last exposure.
    pub pixels: Vec<u16>,
    /// Geometry and exposure of the image.
    pub metadata: ImageMetadata,
    /// Exposures started and read out.
    pub frames_acquired: u16,
    /// Bytes the device reported for the last exposure.
    pub bytes_arrived: u32,
    /// When the last readout finished.
    pub completed_at: DateTime<Utc>,
    /// Where the image was written, or why writing failed.
    ///
    /// Encoding failures are reported here rather than failing the acquisition.
    pub encoded: Result<PathBuf, EncodeError>,
}

/// Keeps the sequence functions initialised while alive.
struct SequenceGuard<'a> {
    device: &'a dyn PvcamDevice,
    active: bool,
}

impl<'a> SequenceGuard<'a> {
    fn init(device: &'a dyn PvcamDevice) -> AcqResult<Self> {
        device
            .init_sequence()
            .map_err(|source| AcquisitionError::Init {
                stage: InitStage::Sequence,
                source,
            })?;
        tracing::debug!("Sequence functions initialized");
        Ok(Self {
            device,
            active: true,
        })
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            match self.device.uninit_sequence() {
                Ok(()) => tracing::debug!("Sequence functions uninitialized"),
                Err(e) => tracing::error!(code = e.code, "Failed to uninitialize sequence: {}", e),
            }
        }
    }
}

impl Drop for SequenceGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

fn abort(device: &dyn PvcamDevice, handle: CameraHandle, frame: u16) {
    match device.abort(handle) {
        Ok(()) => tracing::warn!(frame, "Exposure aborted"),
        Err(e) => tracing::error!(frame, code = e.code, "Abort failed: {}", e),
    }
}

/// Drives acquisitions on one open camera.
pub struct SequenceController<'s> {
    session: &'s DeviceSession,
    buffers: FrameBufferManager,
    poll_policy: Option<PollPolicy>,
    cancel: CancelToken,
    sink: Box<dyn ImageSink + Send>,
    destination: PathBuf,
}

impl<'s> SequenceController<'s> {
    /// A controller writing images to `destination` with the native FITS writer.
    pub fn new(session: &'s DeviceSession, destination: impl AsRef<Path>) -> Self {
        Self {
            session,
            buffers: FrameBufferManager::new(),
            poll_policy: None,
            cancel: CancelToken::new(),
            sink: Box::new(FitsFile::new()),
            destination: destination.as_ref().to_path_buf(),
        }
    }

    /// Bound status polling. Defaults to the exposure time plus a readout margin.
    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = Some(policy);
        self
    }

    /// Observe `cancel` while polling.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the image writer.
    pub fn with_sink(mut self, sink: Box<dyn ImageSink + Send>) -> Self {
        self.sink = sink;
        self
    }

    /// Token that cancels the running acquisition.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Buffer accounting across every run of this controller.
    pub fn buffer_stats(&self) -> BufferStats {
        self.buffers.stats()
    }

    /// Where images are written.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Acquire `config.frame_count()` exposures of `region` and write the last one.
    pub fn run_acquisition(
        &mut self,
        config: ExposureConfig,
        region: RegionDescriptor,
    ) -> AcqResult<Frame> {
        let span = tracing::info_span!(
            "acquisition",
            camera = %self.session.camera_name(),
            region = %region,
            exposure_secs = config.exposure_secs(),
            frames = config.frame_count(),
        );
        let _enter = span.enter();

        let device = self.session.device();
        let handle = self.session.handle().ok_or_else(|| AcquisitionError::Config {
            reason: "no camera is open".into(),
            source: None,
        })?;

        let mut sequence = SequenceGuard::init(device)?;

        let setup = SequenceSetup {
            exposures: config.region_count(),
            region,
            mode: config.mode(),
            exposure: config.exposure(),
        };
        let byte_len = device
            .setup_sequence(handle, &setup)
            .map_err(|source| AcquisitionError::Config {
                reason: format!("pl_exp_setup_seq rejected region {}", region),
                source: Some(source),
            })?;
        if byte_len == 0 {
            return Err(AcquisitionError::Config {
                reason: "device reported a zero-length frame buffer".into(),
                source: None,
            });
        }
        tracing::info!(bytes = byte_len, "Sequence configured");

        let mut buffer = self.buffers.allocate(byte_len)?;
        let policy = self
            .poll_policy
            .unwrap_or_else(|| PollPolicy::for_exposure(config.exposure()));

        let total = config.frame_count();
        let mut bytes_arrived = 0;
        for frame in 1..=total {
            let remaining = total - frame;
            if self.cancel.is_cancelled() {
                tracing::warn!(frame, remaining, "Acquisition cancelled before exposure start");
                return Err(AcquisitionError::Cancelled { frame });
            }
            device
                .start_sequence(handle, buffer.samples_mut())
                .map_err(|source| AcquisitionError::Start { frame, source })?;
            tracing::debug!(frame, remaining, "Exposure started");

            let polled = match poll_until_terminal(device, handle, &policy, &self.cancel) {
                Ok(polled) => polled,
                Err(PollError::Timeout { attempts, elapsed }) => {
                    abort(device, handle, frame);
                    return Err(AcquisitionError::PollTimeout {
                        frame,
                        attempts,
                        elapsed,
                    });
                }
                Err(PollError::Cancelled { .. }) => {
                    abort(device, handle, frame);
                    return Err(AcquisitionError::Cancelled { frame });
                }
            };

            if polled.status == SequenceStatus::ReadoutFailed {
                tracing::error!(frame, remaining, "Readout failed");
                abort(device, handle, frame);
                return Err(AcquisitionError::ReadoutFailed {
                    frame,
                    remaining,
                    source: polled.fault,
                });
            }
            bytes_arrived = polled.bytes_arrived;
            tracing::info!(frame, remaining, polls = polled.attempts, "Readout complete");
        }

        device
            .finish_sequence(handle, buffer.samples_mut())
            .map_err(|source| AcquisitionError::Finalize { source })?;
        let completed_at = Utc::now();

        let metadata = ImageMetadata::from_acquisition(&region, &config);
        let encoded = fits::encode(
            self.sink.as_mut(),
            buffer.samples(),
            &metadata,
            &self.destination,
        )
        .map(|()| self.destination.clone());

        sequence.release();
        let pixels = self.buffers.release(buffer);

        Ok(Frame {
            pixels,
            metadata,
            frames_acquired: total,
            bytes_arrived,
            completed_at,
            encoded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{mock_pixel, MockCall, MockPvcam};
    use crate::error::DeviceError;
    #[cfg(feature = "storage_fits")]
    use crate::fits::read_fits;
    use crate::session::CameraSelector;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn session(mock: &Arc<MockPvcam>) -> DeviceSession {
        DeviceSession::open(mock.clone(), &CameraSelector::Index(0)).unwrap()
    }

    fn fast() -> PollPolicy {
        PollPolicy::unbounded().with_interval(Duration::ZERO)
    }

    fn small_region() -> RegionDescriptor {
        RegionDescriptor::new(0, 3, 1, 0, 3, 1).unwrap()
    }

    #[test]
    fn test_runs_exactly_frame_count_cycles() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new());
        let session = session(&mock);
        let mut controller =
            SequenceController::new(&session, dir.path().join("out.fits")).with_poll_policy(fast());

        let frame = controller
            .run_acquisition(ExposureConfig::new(0, 3).unwrap(), small_region())
            .unwrap();

        assert_eq!(frame.frames_acquired, 3);
        assert_eq!(mock.count(MockCall::StartSequence), 3);
        assert_eq!(mock.count(MockCall::FinishSequence), 1);
        assert_eq!(mock.count(MockCall::Abort), 0);
        assert_eq!(mock.count(MockCall::UninitSequence), 1);
        assert!(!mock.is_sequence_initialized());
        assert_eq!(frame.bytes_arrived, 32);
        assert_eq!(frame.pixels.len(), 16);
        assert_eq!(frame.pixels[5], mock_pixel(1, 1, 3));

        let stats = controller.buffer_stats();
        assert_eq!((stats.allocated, stats.released, stats.live), (1, 1, false));
    }

    #[cfg(feature = "storage_fits")]
    #[test]
    fn test_writes_fits_of_last_exposure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.fits");
        let mock = Arc::new(MockPvcam::new());
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, &path).with_poll_policy(fast());

        let frame = controller
            .run_acquisition(ExposureConfig::new(7, 2).unwrap(), small_region())
            .unwrap();
        assert_eq!(frame.encoded.as_deref().ok(), Some(path.as_path()));

        let image = read_fits(&path).unwrap();
        assert_eq!((image.width, image.height), (4, 4));
        assert_eq!(image.exposure_secs, Some(7));
        assert_eq!(image.pixels, frame.pixels);
    }

    #[test]
    fn test_readout_failure_stops_early_and_cleans_up() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new().fail_readout_on(2));
        let session = session(&mock);
        let mut controller =
            SequenceController::new(&session, dir.path().join("out.fits")).with_poll_policy(fast());

        let err = controller
            .run_acquisition(ExposureConfig::new(0, 5).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::ReadoutFailed {
                frame: 2,
                remaining: 3,
                source: None
            }
        ));
        assert_eq!(mock.count(MockCall::StartSequence), 2);
        assert_eq!(mock.count(MockCall::Abort), 1);
        assert_eq!(mock.count(MockCall::FinishSequence), 0);
        assert_eq!(mock.count(MockCall::UninitSequence), 1);
        assert!(!dir.path().join("out.fits").exists());

        let stats = controller.buffer_stats();
        assert_eq!((stats.allocated, stats.released, stats.live), (1, 1, false));
    }

    #[test]
    fn test_status_query_error_carries_device_code() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new().fail_status_query_on(1));
        let session = session(&mock);
        let mut controller =
            SequenceController::new(&session, dir.path().join("out.fits")).with_poll_policy(fast());
        let err = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::ReadoutFailed { frame: 1, remaining: 0, .. }));
        assert!(err.device_code().is_some());
    }

    #[test]
    fn test_poll_timeout_aborts() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new().never_complete());
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, dir.path().join("out.fits"))
            .with_poll_policy(fast().with_max_attempts(10));
        let err = controller
            .run_acquisition(ExposureConfig::new(0, 2).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::PollTimeout {
                frame: 1,
                attempts: 10,
                ..
            }
        ));
        assert_eq!(mock.count(MockCall::Abort), 1);
        assert!(!controller.buffer_stats().live);
    }

    #[test]
    fn test_cancelled_token_never_starts_exposure() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new().never_complete());
        let session = session(&mock);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut controller = SequenceController::new(&session, dir.path().join("out.fits"))
            .with_poll_policy(fast())
            .with_cancel_token(cancel);
        let err = controller
            .run_acquisition(ExposureConfig::new(0, 3).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Cancelled { frame: 1 }));
        assert_eq!(mock.count(MockCall::StartSequence), 0);
        assert_eq!(mock.count(MockCall::CheckStatus), 0);
        assert_eq!(mock.count(MockCall::Abort), 0);
        assert_eq!(mock.count(MockCall::UninitSequence), 1);
        let stats = controller.buffer_stats();
        assert_eq!((stats.allocated, stats.released, stats.live), (1, 1, false));
        assert!(!dir.path().join("out.fits").exists());
    }

    /// Sink that sets the cancel token when the first image is written.
    struct CancelOnCreate(CancelToken);

    impl ImageSink for CancelOnCreate {
        fn create(&mut self, _path: &Path) -> Result<(), EncodeError> {
            self.0.cancel();
            Ok(())
        }
        fn declare_image(&mut self, _w: u32, _h: u32, _bitpix: i16) -> Result<(), EncodeError> {
            Ok(())
        }
        fn write_keyword(&mut self, _n: &str, _v: i64, _c: &str) -> Result<(), EncodeError> {
            Ok(())
        }
        fn write_pixels(&mut self, _first: usize, _pixels: &[u16]) -> Result<(), EncodeError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), EncodeError> {
            Ok(())
        }
    }

    #[test]
    fn test_cancel_between_runs_stops_before_next_start() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new());
        let session = session(&mock);
        let cancel = CancelToken::new();
        let mut controller = SequenceController::new(&session, dir.path().join("out.fits"))
            .with_poll_policy(fast())
            .with_cancel_token(cancel.clone())
            .with_sink(Box::new(CancelOnCreate(cancel)));

        controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap();
        assert_eq!(mock.count(MockCall::StartSequence), 1);

        let err = controller
            .run_acquisition(ExposureConfig::new(0, 2).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Cancelled { frame: 1 }));
        assert_eq!(mock.count(MockCall::StartSequence), 1);
        assert_eq!(mock.count(MockCall::UninitSequence), 2);
    }

    #[test]
    fn test_setup_failure_skips_allocation() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(
            MockPvcam::new().failing(MockCall::SetupSequence, DeviceError::new(31, "bad region")),
        );
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, dir.path().join("out.fits"));
        let err = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Config { .. }));
        assert_eq!(err.device_code(), Some(31));
        assert_eq!(controller.buffer_stats().allocated, 0);
        assert_eq!(mock.count(MockCall::StartSequence), 0);
        assert_eq!(mock.count(MockCall::UninitSequence), 1);
    }

    #[test]
    fn test_zero_buffer_size_is_config_error() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new().with_buffer_bytes(0));
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, dir.path().join("out.fits"));
        let err = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Config { source: None, .. }));
        assert_eq!(controller.buffer_stats().allocated, 0);
    }

    #[test]
    fn test_sequence_init_failure() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(
            MockPvcam::new().failing(MockCall::InitSequence, DeviceError::new(9, "busy")),
        );
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, dir.path().join("out.fits"));
        let err = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::Init {
                stage: InitStage::Sequence,
                ..
            }
        ));
        assert_eq!(mock.count(MockCall::UninitSequence), 0);
    }

    #[test]
    fn test_finish_failure_releases_buffer_without_encoding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.fits");
        let mock = Arc::new(
            MockPvcam::new().failing(MockCall::FinishSequence, DeviceError::new(40, "finish")),
        );
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, &path).with_poll_policy(fast());
        let err = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Finalize { .. }));
        assert!(!path.exists());
        assert_eq!(controller.buffer_stats().released, 1);
    }

    #[test]
    fn test_encode_failure_is_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("out.fits");
        let mock = Arc::new(MockPvcam::new());
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, &path).with_poll_policy(fast());
        let frame = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap();
        assert!(frame.encoded.is_err());
        assert_eq!(mock.count(MockCall::UninitSequence), 1);
    }

    /// Sink that fails its first pixel write and counts discards.
    #[derive(Default)]
    struct FlakyDisk {
        writes: u32,
        open: bool,
        discards: Arc<AtomicU32>,
    }

    impl ImageSink for FlakyDisk {
        fn create(&mut self, _path: &Path) -> Result<(), EncodeError> {
            if self.open {
                return Err(EncodeError::State("previous image still open"));
            }
            self.open = true;
            Ok(())
        }
        fn declare_image(&mut self, _w: u32, _h: u32, _bitpix: i16) -> Result<(), EncodeError> {
            Ok(())
        }
        fn write_keyword(&mut self, _n: &str, _v: i64, _c: &str) -> Result<(), EncodeError> {
            Ok(())
        }
        fn write_pixels(&mut self, _first: usize, _pixels: &[u16]) -> Result<(), EncodeError> {
            self.writes += 1;
            if self.writes == 1 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            Ok(())
        }
        fn close(&mut self) -> Result<(), EncodeError> {
            self.open = false;
            Ok(())
        }
        fn discard(&mut self) {
            self.open = false;
            self.discards.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_failed_encode_does_not_poison_next_run() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new());
        let session = session(&mock);
        let sink = FlakyDisk::default();
        let discards = sink.discards.clone();
        let mut controller = SequenceController::new(&session, dir.path().join("out.fits"))
            .with_poll_policy(fast())
            .with_sink(Box::new(sink));

        let first = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap();
        assert!(matches!(first.encoded, Err(EncodeError::Io(_))));
        assert_eq!(discards.load(Ordering::SeqCst), 1);

        let second = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap();
        assert!(second.encoded.is_ok());
        assert_eq!(discards.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_device_buffer_is_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockPvcam::new().with_buffer_bytes(40));
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, dir.path().join("out.fits"))
            .with_poll_policy(fast());
        let frame = controller
            .run_acquisition(ExposureConfig::new(0, 1).unwrap(), small_region())
            .unwrap();
        assert!(matches!(
            frame.encoded,
            Err(EncodeError::DimensionMismatch { actual: 20, .. })
        ));
    }

    #[cfg(feature = "storage_fits")]
    #[test]
    fn test_full_chip_ten_second_exposure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pixis.fits");
        let mock = Arc::new(MockPvcam::new());
        let session = session(&mock);
        let mut controller = SequenceController::new(&session, &path).with_poll_policy(fast());

        let region = RegionDescriptor::full_frame(2048, 2048).unwrap();
        let frame = controller
            .run_acquisition(ExposureConfig::new(10, 1).unwrap(), region)
            .unwrap();
        assert_eq!(frame.pixels.len(), 2048 * 2048);
        assert_eq!(frame.bytes_arrived, 2048 * 2048 * 2);
        assert_eq!(controller.buffer_stats().allocated, 1);
        assert_eq!(mock.count(MockCall::StartSequence), 1);

        let image = read_fits(&path).unwrap();
        assert_eq!((image.width, image.height), (2048, 2048));
        assert_eq!(image.exposure_secs, Some(10));
        assert_eq!(image.pixels[2048 + 3], mock_pixel(3, 1, 1));
    }
}
