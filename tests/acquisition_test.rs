//! End-to-end acquisitions against the simulated camera.

use std::sync::Arc;
use std::time::Duration;

use pixis_capture::acquisition::{CancelToken, PollPolicy, SequenceController};
use pixis_capture::config::CaptureConfig;
use pixis_capture::device::mock::{mock_pixel, MockCall, MockPvcam};
use pixis_capture::error::{AcquisitionError, DeviceError, EncodeError};
#[cfg(feature = "storage_fits")]
use pixis_capture::fits::read_fits;
use pixis_capture::fits::ImageSink;
use pixis_capture::region::{ExposureConfig, RegionDescriptor};
use pixis_capture::session::{CameraSelector, DeviceSession};
use tempfile::tempdir;
use tracing_test::traced_test;

fn fast() -> PollPolicy {
    PollPolicy::unbounded().with_interval(Duration::ZERO)
}

#[cfg(feature = "storage_fits")]
#[test]
fn test_default_configuration_produces_full_chip_image() {
    let dir = tempdir().unwrap();
    let mut config = CaptureConfig::default();
    config.output.path = dir.path().join("testfile.fits");

    let mock = Arc::new(MockPvcam::new());
    let session = DeviceSession::open(mock.clone(), &config.camera_selector()).unwrap();
    let mut controller =
        SequenceController::new(&session, &config.output.path).with_poll_policy(fast());
    let frame = controller
        .run_acquisition(
            config.exposure_config().unwrap(),
            config.region_descriptor().unwrap(),
        )
        .unwrap();
    drop(controller);
    session.close();

    let image = read_fits(&config.output.path).unwrap();
    assert_eq!((image.width, image.height), (2048, 2048));
    assert_eq!(image.exposure_secs, Some(10));
    assert_eq!(image.pixels, frame.pixels);

    let calls = mock.calls();
    let first = |c: MockCall| calls.iter().position(|x| *x == c).unwrap();
    assert!(first(MockCall::InitLibrary) < first(MockCall::OpenCamera));
    assert!(first(MockCall::InitSequence) < first(MockCall::SetupSequence));
    assert!(first(MockCall::SetupSequence) < first(MockCall::StartSequence));
    assert!(first(MockCall::FinishSequence) < first(MockCall::UninitSequence));
    assert_eq!(calls.last(), Some(&MockCall::UninitLibrary));
    assert!(!mock.is_library_initialized());
}

#[cfg(feature = "storage_fits")]
#[test]
fn test_binned_region_image_dimensions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("binned.fits");
    let mock = Arc::new(MockPvcam::new());
    let session = DeviceSession::open(mock, &CameraSelector::Index(0)).unwrap();
    let mut controller = SequenceController::new(&session, &path).with_poll_policy(fast());

    let region = RegionDescriptor::new(0, 9, 2, 0, 5, 3).unwrap();
    let frame = controller
        .run_acquisition(ExposureConfig::new(1, 1).unwrap(), region)
        .unwrap();
    assert_eq!((frame.metadata.width, frame.metadata.height), (5, 2));

    let image = read_fits(&path).unwrap();
    assert_eq!(image.pixels.len(), 10);
    assert_eq!(image.pixels[6], mock_pixel(1, 1, 1));
}

#[test]
fn test_repeated_runs_release_every_buffer() {
    let dir = tempdir().unwrap();
    let mock = Arc::new(MockPvcam::new().fail_readout_on(3));
    let session = DeviceSession::open(mock.clone(), &CameraSelector::Index(0)).unwrap();
    let mut controller =
        SequenceController::new(&session, dir.path().join("run.fits")).with_poll_policy(fast());
    let region = RegionDescriptor::new(0, 7, 1, 0, 7, 1).unwrap();

    // Exposures are counted across runs: the first run uses 1-2, the second hits 3.
    controller
        .run_acquisition(ExposureConfig::new(0, 2).unwrap(), region)
        .unwrap();
    let err = controller
        .run_acquisition(ExposureConfig::new(0, 2).unwrap(), region)
        .unwrap_err();
    assert!(matches!(
        err,
        AcquisitionError::ReadoutFailed {
            frame: 1,
            remaining: 1,
            ..
        }
    ));

    let stats = controller.buffer_stats();
    assert_eq!((stats.allocated, stats.released, stats.live), (2, 2, false));
    assert_eq!(mock.count(MockCall::InitSequence), 2);
    assert_eq!(mock.count(MockCall::UninitSequence), 2);
}

#[test]
fn test_cancel_from_another_thread() {
    let dir = tempdir().unwrap();
    let mock = Arc::new(MockPvcam::new().never_complete());
    let session = DeviceSession::open(mock.clone(), &CameraSelector::Index(0)).unwrap();
    let cancel = CancelToken::new();
    let mut controller = SequenceController::new(&session, dir.path().join("c.fits"))
        .with_poll_policy(PollPolicy::unbounded().with_interval(Duration::from_millis(1)))
        .with_cancel_token(cancel.clone());

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
    });
    let err = controller
        .run_acquisition(
            ExposureConfig::new(0, 1).unwrap(),
            RegionDescriptor::full_frame(4, 4).unwrap(),
        )
        .unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, AcquisitionError::Cancelled { frame: 1 }));
    assert_eq!(mock.count(MockCall::Abort), 1);
    assert!(!mock.is_sequence_initialized());
}

/// Sink whose file can never be created.
struct ReadOnlyDisk;

impl ImageSink for ReadOnlyDisk {
    fn create(&mut self, _path: &std::path::Path) -> Result<(), EncodeError> {
        Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
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
#[traced_test]
fn test_sink_failure_is_logged_and_returned_with_frame() {
    let mock = Arc::new(MockPvcam::new());
    let session = DeviceSession::open(mock, &CameraSelector::Index(0)).unwrap();
    let mut controller = SequenceController::new(&session, "unused.fits")
        .with_poll_policy(fast())
        .with_sink(Box::new(ReadOnlyDisk));

    let frame = controller
        .run_acquisition(
            ExposureConfig::new(0, 1).unwrap(),
            RegionDescriptor::full_frame(2, 2).unwrap(),
        )
        .unwrap();
    assert!(matches!(frame.encoded, Err(EncodeError::Io(_))));
    assert_eq!(frame.pixels.len(), 4);
    assert!(logs_contain("FITS encoding failed"));
}

#[cfg(feature = "storage_fits")]
#[test]
#[traced_test]
fn test_unwritable_destination_then_recovery() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("not-yet").join("frame.fits");
    let mock = Arc::new(MockPvcam::new());
    let session = DeviceSession::open(mock, &CameraSelector::Index(0)).unwrap();
    let mut controller = SequenceController::new(&session, &missing).with_poll_policy(fast());
    let region = RegionDescriptor::full_frame(3, 2).unwrap();

    let frame = controller
        .run_acquisition(ExposureConfig::new(2, 1).unwrap(), region)
        .unwrap();
    assert!(frame.encoded.is_err());
    assert!(logs_contain("FITS encoding failed"));

    std::fs::create_dir(dir.path().join("not-yet")).unwrap();
    let frame = controller
        .run_acquisition(ExposureConfig::new(2, 1).unwrap(), region)
        .unwrap();
    assert_eq!(frame.encoded.unwrap(), missing);
    let image = read_fits(&missing).unwrap();
    assert_eq!((image.width, image.height), (3, 2));
    assert_eq!(image.exposure_secs, Some(2));
    assert_eq!(image.pixels, frame.pixels);
}

#[test]
#[traced_test]
fn test_readout_failure_is_logged_with_frame() {
    let dir = tempdir().unwrap();
    let mock = Arc::new(MockPvcam::new().fail_readout_on(1));
    let session = DeviceSession::open(mock, &CameraSelector::Index(0)).unwrap();
    let mut controller =
        SequenceController::new(&session, dir.path().join("f.fits")).with_poll_policy(fast());
    let err = controller
        .run_acquisition(
            ExposureConfig::new(0, 1).unwrap(),
            RegionDescriptor::full_frame(2, 2).unwrap(),
        )
        .unwrap_err();
    assert!(matches!(err, AcquisitionError::ReadoutFailed { .. }));
    assert!(logs_contain("Readout failed"));
    assert!(logs_contain("Exposure aborted"));
    assert!(!dir.path().join("f.fits").exists());
    assert_eq!(controller.buffer_stats().released, 1);
}

#[test]
fn test_start_failure_keeps_cleanup() {
    let dir = tempdir().unwrap();
    let mock = Arc::new(
        MockPvcam::new().failing(MockCall::StartSequence, DeviceError::new(77, "not ready")),
    );
    let session = DeviceSession::open(mock.clone(), &CameraSelector::Index(0)).unwrap();
    let mut controller = SequenceController::new(&session, dir.path().join("s.fits"));
    let err = controller
        .run_acquisition(
            ExposureConfig::new(0, 3).unwrap(),
            RegionDescriptor::full_frame(2, 2).unwrap(),
        )
        .unwrap_err();
    assert!(matches!(err, AcquisitionError::Start { frame: 1, .. }));
    assert_eq!(err.device_code(), Some(77));
    assert_eq!(mock.count(MockCall::StartSequence), 1);
    assert_eq!(mock.count(MockCall::UninitSequence), 1);
    assert!(!controller.buffer_stats().live);
}
