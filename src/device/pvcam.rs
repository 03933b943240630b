//! PVCAM SDK backend.
//!
//! Thin safe wrapper over the `pl_*` functions exposed by `pvcam-sys`. Every
//! call that returns `rs_bool` FALSE is turned into a [`DeviceError`] built from
//! `pl_error_code` and `pl_error_message`.

#![allow(unsafe_code)]

use std::ffi::{c_char, c_void, CStr, CString};

use pvcam_sys::*;

use super::{CameraHandle, PvcamDevice, SequenceSetup, StatusReport};
use crate::error::DeviceError;
use crate::region::TimingMode;

/// Capture the library's last error.
fn last_error() -> DeviceError {
    unsafe {
        let code = pl_error_code();
        let mut msg = vec![0 as c_char; ERROR_MSG_LEN as usize + 1];
        pl_error_message(code, msg.as_mut_ptr());
        let message = CStr::from_ptr(msg.as_ptr()).to_string_lossy().into_owned();
        DeviceError::new(code, message)
    }
}

/// Map an `rs_bool` result to `Result`.
fn check(ok: rs_bool) -> Result<(), DeviceError> {
    if ok == 0 {
        Err(last_error())
    } else {
        Ok(())
    }
}

fn exposure_mode(mode: TimingMode) -> int16 {
    match mode {
        TimingMode::Timed => TIMED_MODE as int16,
    }
}

/// The PVCAM library as installed on this host.
///
/// The library keeps process-wide state; create at most one of these and drive
/// it through a single `DeviceSession`.
#[derive(Debug, Default)]
pub struct PvcamSdk;

impl PvcamSdk {
    /// Create a handle to the system PVCAM library.
    pub fn new() -> Self {
        Self
    }
}

impl PvcamDevice for PvcamSdk {
    fn init_library(&self) -> Result<(), DeviceError> {
        check(unsafe { pl_pvcam_init() })
    }

    fn uninit_library(&self) -> Result<(), DeviceError> {
        check(unsafe { pl_pvcam_uninit() })
    }

    fn camera_name(&self, index: i16) -> Result<String, DeviceError> {
        let mut name = vec![0 as c_char; CAM_NAME_LEN as usize];
        check(unsafe { pl_cam_get_name(index, name.as_mut_ptr()) })?;
        let name = unsafe { CStr::from_ptr(name.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    fn open_camera(&self, name: &str) -> Result<CameraHandle, DeviceError> {
        let c_name = CString::new(name)
            .map_err(|_| DeviceError::new(-1, format!("camera name '{}' contains NUL", name)))?;
        let mut hcam: int16 = -1;
        check(unsafe {
            pl_cam_open(
                c_name.as_ptr() as *mut c_char,
                &mut hcam,
                OPEN_EXCLUSIVE as int16,
            )
        })?;
        Ok(CameraHandle(hcam))
    }

    fn close_camera(&self, handle: CameraHandle) -> Result<(), DeviceError> {
        check(unsafe { pl_cam_close(handle.0) })
    }

    fn init_sequence(&self) -> Result<(), DeviceError> {
        check(unsafe { pl_exp_init_seq() })
    }

    fn uninit_sequence(&self) -> Result<(), DeviceError> {
        check(unsafe { pl_exp_uninit_seq() })
    }

    fn setup_sequence(
        &self,
        handle: CameraHandle,
        setup: &SequenceSetup,
    ) -> Result<u32, DeviceError> {
        let r = setup.region;
        let region = rgn_type {
            s1: r.s1(),
            s2: r.s2(),
            sbin: r.sbin(),
            p1: r.p1(),
            p2: r.p2(),
            pbin: r.pbin(),
        };
        // Default PARAM_EXP_RES is one millisecond.
        let exposure_ms = u32::try_from(setup.exposure.as_millis()).unwrap_or(u32::MAX);
        let mut bytes: uns32 = 0;
        check(unsafe {
            pl_exp_setup_seq(
                handle.0,
                setup.exposures,
                1,
                &region,
                exposure_mode(setup.mode),
                exposure_ms,
                &mut bytes,
            )
        })?;
        Ok(bytes)
    }

    fn start_sequence(
        &self,
        handle: CameraHandle,
        buffer: &mut [u16],
    ) -> Result<(), DeviceError> {
        // SAFETY: the SDK writes into `buffer` asynchronously until finish/abort.
        // The acquisition controller keeps the buffer allocated and unmoved for
        // that whole window.
        check(unsafe { pl_exp_start_seq(handle.0, buffer.as_mut_ptr() as *mut c_void) })
    }

    fn check_status(&self, handle: CameraHandle) -> Result<StatusReport, DeviceError> {
        let mut status: int16 = 0;
        let mut bytes_arrived: uns32 = 0;
        check(unsafe { pl_exp_check_status(handle.0, &mut status, &mut bytes_arrived) })?;
        Ok(StatusReport {
            raw: status,
            bytes_arrived,
        })
    }

    fn finish_sequence(
        &self,
        handle: CameraHandle,
        buffer: &mut [u16],
    ) -> Result<(), DeviceError> {
        // No image buffer handle: the pixel stream stays in `buffer` as-is.
        check(unsafe { pl_exp_finish_seq(handle.0, buffer.as_mut_ptr() as *mut c_void, 0) })
    }

    fn abort(&self, handle: CameraHandle) -> Result<(), DeviceError> {
        check(unsafe { pl_exp_abort(handle.0, CCS_HALT as int16) })
    }
}
