//! Camera session lifecycle.
//!
//! A [`DeviceSession`] owns the PVCAM library initialisation and one open
//! camera. Dropping the session closes the camera and uninitialises the
//! library, including when opening failed part way through.

use std::sync::Arc;

use crate::device::{CameraHandle, PvcamDevice};
use crate::error::{AcqResult, AcquisitionError, InitStage};

/// Which camera to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraSelector {
    /// Look the name up with `pl_cam_get_name(index)`. Index 0 is the first camera.
    Index(i16),
    /// Open this name directly.
    Name(String),
}

impl Default for CameraSelector {
    fn default() -> Self {
        CameraSelector::Index(0)
    }
}

/// An initialised library plus an exclusively opened camera.
pub struct DeviceSession {
    device: Arc<dyn PvcamDevice>,
    handle: Option<CameraHandle>,
    name: String,
    library_initialized: bool,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .finish()
    }
}

impl DeviceSession {
    /// Initialise the library and open the selected camera.
    pub fn open(device: Arc<dyn PvcamDevice>, selector: &CameraSelector) -> AcqResult<Self> {
        let mut session = Self::initialize(device)?;

        let name = match selector {
            CameraSelector::Name(name) => name.clone(),
            CameraSelector::Index(index) => session.lookup_name(*index)?,
        };

        let handle = session
            .device
            .open_camera(&name)
            .map_err(|source| AcquisitionError::Open {
                name: name.clone(),
                source,
            })?;
        tracing::info!(camera = %name, handle = handle.0, "Camera opened");

        session.handle = Some(handle);
        session.name = name;
        Ok(session)
    }

    /// Initialise the library without opening a camera.
    ///
    /// Useful for checking the installation; the library is uninitialised when
    /// the returned session is dropped.
    pub fn initialize(device: Arc<dyn PvcamDevice>) -> AcqResult<Self> {
        device
            .init_library()
            .map_err(|source| AcquisitionError::Init {
                stage: InitStage::Library,
                source,
            })?;
        tracing::info!("PVCAM library initialized");
        Ok(Self {
            device,
            handle: None,
            name: String::new(),
            library_initialized: true,
        })
    }

    /// Name of camera `index`, via `pl_cam_get_name`.
    pub fn lookup_name(&self, index: i16) -> AcqResult<String> {
        let name = self
            .device
            .camera_name(index)
            .map_err(|source| AcquisitionError::DeviceName { index, source })?;
        tracing::info!(index, camera = %name, "Camera found");
        Ok(name)
    }

    /// The device this session drives.
    pub fn device(&self) -> &dyn PvcamDevice {
        self.device.as_ref()
    }

    /// Handle of the open camera, if one is open.
    pub fn handle(&self) -> Option<CameraHandle> {
        self.handle
    }

    /// Name of the open camera (empty until a camera is opened).
    pub fn camera_name(&self) -> &str {
        &self.name
    }

    /// Close the camera and uninitialise the library now.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            match self.device.close_camera(handle) {
                Ok(()) => tracing::info!(camera = %self.name, "Camera closed"),
                Err(e) => tracing::error!(camera = %self.name, code = e.code, "Failed to close camera: {}", e),
            }
        }
        if self.library_initialized {
            self.library_initialized = false;
            match self.device.uninit_library() {
                Ok(()) => tracing::info!("PVCAM library uninitialized"),
                Err(e) => tracing::error!(code = e.code, "Failed to uninitialize PVCAM: {}", e),
            }
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
