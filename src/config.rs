//! Capture configuration using Figment.
//!
//! Configuration is layered, later sources winning:
//! 1. Built-in defaults (full 2048x2048 chip, 10 s, one frame, `testfile.fits`)
//! 2. A TOML file, usually `config/capture.toml`
//! 3. Environment variables prefixed with `PIXIS_`, nested with `__`
//!
//! ```text
//! PIXIS_APPLICATION__LOG_LEVEL=debug
//! PIXIS_EXPOSURE__SECONDS=30
//! PIXIS_OUTPUT__PATH=/data/dark.fits
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::acquisition::PollPolicy;
use crate::region::{ExposureConfig, RegionDescriptor, TimingMode};
use crate::session::CameraSelector;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/capture.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PIXIS_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or did not match the schema.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level capture configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CaptureConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Which camera to open
    pub camera: CameraConfig,
    /// Readout region
    pub region: RegionConfig,
    /// Exposure timing
    pub exposure: ExposureSection,
    /// Status polling bounds
    pub poll: PollConfig,
    /// Image output
    pub output: OutputConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "pixis-capture".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Camera selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CameraConfig {
    /// Index passed to `pl_cam_get_name`.
    pub index: i16,
    /// Open this camera by name instead of looking it up by index.
    pub name: Option<String>,
}

/// Region of interest in sensor pixels, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// First serial pixel.
    pub s1: u16,
    /// Last serial pixel.
    pub s2: u16,
    /// Serial binning.
    pub sbin: u16,
    /// First parallel pixel.
    pub p1: u16,
    /// Last parallel pixel.
    pub p2: u16,
    /// Parallel binning.
    pub pbin: u16,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            s1: 0,
            s2: 2047,
            sbin: 1,
            p1: 0,
            p2: 2047,
            pbin: 1,
        }
    }
}

/// Exposure timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureSection {
    /// Exposure time in seconds.
    pub seconds: u32,
    /// Start/poll cycles per acquisition.
    pub frames: u16,
    /// Timing mode.
    pub mode: TimingMode,
}

impl Default for ExposureSection {
    fn default() -> Self {
        Self {
            seconds: 10,
            frames: 1,
            mode: TimingMode::Timed,
        }
    }
}

/// Status polling bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Sleep between status queries, in milliseconds.
    pub interval_ms: u64,
    /// Give up after this many queries.
    pub max_attempts: Option<u32>,
    /// Give up after this many seconds. Unset means exposure time plus readout margin.
    pub timeout_secs: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10,
            max_attempts: None,
            timeout_secs: None,
        }
    }
}

/// Image output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// FITS file to write. Overwritten if it exists.
    pub path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("testfile.fits"),
        }
    }
}

impl CaptureConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`]
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or the result is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_env(path.as_ref(), ENV_PREFIX)
    }

    fn load_with_env(path: &Path, prefix: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(prefix).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.camera.index < 0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid camera index {}. Must be 0 or greater",
                self.camera.index
            )));
        }

        self.region_descriptor()?;
        self.exposure_config()?;

        if self.poll.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.poll.max_attempts == Some(0) {
            return Err(ConfigError::ValidationError(
                "poll.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.output.path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "output.path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured camera.
    pub fn camera_selector(&self) -> CameraSelector {
        match &self.camera.name {
            Some(name) => CameraSelector::Name(name.clone()),
            None => CameraSelector::Index(self.camera.index),
        }
    }

    /// The configured region as a validated descriptor.
    pub fn region_descriptor(&self) -> Result<RegionDescriptor, ConfigError> {
        let r = &self.region;
        RegionDescriptor::new(r.s1, r.s2, r.sbin, r.p1, r.p2, r.pbin)
            .map_err(|e| ConfigError::ValidationError(format!("Invalid region: {}", e)))
    }

    /// The configured exposure.
    pub fn exposure_config(&self) -> Result<ExposureConfig, ConfigError> {
        ExposureConfig::new(self.exposure.seconds, self.exposure.frames)
            .map_err(|e| ConfigError::ValidationError(format!("Invalid exposure: {}", e)))
    }

    /// Polling bounds for the configured exposure.
    pub fn poll_policy(&self) -> PollPolicy {
        let exposure = Duration::from_secs(u64::from(self.exposure.seconds));
        let mut policy = match self.poll.timeout_secs {
            Some(secs) => PollPolicy::unbounded().with_timeout(Duration::from_secs(secs)),
            None => PollPolicy::for_exposure(exposure),
        };
        policy = policy.with_interval(Duration::from_millis(self.poll.interval_ms));
        if let Some(max) = self.poll.max_attempts {
            policy = policy.with_max_attempts(max);
        }
        policy
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
