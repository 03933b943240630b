//! Region of interest and exposure parameters for one acquisition run.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of regions per sequence. Multiple regions are not supported.
pub const REGION_COUNT: u16 = 1;

/// Bit depth of every frame the camera produces.
pub const BITS_PER_PIXEL: u8 = 16;

/// Invalid region or exposure parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParameterError {
    /// `start > end` on one axis.
    #[error("{axis} start {start} is past end {end}")]
    InvertedAxis {
        /// Offending axis.
        axis: Axis,
        /// First pixel.
        start: u16,
        /// Last pixel.
        end: u16,
    },

    /// Binning factor of 0.
    #[error("{axis} binning must be at least 1")]
    ZeroBinning {
        /// Offending axis.
        axis: Axis,
    },

    /// Binning wider than the region on that axis.
    #[error("{axis} binning {binning} exceeds the {extent} pixel extent")]
    BinningTooLarge {
        /// Offending axis.
        axis: Axis,
        /// Requested factor.
        binning: u16,
        /// Region extent in unbinned pixels.
        extent: u32,
    },

    /// Zero exposures requested.
    #[error("frame count must be at least 1")]
    ZeroFrames,
}

/// Sensor axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Serial register (columns).
    Serial,
    /// Parallel register (rows).
    Parallel,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Serial => write!(f, "serial"),
            Axis::Parallel => write!(f, "parallel"),
        }
    }
}

/// Sensor region read out during an exposure, in unbinned pixel indices.
///
/// Field names follow PVCAM's `rgn_type`: `s` is the serial axis, `p` the
/// parallel axis. Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    s1: u16,
    s2: u16,
    sbin: u16,
    p1: u16,
    p2: u16,
    pbin: u16,
}

impl RegionDescriptor {
    /// Build a region, checking `start <= end` and `1 <= binning <= extent` on both axes.
    pub fn new(
        s1: u16,
        s2: u16,
        sbin: u16,
        p1: u16,
        p2: u16,
        pbin: u16,
    ) -> Result<Self, ParameterError> {
        check_axis(Axis::Serial, s1, s2, sbin)?;
        check_axis(Axis::Parallel, p1, p2, pbin)?;
        Ok(Self {
            s1,
            s2,
            sbin,
            p1,
            p2,
            pbin,
        })
    }

    /// Unbinned full-chip region of a `width` x `height` sensor.
    pub fn full_frame(width: u16, height: u16) -> Result<Self, ParameterError> {
        Self::new(
            0,
            width.saturating_sub(1),
            1,
            0,
            height.saturating_sub(1),
            1,
        )
    }

    /// Serial start pixel.
    pub fn s1(&self) -> u16 {
        self.s1
    }
    /// Serial end pixel (inclusive).
    pub fn s2(&self) -> u16 {
        self.s2
    }
    /// Serial binning factor.
    pub fn sbin(&self) -> u16 {
        self.sbin
    }
    /// Parallel start pixel.
    pub fn p1(&self) -> u16 {
        self.p1
    }
    /// Parallel end pixel (inclusive).
    pub fn p2(&self) -> u16 {
        self.p2
    }
    /// Parallel binning factor.
    pub fn pbin(&self) -> u16 {
        self.pbin
    }

    /// Binned image width. Partial bins at the edge are dropped, as the sensor does.
    pub fn width(&self) -> u32 {
        (u32::from(self.s2) - u32::from(self.s1) + 1) / u32::from(self.sbin)
    }

    /// Binned image height.
    pub fn height(&self) -> u32 {
        (u32::from(self.p2) - u32::from(self.p1) + 1) / u32::from(self.pbin)
    }

    /// Number of samples in one binned frame.
    pub fn pixel_count(&self) -> usize {
        self.width() as usize * self.height() as usize
    }
}

impl fmt::Display for RegionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..={} /{}] x [{}..={} /{}]",
            self.s1, self.s2, self.sbin, self.p1, self.p2, self.pbin
        )
    }
}

fn check_axis(axis: Axis, start: u16, end: u16, binning: u16) -> Result<(), ParameterError> {
    if start > end {
        return Err(ParameterError::InvertedAxis { axis, start, end });
    }
    if binning == 0 {
        return Err(ParameterError::ZeroBinning { axis });
    }
    let extent = u32::from(end) - u32::from(start) + 1;
    if u32::from(binning) > extent {
        return Err(ParameterError::BinningTooLarge {
            axis,
            binning,
            extent,
        });
    }
    Ok(())
}

/// How the camera times each exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    /// Software starts the exposure and the camera times it internally (`TIMED_MODE`).
    #[default]
    Timed,
}

/// Exposure parameters for one acquisition run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureConfig {
    exposure_secs: u32,
    frame_count: u16,
    mode: TimingMode,
}

impl ExposureConfig {
    /// Timed exposures of `exposure_secs` seconds, repeated `frame_count` times.
    pub fn new(exposure_secs: u32, frame_count: u16) -> Result<Self, ParameterError> {
        if frame_count == 0 {
            return Err(ParameterError::ZeroFrames);
        }
        Ok(Self {
            exposure_secs,
            frame_count,
            mode: TimingMode::Timed,
        })
    }

    /// Always [`REGION_COUNT`].
    pub fn region_count(&self) -> u16 {
        REGION_COUNT
    }

    /// Exposure duration in whole seconds.
    pub fn exposure_secs(&self) -> u32 {
        self.exposure_secs
    }

    /// Exposure duration.
    pub fn exposure(&self) -> Duration {
        Duration::from_secs(u64::from(self.exposure_secs))
    }

    /// Number of start/poll cycles to run.
    pub fn frame_count(&self) -> u16 {
        self.frame_count
    }

    /// Timing mode.
    pub fn mode(&self) -> TimingMode {
        self.mode
    }
}

/// Header information for one completed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Binned image width.
    pub width: u32,
    /// Binned image height.
    pub height: u32,
    /// Always [`BITS_PER_PIXEL`].
    pub bits_per_pixel: u8,
    /// Value of the `EXPOSURE` keyword, in seconds.
    pub exposure_secs: u32,
}

impl ImageMetadata {
    /// Derive the metadata for a frame taken with `region` and `config`.
    pub fn from_acquisition(region: &RegionDescriptor, config: &ExposureConfig) -> Self {
        Self {
            width: region.width(),
            height: region.height(),
            bits_per_pixel: BITS_PER_PIXEL,
            exposure_secs: config.exposure_secs(),
        }
    }

    /// `width * height`
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_chip_dimensions() {
        let region = RegionDescriptor::new(0, 2047, 1, 0, 2047, 1).unwrap();
        assert_eq!(region.width(), 2048);
        assert_eq!(region.height(), 2048);
        assert_eq!(region.pixel_count(), 2048 * 2048);
    }

    #[test]
    fn test_binned_dimensions_drop_partial_bins() {
        let region = RegionDescriptor::new(10, 19, 3, 0, 7, 2).unwrap();
        assert_eq!(region.width(), 3);
        assert_eq!(region.height(), 4);
    }

    #[test]
    fn test_single_pixel_region() {
        let region = RegionDescriptor::new(5, 5, 1, 9, 9, 1).unwrap();
        assert_eq!((region.width(), region.height()), (1, 1));
    }

    #[test]
    fn test_region_rejects_inverted_axis() {
        let err = RegionDescriptor::new(100, 99, 1, 0, 10, 1).unwrap_err();
        assert_eq!(
            err,
            ParameterError::InvertedAxis {
                axis: Axis::Serial,
                start: 100,
                end: 99
            }
        );
    }

    #[test]
    fn test_region_rejects_zero_and_oversized_binning() {
        assert_eq!(
            RegionDescriptor::new(0, 10, 1, 0, 10, 0).unwrap_err(),
            ParameterError::ZeroBinning {
                axis: Axis::Parallel
            }
        );
        assert!(matches!(
            RegionDescriptor::new(0, 3, 5, 0, 10, 1),
            Err(ParameterError::BinningTooLarge { .. })
        ));
    }

    #[test]
    fn test_full_frame_helper() {
        let region = RegionDescriptor::full_frame(512, 256).unwrap();
        assert_eq!(region.s2(), 511);
        assert_eq!(region.p2(), 255);
    }

    #[test]
    fn test_exposure_config() {
        let config = ExposureConfig::new(10, 1).unwrap();
        assert_eq!(config.region_count(), 1);
        assert_eq!(config.exposure(), Duration::from_secs(10));
        assert_eq!(config.mode(), TimingMode::Timed);
        assert_eq!(ExposureConfig::new(10, 0), Err(ParameterError::ZeroFrames));
    }

    #[test]
    fn test_metadata_from_acquisition() {
        let region = RegionDescriptor::new(0, 3, 1, 0, 3, 1).unwrap();
        let config = ExposureConfig::new(10, 1).unwrap();
        let meta = ImageMetadata::from_acquisition(&region, &config);
        assert_eq!(meta.width, 4);
        assert_eq!(meta.height, 4);
        assert_eq!(meta.bits_per_pixel, 16);
        assert_eq!(meta.exposure_secs, 10);
        assert_eq!(meta.pixel_count(), 16);
    }
}
