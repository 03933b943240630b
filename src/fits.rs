//! FITS image output.
//!
//! [`ImageSink`] is the file-level contract the encoder drives: create, declare
//! the image, write header keywords, write pixels, close. [`FitsFile`] writes
//! through CFITSIO (the `fitsio` crate, feature `storage_fits`). Camera samples are
//! declared as unsigned shorts, which CFITSIO stores as `BITPIX = 16` with
//! `BZERO = 32768` so they round-trip exactly.
//!
//! [`encode`] is the single entry point used by the acquisition controller.
//! A failed encode discards the partial file and leaves the sink reusable.

use std::path::Path;

use crate::error::EncodeError;
use crate::region::ImageMetadata;

/// `BITPIX` for 16-bit integer pixels.
pub const BITPIX_SHORT: i16 = 16;
/// Header keyword carrying the exposure duration in seconds.
pub const EXPOSURE_KEYWORD: &str = "EXPOSURE";

#[cfg_attr(not(feature = "storage_fits"), allow(dead_code))]
const STRUCTURAL_KEYWORDS: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "EXTEND", "BZERO", "BSCALE", "END",
];

/// Destination for an encoded image.
///
/// Calls must be made in order: `create`, `declare_image`, any number of
/// `write_keyword`, `write_pixels`, `close`. Calling `create` again starts over.
pub trait ImageSink {
    /// Target the file at `path`, replacing it if it exists.
    fn create(&mut self, path: &Path) -> Result<(), EncodeError>;

    /// Declare a 2-D image of `width` x `height` pixels with `bitpix` bits.
    fn declare_image(&mut self, width: u32, height: u32, bitpix: i16) -> Result<(), EncodeError>;

    /// Add an integer header keyword.
    fn write_keyword(&mut self, name: &str, value: i64, comment: &str)
        -> Result<(), EncodeError>;

    /// Write `pixels` starting at element `first` (0-based, row-major).
    fn write_pixels(&mut self, first: usize, pixels: &[u16]) -> Result<(), EncodeError>;

    /// Finish the file.
    fn close(&mut self) -> Result<(), EncodeError>;

    /// Abandon the file in progress, removing anything partially written.
    fn discard(&mut self) {}
}

/// Persist `pixels` as a FITS image at `destination` with one `EXPOSURE` keyword.
///
/// The payload must hold exactly `width * height` samples; otherwise nothing is
/// written. Failures are logged before being returned.
pub fn encode(
    sink: &mut dyn ImageSink,
    pixels: &[u16],
    metadata: &ImageMetadata,
    destination: &Path,
) -> Result<(), EncodeError> {
    if pixels.len() != metadata.pixel_count() {
        let err = EncodeError::DimensionMismatch {
            width: metadata.width,
            height: metadata.height,
            actual: pixels.len(),
        };
        tracing::error!(path = %destination.display(), "FITS encoding rejected: {}", err);
        return Err(err);
    }

    let result = (|| {
        sink.create(destination)?;
        sink.declare_image(metadata.width, metadata.height, BITPIX_SHORT)?;
        sink.write_keyword(
            EXPOSURE_KEYWORD,
            i64::from(metadata.exposure_secs),
            "Total Exposure Time",
        )?;
        sink.write_pixels(0, pixels)?;
        sink.close()
    })();

    match &result {
        Ok(()) => tracing::info!(
            path = %destination.display(),
            width = metadata.width,
            height = metadata.height,
            "FITS image written"
        ),
        Err(e) => {
            tracing::error!(path = %destination.display(), "FITS encoding failed: {}", e);
            sink.discard();
        }
    }
    result
}

#[cfg_attr(not(feature = "storage_fits"), allow(dead_code))]
fn valid_keyword(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 8
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        && !STRUCTURAL_KEYWORDS.contains(&name)
}

#[cfg(feature = "storage_fits")]
pub use self::cfitsio::{read_fits, FitsFile, FitsImage};

#[cfg(not(feature = "storage_fits"))]
pub use self::disabled::FitsFile;

#[cfg(feature = "storage_fits")]
mod cfitsio {
    use std::path::{Path, PathBuf};

    use fitsio::hdu::HduInfo;
    use fitsio::images::{ImageDescription, ImageType};

    use super::{valid_keyword, ImageSink, BITPIX_SHORT, EXPOSURE_KEYWORD};
    use crate::error::EncodeError;

    impl From<fitsio::errors::Error> for EncodeError {
        fn from(err: fitsio::errors::Error) -> Self {
            match err {
                fitsio::errors::Error::Fits(e) => EncodeError::Library {
                    status: e.status,
                    message: e.message,
                },
                fitsio::errors::Error::Io(e) => EncodeError::Io(e),
                other => EncodeError::Library {
                    status: -1,
                    message: other.to_string(),
                },
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    struct Shape {
        width: u32,
        height: u32,
    }

    impl Shape {
        fn len(self) -> usize {
            self.width as usize * self.height as usize
        }
    }

    /// CFITSIO-backed image writer.
    ///
    /// Only the target path and image shape are held between calls; each step
    /// opens the file, does its work and closes it again.
    #[derive(Debug, Default)]
    pub struct FitsFile {
        path: Option<PathBuf>,
        shape: Option<Shape>,
        written: usize,
    }

    impl FitsFile {
        /// A writer with no file targeted.
        pub fn new() -> Self {
            Self::default()
        }

        fn edit(&self) -> Result<(fitsio::FitsFile, fitsio::hdu::FitsHdu), EncodeError> {
            let path = match (&self.path, self.shape) {
                (Some(path), Some(_)) => path,
                _ => return Err(EncodeError::State("image not declared")),
            };
            let mut file = fitsio::FitsFile::edit(path)?;
            let hdu = file.primary_hdu()?;
            Ok((file, hdu))
        }
    }

    impl ImageSink for FitsFile {
        fn create(&mut self, path: &Path) -> Result<(), EncodeError> {
            if self.shape.is_some() {
                tracing::warn!(path = ?self.path, "Discarding unfinished FITS file");
                self.discard();
            }
            *self = Self {
                path: Some(path.to_path_buf()),
                ..Self::default()
            };
            Ok(())
        }

        fn declare_image(
            &mut self,
            width: u32,
            height: u32,
            bitpix: i16,
        ) -> Result<(), EncodeError> {
            let path = self
                .path
                .as_deref()
                .ok_or(EncodeError::State("file not created"))?;
            if self.shape.is_some() {
                return Err(EncodeError::State("image already declared"));
            }
            if bitpix != BITPIX_SHORT {
                return Err(EncodeError::Format(format!("unsupported BITPIX {}", bitpix)));
            }

            let dimensions = [height as usize, width as usize];
            let description = ImageDescription {
                data_type: ImageType::UnsignedShort,
                dimensions: &dimensions,
            };
            fitsio::FitsFile::create(path)
                .with_custom_primary(&description)
                .overwrite()
                .open()?;
            self.shape = Some(Shape { width, height });
            Ok(())
        }

        fn write_keyword(
            &mut self,
            name: &str,
            value: i64,
            comment: &str,
        ) -> Result<(), EncodeError> {
            if !valid_keyword(name) {
                return Err(EncodeError::InvalidKeyword(name.to_string()));
            }
            let (mut file, hdu) = self.edit()?;
            hdu.write_key(&mut file, name, (value, comment))?;
            Ok(())
        }

        fn write_pixels(&mut self, first: usize, pixels: &[u16]) -> Result<(), EncodeError> {
            let shape = self.shape.ok_or(EncodeError::State("image not declared"))?;
            let end = first + pixels.len();
            if end > shape.len() {
                return Err(EncodeError::DimensionMismatch {
                    width: shape.width,
                    height: shape.height,
                    actual: end,
                });
            }
            let (mut file, hdu) = self.edit()?;
            hdu.write_section(&mut file, first, end, pixels)?;
            self.written += pixels.len();
            Ok(())
        }

        fn close(&mut self) -> Result<(), EncodeError> {
            let shape = self.shape.ok_or(EncodeError::State("image not declared"))?;
            if self.written < shape.len() {
                return Err(EncodeError::Truncated(format!(
                    "{} of {} pixels written",
                    self.written,
                    shape.len()
                )));
            }
            if let Some(path) = &self.path {
                tracing::debug!(path = %path.display(), "FITS file closed");
            }
            *self = Self::default();
            Ok(())
        }

        fn discard(&mut self) {
            let declared = self.shape.is_some();
            let path = self.path.take();
            *self = Self::default();
            if let (true, Some(path)) = (declared, path) {
                match std::fs::remove_file(&path) {
                    Ok(()) => tracing::warn!(path = %path.display(), "Partial FITS file removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::error!(
                        path = %path.display(),
                        "Could not remove partial FITS file: {}",
                        e
                    ),
                }
            }
        }
    }

    /// A FITS image read back from disk.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FitsImage {
        /// `NAXIS1`
        pub width: u32,
        /// `NAXIS2`
        pub height: u32,
        /// Value of the `EXPOSURE` keyword, if present.
        pub exposure_secs: Option<i64>,
        /// Samples in row-major order.
        pub pixels: Vec<u16>,
    }

    /// Read the primary 2-D image of the file at `path`.
    pub fn read_fits(path: &Path) -> Result<FitsImage, EncodeError> {
        let mut file = fitsio::FitsFile::open(path)?;
        let hdu = file.primary_hdu()?;
        let (height, width) = match &hdu.info {
            HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => (shape[0], shape[1]),
            _ => return Err(EncodeError::Format("primary HDU is not a 2-D image".into())),
        };
        let width = u32::try_from(width)
            .map_err(|_| EncodeError::Format(format!("width {} out of range", width)))?;
        let height = u32::try_from(height)
            .map_err(|_| EncodeError::Format(format!("height {} out of range", height)))?;

        let pixels: Vec<u16> = hdu.read_image(&mut file)?;
        let exposure_secs = hdu.read_key::<i64>(&mut file, EXPOSURE_KEYWORD).ok();
        Ok(FitsImage {
            width,
            height,
            exposure_secs,
            pixels,
        })
    }
}

#[cfg(not(feature = "storage_fits"))]
mod disabled {
    use std::path::Path;

    use super::ImageSink;
    use crate::error::EncodeError;

    /// Placeholder writer used when the crate is built without the `storage_fits` feature.
    #[derive(Debug, Default)]
    pub struct FitsFile;

    impl FitsFile {
        /// A writer that rejects every image.
        pub fn new() -> Self {
            Self
        }
    }

    impl ImageSink for FitsFile {
        fn create(&mut self, _path: &Path) -> Result<(), EncodeError> {
            Err(EncodeError::Unavailable)
        }

        fn declare_image(&mut self, _: u32, _: u32, _: i16) -> Result<(), EncodeError> {
            Err(EncodeError::Unavailable)
        }

        fn write_keyword(&mut self, _: &str, _: i64, _: &str) -> Result<(), EncodeError> {
            Err(EncodeError::Unavailable)
        }

        fn write_pixels(&mut self, _: usize, _: &[u16]) -> Result<(), EncodeError> {
            Err(EncodeError::Unavailable)
        }

        fn close(&mut self) -> Result<(), EncodeError> {
            Err(EncodeError::Unavailable)
        }
    }
}
