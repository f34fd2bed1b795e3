//! Pixel extraction from platform images.
//!
//! A platform image is anything implementing [`ImageSource`]: it reports its
//! geometry and grants temporary read access to its pixels through a guard
//! that revokes the access when dropped. [`extract_rgb`] turns it into a
//! tightly packed RGB [`Bitmap`], dropping alpha.

use std::ops::Deref;

use crate::bitmap::{rgb_len, Bitmap};
use crate::error::{BridgeError, ImageAccessError};

/// Memory layout of a platform image's pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel, memory order R, G, B, A
    Rgba8888,
    /// 2 bytes per pixel, little-endian `RRRRRGGG GGGBBBBB`
    Rgb565,
    /// Any other platform format code
    Other(i32),
}

impl PixelFormat {
    /// Android `ANDROID_BITMAP_FORMAT_*` code to format
    #[must_use]
    pub fn from_android(code: i32) -> Self {
        match code {
            1 => Self::Rgba8888,
            4 => Self::Rgb565,
            other => Self::Other(other),
        }
    }

    /// Android `ANDROID_BITMAP_FORMAT_*` code for this format
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Rgba8888 => 1,
            Self::Rgb565 => 4,
            Self::Other(code) => code,
        }
    }

    /// Bytes per pixel, `None` when the format cannot be converted
    #[must_use]
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::Rgba8888 => Some(4),
            Self::Rgb565 => Some(2),
            Self::Other(_) => None,
        }
    }
}

/// Geometry reported by a platform image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes between the starts of consecutive rows
    pub stride: u32,
    /// Pixel layout
    pub format: PixelFormat,
}

/// A platform image whose pixels can be read under a lock.
pub trait ImageSource {
    /// Locked view of the pixel buffer; dropping it releases the lock.
    type Pixels<'a>: Deref<Target = [u8]>
    where
        Self: 'a;

    /// Report width, height, stride and format.
    ///
    /// # Errors
    /// [`ImageAccessError::InfoUnavailable`] when the platform refuses.
    fn info(&self) -> Result<ImageInfo, ImageAccessError>;

    /// Grant temporary read access to the pixel buffer.
    ///
    /// # Errors
    /// [`ImageAccessError::LockFailed`] when the image is already locked or
    /// belongs to another context.
    fn lock_pixels(&self) -> Result<Self::Pixels<'_>, ImageAccessError>;
}

/// Convert a platform image into an RGB [`Bitmap`].
///
/// The pixel lock is held only while converting and is released on every
/// path out of this function. Byte `(y * width + x) * 3 + c` of the result is
/// channel `c` of source pixel `(x, y)`.
///
/// # Errors
/// Any [`ImageAccessError`], wrapped in [`BridgeError::ImageAccess`].
pub fn extract_rgb<S>(source: &S) -> Result<Bitmap, BridgeError>
where
    S: ImageSource + ?Sized,
{
    let info = source.info()?;
    let out_len = rgb_len(info.width, info.height)?;
    let bytes_per_pixel = info
        .format
        .bytes_per_pixel()
        .ok_or(ImageAccessError::UnsupportedFormat {
            format: info.format.code(),
        })?;

    let width = info.width as usize;
    let height = info.height as usize;
    let stride = info.stride as usize;
    let (row_len, required) = pixel_span(width, height, stride, bytes_per_pixel)?;

    let mut rgb = Vec::with_capacity(out_len);
    {
        let pixels = source.lock_pixels()?;
        if pixels.len() < required {
            return Err(ImageAccessError::BufferSize {
                expected: required,
                actual: pixels.len(),
            }
            .into());
        }

        for row in pixels.chunks(stride).take(height) {
            let row = &row[..row_len];
            match info.format {
                PixelFormat::Rgba8888 => {
                    for px in row.chunks_exact(4) {
                        rgb.extend_from_slice(&px[..3]);
                    }
                }
                PixelFormat::Rgb565 => {
                    for px in row.chunks_exact(2) {
                        rgb.extend_from_slice(&expand_rgb565(u16::from_le_bytes([px[0], px[1]])));
                    }
                }
                PixelFormat::Other(format) => {
                    return Err(ImageAccessError::UnsupportedFormat { format }.into());
                }
            }
        }
    }

    Bitmap::from_rgb(info.width, info.height, rgb)
}

fn expand_rgb565(v: u16) -> [u8; 3] {
    let r = ((v >> 11) & 0x1f) as u8;
    let g = ((v >> 5) & 0x3f) as u8;
    let b = (v & 0x1f) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

impl ImageSource for image::RgbaImage {
    type Pixels<'a> = &'a [u8];

    fn info(&self) -> Result<ImageInfo, ImageAccessError> {
        Ok(ImageInfo {
            width: self.width(),
            height: self.height(),
            stride: self.width().saturating_mul(4),
            format: PixelFormat::Rgba8888,
        })
    }

    fn lock_pixels(&self) -> Result<Self::Pixels<'_>, ImageAccessError> {
        Ok(self.as_raw().as_slice())
    }
}

/// Bytes per unpadded row and bytes a locked buffer must hold, for a
/// non-empty image.
fn pixel_span(
    width: usize,
    height: usize,
    stride: usize,
    bytes_per_pixel: usize,
) -> Result<(usize, usize), ImageAccessError> {
    let too_large = || ImageAccessError::BufferSize {
        expected: usize::MAX,
        actual: stride,
    };
    let row_len = width.checked_mul(bytes_per_pixel).ok_or_else(too_large)?;
    if stride < row_len {
        return Err(ImageAccessError::BufferSize {
            expected: row_len,
            actual: stride,
        });
    }
    let required = stride
        .checked_mul(height.saturating_sub(1))
        .and_then(|n| n.checked_add(row_len))
        .ok_or_else(too_large)?;
    Ok((row_len, required))
}
