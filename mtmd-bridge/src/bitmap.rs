//! Decoded RGB images ready for tokenization

use crate::error::{BridgeError, ImageAccessError};

/// Number of bytes per pixel in a [`Bitmap`].
pub const RGB_CHANNELS: usize = 3;

/// An RGB image owned by the bridge.
///
/// The buffer is always exactly `width * height * 3` bytes, interleaved
/// `R, G, B`, row-major with no padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    id: Option<String>,
}

impl Bitmap {
    /// Create a new image bitmap from RGB data
    ///
    /// # Arguments
    /// * `width` - Image width in pixels
    /// * `height` - Image height in pixels
    /// * `pixels` - RGB data in RGBRGBRGB... format (must be width * height * 3 bytes)
    ///
    /// # Errors
    /// [`ImageAccessError::InvalidDimensions`] for a zero dimension and
    /// [`ImageAccessError::BufferSize`] when the length does not match.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, BridgeError> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(ImageAccessError::BufferSize {
                expected,
                actual: pixels.len(),
            }
            .into());
        }

        Ok(Self {
            width,
            height,
            pixels,
            id: None,
        })
    }

    /// Width in pixels
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The raw RGB bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.pixels
    }

    /// Set an ID for this bitmap (used by the engine for KV cache tracking)
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Get the ID of this bitmap if set
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Builder-style variant of [`Bitmap::set_id`]
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.set_id(id);
        self
    }
}

/// Byte length of an RGB buffer for the given geometry.
pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize, ImageAccessError> {
    if width == 0 || height == 0 {
        return Err(ImageAccessError::InvalidDimensions { width, height });
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(RGB_CHANNELS))
        .ok_or(ImageAccessError::InvalidDimensions { width, height })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_length() {
        let err = Bitmap::from_rgb(2, 2, vec![0; 11]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ImageAccess(ImageAccessError::BufferSize {
                expected: 12,
                actual: 11
            })
        ));
    }

    #[test]
    fn rejects_zero_dimension() {
        let err = Bitmap::from_rgb(0, 4, Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ImageAccess(ImageAccessError::InvalidDimensions { width: 0, height: 4 })
        ));
    }

    #[test]
    fn keeps_geometry_and_id() {
        let bitmap = Bitmap::from_rgb(1, 2, vec![1, 2, 3, 4, 5, 6]).unwrap().with_id("frame-7");
        assert_eq!((bitmap.width(), bitmap.height()), (1, 2));
        assert_eq!(bitmap.data(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(bitmap.id(), Some("frame-7"));
    }
}
