//! Image tensor shape metadata.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Shape metadata for image batches, following `(B, C, H, W)`.
///
/// # Example
///
/// ```rust
/// use cxr_core::ImageShape;
///
/// let shape = ImageShape::single(224);
/// assert_eq!(shape.dims(), [1, 3, 224, 224]);
/// assert!(shape.check(&[1, 3, 224, 224]).is_ok());
/// assert!(shape.check(&[2, 3, 224, 224]).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl ImageShape {
    /// Create a new shape.
    #[must_use]
    pub const fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    /// A single RGB image of side `size`.
    #[must_use]
    pub const fn single(size: usize) -> Self {
        Self::new(1, 3, size, size)
    }

    /// Batch size.
    #[must_use]
    pub const fn batch(&self) -> usize {
        self.batch
    }

    /// Number of channels.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Dimensions as an array.
    #[must_use]
    pub const fn dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    /// Number of elements.
    #[must_use]
    pub const fn numel(&self) -> usize {
        self.batch * self.channels * self.height * self.width
    }

    /// Check that `dims` equals this shape exactly.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidShape`] on any mismatch.
    pub fn check(&self, dims: &[usize]) -> Result<()> {
        if dims == self.dims() {
            Ok(())
        } else {
            Err(CoreError::InvalidShape {
                expected: format!("{:?}", self.dims()),
                got: format!("{dims:?}"),
            })
        }
    }
}

impl std::fmt::Display for ImageShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(B={}, C={}, H={}, W={})",
            self.batch, self.channels, self.height, self.width
        )
    }
}
