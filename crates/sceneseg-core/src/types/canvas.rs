use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SceneSegError};

pub const DEFAULT_CANVAS_HEIGHT: usize = 256;
pub const DEFAULT_CANVAS_WIDTH: usize = 512;

/// Every canvas extent must survive four exact halvings.
pub const CANVAS_ALIGNMENT: usize = 16;

/// Fixed raster size every image is resized to before entering the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Canvas {
    pub height: usize,
    pub width: usize,
}

impl Canvas {
    #[must_use]
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Checks that both extents are nonzero multiples of [`CANVAS_ALIGNMENT`].
    ///
    /// # Errors
    ///
    /// Returns `SceneSegError::InvalidCanvas` otherwise.
    pub fn validate(&self) -> Result<()> {
        for (axis, extent) in [("height", self.height), ("width", self.width)] {
            if extent == 0 || extent % CANVAS_ALIGNMENT != 0 {
                return Err(SceneSegError::InvalidCanvas(format!(
                    "{axis} {extent} is not a positive multiple of {CANVAS_ALIGNMENT}"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new(DEFAULT_CANVAS_HEIGHT, DEFAULT_CANVAS_WIDTH)
    }
}

impl fmt::Display for Canvas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}
