use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during segmentation core operations.
#[derive(Debug, Error)]
pub enum SceneSegError {
    /// A file could not be read or written.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An input image could not be decoded.
    #[error("failed to decode image {path:?}: {source}")]
    ImageDecode {
        /// The image that failed to decode.
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// An output image could not be encoded.
    #[error("failed to write image {path:?}: {source}")]
    ImageEncode {
        /// The destination file.
        path: PathBuf,
        #[source]
        source: png::EncodingError,
    },

    /// A label matrix file is missing its tensor or has the wrong layout.
    #[error("malformed label matrix {path:?}: {reason}")]
    LabelFormat {
        /// The offending label file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The selected class list is empty, out of range or repeats an index.
    #[error("invalid class selection: {0}")]
    InvalidClasses(String),

    /// The canvas size cannot flow through the encoder.
    #[error("invalid canvas: {0}")]
    InvalidCanvas(String),

    /// The layer descriptors do not chain.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Two feature maps that must agree on shape do not.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Candle ML framework error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl SceneSegError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn label(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::LabelFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for segmentation core operations.
pub type Result<T> = std::result::Result<T, SceneSegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = SceneSegError::InvalidClasses("duplicate index 3".into());
        assert_eq!(err.to_string(), "invalid class selection: duplicate index 3");

        let err = SceneSegError::label("a_gtCoarse_color.safetensors", "missing `label` tensor");
        assert!(err.to_string().contains("a_gtCoarse_color.safetensors"));
        assert!(err.to_string().contains("missing `label` tensor"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SceneSegError>();
    }
}
