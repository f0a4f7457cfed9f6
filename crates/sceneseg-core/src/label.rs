//! # Label Materializer
//!
//! Turns per-pixel class indicator matrices into dense one-hot tensors over
//! the selected classes plus a trailing "other" channel.
//!
//! Label matrices are safetensors files holding a single `label` tensor of
//! shape `(height, width, known_classes)`; any numeric dtype is accepted.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{D, DType, Device, Tensor};

use crate::error::{Result, SceneSegError};
use crate::types::{Canvas, ClassSet};

/// Name of the tensor inside a label file.
pub const LABEL_TENSOR: &str = "label";

/// Loads a label matrix and materializes its one-hot tensor.
///
/// Output shape is `(height, width, classes.num_outputs())`, f32.
///
/// # Errors
///
/// Fails if the file is missing, is not a safetensors file, lacks the
/// `label` tensor, or has fewer channels than the selection needs.
pub fn materialize(path: &Path, classes: &ClassSet, device: &Device) -> Result<Tensor> {
    if !path.is_file() {
        return Err(SceneSegError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "label file not found"),
        ));
    }
    let mut tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| SceneSegError::label(path, e.to_string()))?;
    let matrix = tensors
        .remove(LABEL_TENSOR)
        .ok_or_else(|| SceneSegError::label(path, "missing `label` tensor"))?;
    one_hot_from_matrix(&matrix, classes).map_err(|e| match e {
        SceneSegError::LabelFormat { reason, .. } => SceneSegError::label(path, reason),
        other => other,
    })
}

/// Builds the one-hot tensor from an in-memory `(h, w, known)` matrix.
///
/// Each pixel takes the selected class with the largest value, the lowest
/// selection position winning ties. A pixel whose selected values are all
/// zero or negative goes to the "other" channel, so every pixel has exactly
/// one active channel.
pub fn one_hot_from_matrix(matrix: &Tensor, classes: &ClassSet) -> Result<Tensor> {
    let (_, _, known) = matrix.dims3().map_err(|_| {
        SceneSegError::label("<memory>", format!("expected rank 3, got {:?}", matrix.dims()))
    })?;
    if classes.max_index() >= known {
        return Err(SceneSegError::label(
            "<memory>",
            format!(
                "matrix has {known} class channels, selection needs index {}",
                classes.max_index()
            ),
        ));
    }

    let device = matrix.device();
    let ids: Vec<u32> = classes.indices().iter().map(|&i| i as u32).collect();
    let ids = Tensor::new(ids.as_slice(), device)?;
    let selected = matrix.to_dtype(DType::F32)?.index_select(&ids, 2)?;
    let other = selected
        .max_keepdim(D::Minus1)?
        .le(0.0)?
        .to_dtype(DType::F32)?;
    let stacked = Tensor::cat(&[&selected.relu()?, &other], D::Minus1)?;

    // Either some selected value is positive and "other" is 0, or every
    // selected channel is clamped to 0 and "other" is 1.
    let winner = stacked.argmax_keepdim(D::Minus1)?;
    let channels = Tensor::arange(0u32, classes.num_outputs() as u32, device)?
        .reshape((1, 1, classes.num_outputs()))?;
    Ok(winner.broadcast_eq(&channels)?.to_dtype(DType::F32)?)
}

/// Nearest-neighbour resample of an `(h, w, c)` tensor onto the canvas.
///
/// Returns the input unchanged when it already matches.
pub fn resize_nearest(labels: &Tensor, canvas: Canvas) -> Result<Tensor> {
    let (h, w, _) = labels.dims3()?;
    if (h, w) == (canvas.height, canvas.width) {
        return Ok(labels.clone());
    }
    let device = labels.device();
    let rows = nearest_indices(h, canvas.height);
    let cols = nearest_indices(w, canvas.width);
    let rows = Tensor::new(rows.as_slice(), device)?;
    let cols = Tensor::new(cols.as_slice(), device)?;
    Ok(labels.index_select(&rows, 0)?.index_select(&cols, 1)?)
}

fn nearest_indices(src: usize, dst: usize) -> Vec<u32> {
    (0..dst).map(|i| ((i * src) / dst) as u32).collect()
}

/// Writes a label matrix in the format [`materialize`] reads.
pub fn save_label_matrix(path: &Path, matrix: &Tensor) -> Result<()> {
    matrix.dims3()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SceneSegError::io(parent, e))?;
    }
    let tensors = HashMap::from([(LABEL_TENSOR.to_string(), matrix.clone())]);
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}
