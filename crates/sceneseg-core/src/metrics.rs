//! Training loss and pixel accuracy.

use candle_core::{D, DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SceneSegError};

/// Mean element-wise sigmoid cross-entropy between logits and labels.
///
/// Uses `max(x, 0) - x·z + ln(1 + e^{-|x|})`, which stays finite for large
/// logits of either sign.
pub fn sigmoid_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    if logits.dims() != labels.dims() {
        return Err(SceneSegError::ShapeMismatch(format!(
            "logits {:?} vs labels {:?}",
            logits.dims(),
            labels.dims()
        )));
    }
    let positive = logits.relu()?;
    let cross = (logits * labels)?;
    let soft = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    Ok(((positive - cross)? + soft)?.mean_all()?)
}

/// Training objective: cross-entropy plus `scale` times the regularizer.
pub fn segmentation_loss(
    logits: &Tensor,
    labels: &Tensor,
    regularization: &Tensor,
    scale: f64,
) -> Result<Tensor> {
    let entropy = sigmoid_cross_entropy(logits, labels)?;
    Ok((entropy + (regularization * scale)?)?)
}

/// Pixel accuracy counts over pixels with a known ground-truth class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelAccuracy {
    pub correct: u64,
    pub counted: u64,
}

impl PixelAccuracy {
    /// Fraction of counted pixels predicted correctly.
    ///
    /// A batch with no known-class pixels has nothing to get wrong and
    /// reports `1.0`; see [`PixelAccuracy::is_vacuous`].
    #[must_use]
    pub fn value(&self) -> f32 {
        if self.counted == 0 {
            1.0
        } else {
            self.correct as f32 / self.counted as f32
        }
    }

    #[must_use]
    pub fn is_vacuous(&self) -> bool {
        self.counted == 0
    }

    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            correct: self.correct + other.correct,
            counted: self.counted + other.counted,
        }
    }
}

/// Compares `(b, h, w, 1)` predictions with `(b, h, w, c)` one-hot labels,
/// skipping pixels whose ground truth is `other_index`.
pub fn pixel_accuracy(
    prediction: &Tensor,
    labels: &Tensor,
    other_index: usize,
) -> Result<PixelAccuracy> {
    let truth = labels.argmax_keepdim(D::Minus1)?;
    let prediction = prediction.to_dtype(DType::U32)?;
    if prediction.dims() != truth.dims() {
        return Err(SceneSegError::ShapeMismatch(format!(
            "prediction {:?} vs ground truth {:?}",
            prediction.dims(),
            truth.dims()
        )));
    }
    let known = truth.ne(other_index as u32)?;
    let hits = prediction.eq(&truth)?;
    Ok(PixelAccuracy {
        correct: count_set((hits * &known)?)?,
        counted: count_set(known)?,
    })
}

/// Number of non-zero entries in a 0/1 `u8` mask, summed in `u32`.
fn count_set(mask: Tensor) -> Result<u64> {
    let total = mask.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()?;
    Ok(u64::from(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn one_hot(classes: &[u32], channels: usize) -> Tensor {
        let values: Vec<f32> = classes
            .iter()
            .flat_map(|&c| (0..channels).map(move |i| if i as u32 == c { 1.0 } else { 0.0 }))
            .collect();
        Tensor::from_vec(values, (1, 1, classes.len(), channels), &Device::Cpu).unwrap()
    }

    fn prediction(classes: &[u32]) -> Tensor {
        Tensor::from_vec(classes.to_vec(), (1, 1, classes.len(), 1), &Device::Cpu).unwrap()
    }

    #[test]
    fn cross_entropy_matches_closed_form() {
        let logits = Tensor::new(&[0f32, 2.0, -3.0, 50.0], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[1f32, 0.0, 1.0, 1.0], &Device::Cpu).unwrap();
        let loss = sigmoid_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected = [
            (2f32).ln(),
            2.0 + (1.0 + (-2f32).exp()).ln(),
            3.0 + (1.0 + (-3f32).exp()).ln(),
            (1.0 + (-50f32).exp()).ln(),
        ];
        let mean = expected.iter().sum::<f32>() / 4.0;
        assert!((loss - mean).abs() < 1e-5, "{loss} vs {mean}");
    }

    #[test]
    fn loss_adds_scaled_regularization() {
        let logits = Tensor::zeros((1, 2, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let labels = one_hot(&[0, 1, 2, 2], 3).reshape((1, 2, 2, 3)).unwrap();
        let reg = Tensor::new(400f32, &Device::Cpu).unwrap();
        let loss = segmentation_loss(&logits, &labels, &reg, 1e-5)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - ((2f32).ln() + 0.004)).abs() < 1e-5);
    }

    #[test]
    fn perfect_prediction_scores_one() {
        let labels = one_hot(&[0, 1, 2, 1], 4);
        let acc = pixel_accuracy(&prediction(&[0, 1, 2, 1]), &labels, 3).unwrap();
        assert_eq!(acc, PixelAccuracy { correct: 4, counted: 4 });
        assert_eq!(acc.value(), 1.0);
    }

    #[test]
    fn other_pixels_are_not_counted() {
        let labels = one_hot(&[0, 3, 3, 1], 4);
        let acc = pixel_accuracy(&prediction(&[0, 0, 1, 2]), &labels, 3).unwrap();
        assert_eq!(acc, PixelAccuracy { correct: 1, counted: 2 });
        assert_eq!(acc.value(), 0.5);
    }

    #[test]
    fn all_other_batch_is_vacuous_not_nan() {
        let labels = one_hot(&[3, 3, 3], 4);
        let acc = pixel_accuracy(&prediction(&[0, 1, 2]), &labels, 3).unwrap();
        assert!(acc.is_vacuous());
        assert_eq!(acc.value(), 1.0);
        assert!(acc.value().is_finite());
    }

    #[test]
    fn counts_stay_exact_past_f32_precision() {
        // 2^24 + 1 is the first integer an f32 sum cannot represent.
        let n = (1usize << 24) + 1;
        let mask = Tensor::ones(n, DType::U8, &Device::Cpu).unwrap();
        assert_eq!(count_set(mask).unwrap(), n as u64);
    }

    #[test]
    fn merge_accumulates_counts() {
        let a = PixelAccuracy { correct: 3, counted: 4 };
        let b = PixelAccuracy { correct: 0, counted: 0 };
        assert_eq!(a.merge(b).value(), 0.75);
    }
}
