//! # Segmentation Network
//!
//! Fully-convolutional encoder-decoder over a [`Topology`]: convolutional
//! encoder stages with max-pooling, a wide bottleneck, a 1x1 classifier and
//! transposed-convolution decoder stages that add encoder feature maps back
//! in at matching resolution.
//!
//! Images enter and predictions leave in NHWC layout; everything in
//! between runs NCHW.

use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::debug;

use crate::error::{Result, SceneSegError};
use crate::network::init::{TruncatedNormal, WEIGHT_STDDEV};
use crate::network::topology::{ConvSpec, DecoderSpec, Topology};

/// Output of one forward pass.
#[derive(Debug, Clone)]
pub struct SegOutput {
    /// Per-pixel class index, `(batch, height, width, 1)`, u32.
    pub prediction: Tensor,
    /// Raw class logits, `(batch, height, width, num_outputs)`.
    pub logits: Tensor,
}

struct ConvLayer {
    spec: ConvSpec,
    weight: Tensor,
    bias: Tensor,
}

struct DeconvLayer {
    spec: DecoderSpec,
    weight: Tensor,
    bias: Tensor,
}

/// The segmentation network. Parameters live in the [`VarMap`] it was
/// built with; the model only holds shared handles to them.
pub struct SegNet {
    topology: Topology,
    encoder: Vec<(Vec<ConvLayer>, bool)>,
    bottleneck: Vec<ConvLayer>,
    classifier: ConvLayer,
    decoder: Vec<DeconvLayer>,
}

impl SegNet {
    /// Allocates every parameter of `topology` into `varmap`.
    ///
    /// Weights are drawn from a truncated normal (σ = 0.02) seeded with
    /// `seed`, biases start at zero. Names are `{layer}.weight` and
    /// `{layer}.bias`.
    ///
    /// # Errors
    ///
    /// Returns `SceneSegError::InvalidTopology` if the descriptors do not
    /// chain, or a tensor error if allocation fails.
    pub fn new(topology: Topology, varmap: &VarMap, device: &Device, seed: u64) -> Result<Self> {
        topology.validate()?;
        let mut init = TruncatedNormal::new(seed, WEIGHT_STDDEV);
        let mut alloc = |name: &str, weight_shape: (usize, usize, usize, usize), bias_len: usize| {
            let weight = init.tensor(weight_shape, device)?;
            let bias = Tensor::zeros(bias_len, DType::F32, device)?;
            Ok::<_, SceneSegError>((
                register(varmap, format!("{name}.weight"), weight)?,
                register(varmap, format!("{name}.bias"), bias)?,
            ))
        };

        let mut conv = |spec: &ConvSpec| -> Result<ConvLayer> {
            let (weight, bias) = alloc(&spec.name, spec.weight_shape(), spec.out_channels)?;
            Ok(ConvLayer {
                spec: spec.clone(),
                weight,
                bias,
            })
        };
        let encoder = topology
            .encoder
            .iter()
            .map(|stage| {
                let convs = stage.convs.iter().map(&mut conv).collect::<Result<Vec<_>>>()?;
                Ok((convs, stage.pool))
            })
            .collect::<Result<Vec<_>>>()?;
        let bottleneck = topology
            .bottleneck
            .iter()
            .map(&mut conv)
            .collect::<Result<Vec<_>>>()?;
        let classifier = conv(&topology.classifier)?;

        let decoder = topology
            .decoder
            .iter()
            .map(|spec| {
                let (weight, bias) = alloc(&spec.name, spec.weight_shape(), spec.out_channels)?;
                Ok(DeconvLayer {
                    spec: spec.clone(),
                    weight,
                    bias,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            layers = topology.params().len(),
            outputs = topology.num_outputs(),
            "segmentation network allocated"
        );
        Ok(Self {
            topology,
            encoder,
            bottleneck,
            classifier,
            decoder,
        })
    }

    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.topology.num_outputs()
    }

    /// Parameter names in allocation order.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        self.topology
            .params()
            .into_iter()
            .flat_map(|p| [format!("{}.weight", p.name), format!("{}.bias", p.name)])
            .collect()
    }

    /// Runs the network on `(batch, height, width, 3)` images in `[0, 255]`.
    ///
    /// `keep_prob` is the dropout keep probability; `1.0` disables dropout.
    ///
    /// # Errors
    ///
    /// Returns `SceneSegError::ShapeMismatch` if the input rank or channel
    /// count is wrong, or if a decoder stage cannot reach its target extent.
    pub fn forward(&self, images: &Tensor, keep_prob: f32) -> Result<SegOutput> {
        let (_, height, width, channels) = images.dims4().map_err(|_| {
            SceneSegError::ShapeMismatch(format!("expected NHWC images, got {:?}", images.dims()))
        })?;
        if channels != self.topology.in_channels {
            return Err(SceneSegError::ShapeMismatch(format!(
                "network takes {} channels, images have {channels}",
                self.topology.in_channels
            )));
        }

        let mut x = images.permute((0, 3, 1, 2))?.contiguous()?;
        let mut stage_outputs = Vec::with_capacity(self.encoder.len());
        for (convs, pool) in &self.encoder {
            for layer in convs {
                x = conv_forward(&x, layer, keep_prob)?;
            }
            if *pool {
                x = max_pool_same(&x)?;
            }
            stage_outputs.push(x.clone());
        }
        for layer in &self.bottleneck {
            x = conv_forward(&x, layer, keep_prob)?;
        }
        x = conv_forward(&x, &self.classifier, keep_prob)?;

        for layer in &self.decoder {
            let skip = layer.spec.fuse.map(|stage| &stage_outputs[stage]);
            let target = match skip {
                Some(feature) => {
                    let (_, _, h, w) = feature.dims4()?;
                    (h, w)
                }
                None => (height, width),
            };
            x = deconv_forward(&x, layer, target)?;
            if let Some(feature) = skip {
                x = (x + feature)?;
            }
        }

        let (_, _, out_h, out_w) = x.dims4()?;
        if (out_h, out_w) != (height, width) {
            return Err(SceneSegError::ShapeMismatch(format!(
                "logits are {out_h}x{out_w}, input is {height}x{width}"
            )));
        }
        let logits = x.permute((0, 2, 3, 1))?.contiguous()?;
        let prediction = argmax_channels(&logits)?;
        Ok(SegOutput { prediction, logits })
    }

    /// Weight-decay surrogate: `Σ ½·‖W‖²` over every convolution and
    /// transposed-convolution weight, each counted once. Biases are
    /// excluded.
    pub fn regularization(&self) -> Result<Tensor> {
        let weights = self
            .encoder
            .iter()
            .flat_map(|(convs, _)| convs.iter())
            .chain(self.bottleneck.iter())
            .chain(std::iter::once(&self.classifier))
            .map(|l| &l.weight)
            .chain(self.decoder.iter().map(|l| &l.weight));

        let mut total: Option<Tensor> = None;
        for weight in weights {
            let term = weight.sqr()?.sum_all()?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }
        match total {
            Some(sum) => Ok((sum * 0.5)?),
            None => Ok(Tensor::new(0f32, self.classifier.weight.device())?),
        }
    }
}

/// Channel-wise argmax of NHWC logits, keeping a trailing unit axis.
///
/// Ties resolve to the lowest channel index.
pub fn argmax_channels(logits: &Tensor) -> Result<Tensor> {
    Ok(logits.argmax_keepdim(D::Minus1)?)
}

fn register(varmap: &VarMap, name: String, value: Tensor) -> Result<Tensor> {
    let var = Var::from_tensor(&value)?;
    let tensor = var.as_tensor().clone();
    let mut data = varmap
        .data()
        .lock()
        .map_err(|_| SceneSegError::InvalidTopology("parameter store lock poisoned".into()))?;
    if data.insert(name.clone(), var).is_some() {
        return Err(SceneSegError::InvalidTopology(format!(
            "parameter {name} allocated twice"
        )));
    }
    Ok(tensor)
}

fn conv_forward(x: &Tensor, layer: &ConvLayer, keep_prob: f32) -> Result<Tensor> {
    let spec = &layer.spec;
    let mut y = x
        .conv2d(&layer.weight, spec.padding, spec.stride, 1, 1)?
        .broadcast_add(&layer.bias.reshape((1, spec.out_channels, 1, 1))?)?;
    if spec.activation {
        y = y.relu()?;
    }
    if spec.dropout && keep_prob < 1.0 {
        y = candle_nn::ops::dropout(&y, 1.0 - keep_prob)?;
    }
    Ok(y)
}

/// 2x2 stride-2 max-pool with "same" padding.
///
/// Odd extents get one zero row/column at the bottom/right. Inputs are
/// post-ReLU, so the zero never wins over a real activation.
fn max_pool_same(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let mut padded = x.clone();
    if h % 2 == 1 {
        padded = padded.pad_with_zeros(2, 0, 1)?;
    }
    if w % 2 == 1 {
        padded = padded.pad_with_zeros(3, 0, 1)?;
    }
    Ok(padded.max_pool2d(2)?)
}

/// Transposed convolution cropped to `target` (height, width).
fn deconv_forward(x: &Tensor, layer: &DeconvLayer, target: (usize, usize)) -> Result<Tensor> {
    let spec = &layer.spec;
    let y = x.conv_transpose2d(&layer.weight, spec.padding, 0, spec.stride, 1)?;
    let (_, _, h, w) = y.dims4()?;
    if h < target.0 || w < target.1 {
        return Err(SceneSegError::ShapeMismatch(format!(
            "{} upsamples to {h}x{w}, needs {}x{}",
            spec.name, target.0, target.1
        )));
    }
    let y = y.narrow(2, 0, target.0)?.narrow(3, 0, target.1)?;
    Ok(y.broadcast_add(&layer.bias.reshape((1, spec.out_channels, 1, 1))?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::topology::EncoderStage;

    fn slim(num_outputs: usize) -> (SegNet, VarMap) {
        let varmap = VarMap::new();
        let topology = Topology::vgg_skip_slim(num_outputs, 32);
        let net = SegNet::new(topology, &varmap, &Device::Cpu, 11).unwrap();
        (net, varmap)
    }

    fn constant_images(batch: usize, h: usize, w: usize, value: f32) -> Tensor {
        Tensor::ones((batch, h, w, 3), DType::F32, &Device::Cpu)
            .unwrap()
            .affine(f64::from(value), 0.0)
            .unwrap()
    }

    #[test]
    fn one_by_one_classifier_is_analytic() {
        // No encoder, no decoder: logits are a single 1x1 convolution.
        let topology = Topology {
            in_channels: 3,
            encoder: vec![],
            bottleneck: vec![],
            classifier: ConvSpec::same("classifier", 3, 2, 1).linear(),
            decoder: vec![],
        };
        let mut varmap = VarMap::new();
        let net = SegNet::new(topology, &varmap, &Device::Cpu, 0).unwrap();

        let weight = Tensor::new(&[[1f32, 2., 3.], [-1., 0., 0.5]], &Device::Cpu)
            .unwrap()
            .reshape((2, 3, 1, 1))
            .unwrap();
        varmap.set_one("classifier.weight", &weight).unwrap();
        varmap
            .set_one("classifier.bias", Tensor::new(&[0.5f32, -1.], &Device::Cpu).unwrap())
            .unwrap();

        let out = net.forward(&constant_images(1, 2, 3, 2.0), 1.0).unwrap();
        assert_eq!(out.logits.dims(), &[1, 2, 3, 2]);
        let logits: Vec<f32> = out.logits.flatten_all().unwrap().to_vec1().unwrap();
        // 2*(1+2+3)+0.5 = 12.5 ; 2*(-1+0+0.5)-1 = -2
        for pair in logits.chunks(2) {
            assert!((pair[0] - 12.5).abs() < 1e-5);
            assert!((pair[1] + 2.0).abs() < 1e-5);
        }
        let pred: Vec<u32> = out.prediction.flatten_all().unwrap().to_vec1().unwrap();
        assert!(pred.iter().all(|&p| p == 0));
    }

    #[test]
    fn skip_shapes_match_for_aligned_canvases() {
        let (net, _varmap) = slim(4);
        for (h, w) in [(16, 16), (32, 48), (48, 80), (64, 32)] {
            let out = net.forward(&constant_images(2, h, w, 100.0), 1.0).unwrap();
            assert_eq!(out.logits.dims(), &[2, h, w, 4], "canvas {h}x{w}");
            assert_eq!(out.prediction.dims(), &[2, h, w, 1]);
            assert_eq!(out.prediction.dtype(), DType::U32);
        }
    }

    #[test]
    fn parameters_are_registered_in_order() {
        let (net, varmap) = slim(3);
        let names = net.parameter_names();
        assert_eq!(names.len(), 2 * 22);
        assert_eq!(names[0], "conv1_1.weight");
        assert_eq!(names[1], "conv1_1.bias");
        assert_eq!(names.last().map(String::as_str), Some("deconv3.bias"));
        let data = varmap.data().lock().unwrap();
        assert_eq!(data.len(), names.len());
        assert!(names.iter().all(|n| data.contains_key(n)));
        let bias: Vec<f32> = data["conv8.bias"].as_tensor().to_vec1().unwrap();
        assert!(bias.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn regularization_sums_every_weight_once() {
        let (net, varmap) = slim(3);
        let expected: f32 = {
            let data = varmap.data().lock().unwrap();
            data.iter()
                .filter(|(name, _)| name.ends_with(".weight"))
                .map(|(_, var)| {
                    let squares = var.as_tensor().sqr().unwrap().sum_all().unwrap();
                    squares.to_scalar::<f32>().unwrap()
                })
                .sum::<f32>()
                * 0.5
        };
        let reg = net.regularization().unwrap().to_scalar::<f32>().unwrap();
        assert!((reg - expected).abs() <= expected * 1e-4, "{reg} vs {expected}");
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        let logits =
            Tensor::new(&[[[[0.3f32, 0.7, 0.7], [1.0, 1.0, 1.0]]]], &Device::Cpu).unwrap();
        let pred: Vec<u32> = argmax_channels(&logits)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(pred, vec![1, 0]);
    }

    #[test]
    fn same_input_same_output_without_dropout() {
        let (net, _varmap) = slim(3);
        let images = constant_images(1, 32, 32, 50.0);
        let logits = || -> Vec<f32> {
            let out = net.forward(&images, 1.0).unwrap();
            out.logits.flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_eq!(logits(), logits());
    }

    #[test]
    fn rejects_wrong_input_layout() {
        let (net, _varmap) = slim(3);
        let chw = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(net.forward(&chw, 1.0), Err(SceneSegError::ShapeMismatch(_))));
    }

    #[test]
    fn pool_rounds_odd_extents_up() {
        let topology = Topology {
            in_channels: 3,
            encoder: vec![EncoderStage {
                convs: vec![ConvSpec::same("c", 3, 2, 3)],
                pool: true,
            }],
            bottleneck: vec![],
            classifier: ConvSpec::same("cls", 2, 2, 1).linear(),
            decoder: vec![DecoderSpec::upsample("up", 2, 2, 2, None)],
        };
        let varmap = VarMap::new();
        let net = SegNet::new(topology, &varmap, &Device::Cpu, 1).unwrap();
        let out = net.forward(&constant_images(1, 5, 7, 1.0), 1.0).unwrap();
        assert_eq!(out.logits.dims(), &[1, 5, 7, 2]);
    }
}
