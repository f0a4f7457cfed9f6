//! Layer descriptors for the encoder-decoder network.
//!
//! A [`Topology`] lists every parameterised stage in allocation order. The
//! model builder walks it once to create weights, and the regularizer folds
//! over the same list, so the parameter set is fully enumerable.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SceneSegError};

/// Width of the two bottleneck stages in the full-size network.
pub const BOTTLENECK_WIDTH: usize = 4096;

/// Convolutions per encoder stage and their output widths.
const ENCODER_LAYOUT: [(usize, usize); 5] = [(2, 64), (2, 128), (4, 256), (4, 512), (4, 512)];

/// A convolution + bias, optionally followed by ReLU and dropout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub activation: bool,
    pub dropout: bool,
}

impl ConvSpec {
    /// Unit-stride convolution with "same" padding, ReLU and dropout.
    #[must_use]
    pub fn same(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    ) -> Self {
        Self {
            name: name.into(),
            in_channels,
            out_channels,
            kernel,
            stride: 1,
            padding: kernel / 2,
            activation: true,
            dropout: true,
        }
    }

    /// Raw-logit projection: no activation, no dropout.
    #[must_use]
    pub fn linear(self) -> Self {
        Self {
            activation: false,
            dropout: false,
            ..self
        }
    }

    /// Weight shape as `(out, in, kh, kw)`.
    #[must_use]
    pub fn weight_shape(&self) -> (usize, usize, usize, usize) {
        (self.out_channels, self.in_channels, self.kernel, self.kernel)
    }
}

/// Convolutions followed by an optional 2x2 stride-2 max-pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderStage {
    pub convs: Vec<ConvSpec>,
    pub pool: bool,
}

impl EncoderStage {
    #[must_use]
    pub fn out_channels(&self) -> Option<usize> {
        self.convs.last().map(|c| c.out_channels)
    }
}

/// A transposed convolution that upsamples to a target extent.
///
/// With `fuse: Some(i)` the target is the output of encoder stage `i` and
/// that feature map is added element-wise after upsampling. With `None` the
/// target is the network input extent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderSpec {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub fuse: Option<usize>,
}

impl DecoderSpec {
    /// Transposed convolution with "same" padding for `kernel = 2 * stride`.
    #[must_use]
    pub fn upsample(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        fuse: Option<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            in_channels,
            out_channels,
            kernel: 2 * stride,
            stride,
            padding: stride / 2,
            fuse,
        }
    }

    /// Weight shape as `(in, out, kh, kw)`, the layout transposed
    /// convolutions expect.
    #[must_use]
    pub fn weight_shape(&self) -> (usize, usize, usize, usize) {
        (self.in_channels, self.out_channels, self.kernel, self.kernel)
    }
}

/// A weight tensor the builder allocates, in allocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub weight_shape: (usize, usize, usize, usize),
    pub bias_len: usize,
}

/// The full layer list of an encoder-decoder segmentation network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub in_channels: usize,
    pub encoder: Vec<EncoderStage>,
    pub bottleneck: Vec<ConvSpec>,
    pub classifier: ConvSpec,
    pub decoder: Vec<DecoderSpec>,
}

impl Topology {
    /// The VGG encoder with skip connections, at full width.
    #[must_use]
    pub fn vgg_skip(num_outputs: usize) -> Self {
        Self::vgg_skip_slim(num_outputs, 1)
    }

    /// Same depth, kernels and strides as [`Topology::vgg_skip`] with every
    /// hidden width divided by `divisor` (at least one channel each).
    #[must_use]
    pub fn vgg_skip_slim(num_outputs: usize, divisor: usize) -> Self {
        let divisor = divisor.max(1);
        let width = |w: usize| (w / divisor).max(1);

        let mut encoder = Vec::with_capacity(ENCODER_LAYOUT.len());
        let mut channels = 3;
        for (stage, &(depth, out)) in ENCODER_LAYOUT.iter().enumerate() {
            let out = width(out);
            let convs = (0..depth)
                .map(|i| {
                    let name = format!("conv{}_{}", stage + 1, i + 1);
                    let conv = ConvSpec::same(name, channels, out, 3);
                    channels = out;
                    conv
                })
                .collect();
            encoder.push(EncoderStage { convs, pool: true });
        }

        let wide = width(BOTTLENECK_WIDTH);
        let bottleneck = vec![
            ConvSpec::same("conv6", channels, wide, 7),
            ConvSpec::same("conv7", wide, wide, 1),
        ];
        let classifier = ConvSpec::same("conv8", wide, num_outputs, 1).linear();

        let stage4 = width(ENCODER_LAYOUT[3].1);
        let stage3 = width(ENCODER_LAYOUT[2].1);
        let decoder = vec![
            DecoderSpec::upsample("deconv1", num_outputs, stage4, 2, Some(3)),
            DecoderSpec::upsample("deconv2", stage4, stage3, 2, Some(2)),
            DecoderSpec::upsample("deconv3", stage3, num_outputs, 8, None),
        ];

        Self {
            in_channels: 3,
            encoder,
            bottleneck,
            classifier,
            decoder,
        }
    }

    /// Number of classifier outputs (selected classes + "other").
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.decoder
            .last()
            .map_or(self.classifier.out_channels, |d| d.out_channels)
    }

    /// Every parameterised stage in allocation order.
    #[must_use]
    pub fn params(&self) -> Vec<ParamSpec> {
        let convs = self
            .encoder
            .iter()
            .flat_map(|s| s.convs.iter())
            .chain(self.bottleneck.iter())
            .chain(std::iter::once(&self.classifier))
            .map(|c| ParamSpec {
                name: c.name.clone(),
                weight_shape: c.weight_shape(),
                bias_len: c.out_channels,
            });
        let deconvs = self.decoder.iter().map(|d| ParamSpec {
            name: d.name.clone(),
            weight_shape: d.weight_shape(),
            bias_len: d.out_channels,
        });
        convs.chain(deconvs).collect()
    }

    /// Checks that channel counts chain and every fusion is well-formed.
    ///
    /// # Errors
    ///
    /// Returns `SceneSegError::InvalidTopology` describing the first break.
    pub fn validate(&self) -> Result<()> {
        let mismatch = |what: &str, expected: usize, got: usize| {
            Err(SceneSegError::InvalidTopology(format!(
                "{what} expects {expected} input channels, receives {got}"
            )))
        };

        let mut channels = self.in_channels;
        let mut stage_channels = Vec::with_capacity(self.encoder.len());
        for stage in &self.encoder {
            for conv in &stage.convs {
                if conv.in_channels != channels {
                    return mismatch(&conv.name, conv.in_channels, channels);
                }
                channels = conv.out_channels;
            }
            stage_channels.push(channels);
        }
        for conv in self.bottleneck.iter().chain(std::iter::once(&self.classifier)) {
            if conv.in_channels != channels {
                return mismatch(&conv.name, conv.in_channels, channels);
            }
            channels = conv.out_channels;
        }
        for deconv in &self.decoder {
            if deconv.in_channels != channels {
                return mismatch(&deconv.name, deconv.in_channels, channels);
            }
            if let Some(stage) = deconv.fuse {
                let Some(&skip) = stage_channels.get(stage) else {
                    return Err(SceneSegError::InvalidTopology(format!(
                        "{} fuses with missing encoder stage {stage}",
                        deconv.name
                    )));
                };
                if skip != deconv.out_channels {
                    return Err(SceneSegError::InvalidTopology(format!(
                        "{} outputs {} channels, encoder stage {stage} has {skip}",
                        deconv.name, deconv.out_channels
                    )));
                }
            }
            channels = deconv.out_channels;
        }
        if self.decoder.last().is_some_and(|d| d.fuse.is_some()) {
            return Err(SceneSegError::InvalidTopology(
                "the last decoder stage must upsample to the input extent".into(),
            ));
        }

        let params = self.params();
        let mut names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(SceneSegError::InvalidTopology("duplicate layer names".into()));
        }
        Ok(())
    }
}
