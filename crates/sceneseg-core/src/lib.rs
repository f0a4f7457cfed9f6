//! # SceneSeg Core
//!
//! Street-scene semantic segmentation: a VGG-style fully-convolutional
//! network with additive skip connections, the label materializer that
//! turns per-class indicator matrices into one-hot targets, loss and
//! accuracy metrics, and the overlay exporter.
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::VarMap;
//! use sceneseg_core::{ClassSet, SegNet, Topology};
//!
//! let classes = ClassSet::new(vec![0, 13]).unwrap();
//! let varmap = VarMap::new();
//! let topology = Topology::vgg_skip_slim(classes.num_outputs(), 32);
//! let net = SegNet::new(topology, &varmap, &Device::Cpu, 42).unwrap();
//!
//! let images = Tensor::zeros((1, 32, 64, 3), DType::F32, &Device::Cpu).unwrap();
//! let out = net.forward(&images, 1.0).unwrap();
//! assert_eq!(out.logits.dims(), &[1, 32, 64, 3]);
//! assert_eq!(out.prediction.dims(), &[1, 32, 64, 1]);
//! ```
pub mod error;
pub mod label;
pub mod metrics;
pub mod network;
pub mod overlay;
pub mod preprocess;
pub mod types;

// Re-export primary API
pub use error::{Result, SceneSegError};
pub use metrics::{PixelAccuracy, pixel_accuracy, segmentation_loss, sigmoid_cross_entropy};
pub use network::{SegNet, SegOutput, Topology};
pub use overlay::Visualizer;
pub use types::{CITYSCAPES_CLASSES, CITYSCAPES_PALETTE, Canvas, ClassSet};
