//! # SceneSeg
//!
//! Semantic segmentation of street scenes with a VGG-style network and
//! skip connections, trained on Cityscapes-layout datasets.
//!
//! This crate bundles the two layers:
//!
//! - [`base`]: network, label materializer, metrics and overlay export
//! - [`trainer`]: configuration, sample pipeline, checkpoints and the
//!   training loop

pub use sceneseg_core as base;
pub use sceneseg_trainer as trainer;

pub use sceneseg_core::{
    Canvas, ClassSet, PixelAccuracy, Result, SceneSegError, SegNet, SegOutput, Topology,
    Visualizer,
};
pub use sceneseg_trainer::{TrainConfig, Trainer, run_training};
