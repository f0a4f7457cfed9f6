//! # SceneSeg Trainer
//!
//! Everything around the network needed to train it: run configuration,
//! the prefetching sample pipeline over a Cityscapes-style dataset tree,
//! the optimizer, checkpoint snapshots, training summaries and the
//! training loop itself.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod optim;
pub mod summary;
pub mod trainer;

pub use checkpoint::CheckpointStore;
pub use config::{TrainConfig, step_budget};
pub use data::{Batch, BatchStream, Pipelines, SampleIndex, Split, StreamConfig};
pub use summary::SummaryWriter;
pub use optim::Adam;
pub use trainer::{
    EvalMetrics, Phase, TrainState, Trainer, restore_model, run_training, select_device,
};
