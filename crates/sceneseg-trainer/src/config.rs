//! Training run configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use sceneseg_core::{Canvas, ClassSet, Topology};
use serde::{Deserialize, Serialize};

pub const LEARNING_RATE: f64 = 1e-4;
pub const REGULARIZATION_SCALE: f64 = 1e-5;
pub const BATCH_SIZE: usize = 2;
pub const NUM_OF_EPOCHS: usize = 30;
pub const TRAIN_KEEP_PROB: f32 = 0.85;
pub const LOG_EVERY: u64 = 10;
pub const CHECKPOINT_EVERY: u64 = 100;
pub const PREFETCH_DEPTH: usize = 4;
pub const KEEP_CHECKPOINTS: usize = 2;

/// Everything a training run needs, with defaults for each knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Dataset root containing `train/` and `val/` splits.
    pub dataset_dir: PathBuf,
    /// Parent of the per-run log directory.
    pub log_root: PathBuf,
    pub classes: ClassSet,
    pub canvas: Canvas,
    pub batch_size: usize,
    pub epochs: usize,
    /// Overrides the training split size in the step budget.
    pub dataset_size: Option<usize>,
    pub learning_rate: f64,
    pub regularization_scale: f64,
    /// Dropout keep probability while training; evaluation on validation
    /// batches always uses 1.0.
    pub keep_prob: f32,
    pub log_every: u64,
    pub checkpoint_every: u64,
    pub prefetch: usize,
    pub keep_checkpoints: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Divide hidden widths by this factor; `None` trains the full network.
    pub slim: Option<usize>,
    pub use_cuda: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("data/cityscapes"),
            log_root: PathBuf::from("logs"),
            classes: ClassSet::all(),
            canvas: Canvas::default(),
            batch_size: BATCH_SIZE,
            epochs: NUM_OF_EPOCHS,
            dataset_size: None,
            learning_rate: LEARNING_RATE,
            regularization_scale: REGULARIZATION_SCALE,
            keep_prob: TRAIN_KEEP_PROB,
            log_every: LOG_EVERY,
            checkpoint_every: CHECKPOINT_EVERY,
            prefetch: PREFETCH_DEPTH,
            keep_checkpoints: KEEP_CHECKPOINTS,
            shuffle: true,
            seed: 0,
            slim: None,
            use_cuda: false,
        }
    }
}

impl TrainConfig {
    /// Create a new training configuration with default settings.
    pub fn new(dataset_dir: impl Into<PathBuf>) -> Self {
        Self {
            dataset_dir: dataset_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_log_root(mut self, log_root: impl Into<PathBuf>) -> Self {
        self.log_root = log_root.into();
        self
    }

    pub fn with_classes(mut self, classes: ClassSet) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_canvas(mut self, canvas: Canvas) -> Self {
        self.canvas = canvas;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_dataset_size(mut self, size: usize) -> Self {
        self.dataset_size = Some(size);
        self
    }

    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set the training keep probability, clamped to `[0.0, 1.0]`.
    pub fn with_keep_prob(mut self, keep_prob: f32) -> Self {
        self.keep_prob = keep_prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_schedule(mut self, log_every: u64, checkpoint_every: u64) -> Self {
        self.log_every = log_every;
        self.checkpoint_every = checkpoint_every;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_slim(mut self, divisor: Option<usize>) -> Self {
        self.slim = divisor;
        self
    }

    pub fn with_cuda(mut self, enabled: bool) -> Self {
        self.use_cuda = enabled;
        self
    }

    /// Per-run directory holding checkpoints and summaries, derived from
    /// the selected class count, e.g. `logs/VGG_skip_c19`.
    pub fn log_dir(&self) -> PathBuf {
        self.log_root.join(self.classes.tag())
    }

    /// Network layout for this run.
    pub fn topology(&self) -> Topology {
        match self.slim {
            Some(divisor) => Topology::vgg_skip_slim(self.classes.num_outputs(), divisor),
            None => Topology::vgg_skip(self.classes.num_outputs()),
        }
    }

    /// Rejects settings the loop cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.canvas.validate()?;
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            bail!("keep probability must be in (0, 1], got {}", self.keep_prob);
        }
        if self.log_every == 0 || self.checkpoint_every == 0 {
            bail!("log and checkpoint intervals must be positive");
        }
        if self.slim == Some(0) {
            bail!("slim divisor must be positive");
        }
        Ok(())
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Number of optimizer steps for a run: `epochs × dataset_size / batch`,
/// rounded to the nearest integer.
pub fn step_budget(epochs: usize, dataset_size: usize, batch_size: usize) -> u64 {
    if batch_size == 0 {
        return 0;
    }
    (epochs as f64 * dataset_size as f64 / batch_size as f64).round() as u64
}
