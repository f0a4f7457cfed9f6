//! Training loop for the segmentation network.

use anyhow::{Context, bail};
use candle_core::{D, Device, Tensor};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};
use sceneseg_core::{PixelAccuracy, SegNet, SegOutput, pixel_accuracy, segmentation_loss};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{TrainConfig, step_budget};
use crate::data::{Batch, Pipelines, Split, StreamConfig};
use crate::optim::Adam;
use crate::summary::{SummaryWriter, label_intensity};

pub const CONFIG_FILE: &str = "config.json";
const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Restoring,
    Stepping,
    Evaluating,
    Checkpointing,
    Done,
}

/// Mutable loop state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainState {
    /// Optimizer steps applied so far, including restored ones.
    pub step: u64,
}

/// Loss and accuracy for one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss: f32,
    pub accuracy: PixelAccuracy,
}

pub struct Trainer {
    config: TrainConfig,
    device: Device,
    varmap: VarMap,
    model: SegNet,
    optimizer: Adam,
    checkpoints: CheckpointStore,
    train_writer: SummaryWriter,
    valid_writer: SummaryWriter,
    state: TrainState,
    phase: Phase,
}

impl Trainer {
    /// Builds the model, restores the latest checkpoint under the run's log
    /// directory if there is one, and sets up the optimizer and summary
    /// writers.
    pub fn new(config: TrainConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let log_dir = config.log_dir();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating {}", log_dir.display()))?;
        config.save(&log_dir.join(CONFIG_FILE))?;

        let device = select_device(config.use_cuda)?;
        let mut varmap = VarMap::new();
        let model = SegNet::new(config.topology(), &varmap, &device, config.seed)?;
        info!(
            classes = %config.classes,
            params = model.parameter_names().len(),
            "network ready"
        );

        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: ADAM_BETA1,
            beta2: ADAM_BETA2,
            eps: ADAM_EPSILON,
            weight_decay: 0.0,
        };
        let mut optimizer = Adam::from_varmap(&varmap, params)?;

        let checkpoints = CheckpointStore::new(&log_dir).with_keep(config.keep_checkpoints);
        let mut state = TrainState::default();
        let mut phase = Phase::Initializing;
        if let Some(step) = checkpoints.restore(&mut varmap, Some(&mut optimizer))? {
            println!("Model restored...");
            state.step = step;
            phase = Phase::Restoring;
        }

        Ok(Self {
            train_writer: SummaryWriter::create(log_dir.join("train"))?,
            valid_writer: SummaryWriter::create(log_dir.join("valid"))?,
            config,
            device,
            varmap,
            model,
            optimizer,
            checkpoints,
            state,
            phase,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &SegNet {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Total optimizer steps for a training split of `train_len` samples.
    pub fn budget(&self, train_len: usize) -> u64 {
        let size = self.config.dataset_size.unwrap_or(train_len);
        step_budget(self.config.epochs, size, self.config.batch_size)
    }

    /// One optimizer step on `batch` with the training keep probability.
    /// Returns the loss before the update.
    pub fn train_step(&mut self, batch: &Batch) -> anyhow::Result<f32> {
        self.enter(Phase::Stepping);
        let batch = batch.to_device(&self.device)?;
        let out = self.model.forward(&batch.images, self.config.keep_prob)?;
        let loss = self.loss(&out, &batch.labels)?;
        self.optimizer.backward_step(&loss)?;
        self.state.step += 1;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Loss and pixel accuracy on `batch` without updating parameters.
    pub fn evaluate(&mut self, batch: &Batch, keep_prob: f32) -> anyhow::Result<EvalMetrics> {
        Ok(self.inspect(batch, keep_prob)?.0)
    }

    /// Saves the current parameters and optimizer state under the current
    /// step.
    pub fn checkpoint(&mut self) -> anyhow::Result<()> {
        self.enter(Phase::Checkpointing);
        self.checkpoints
            .save(&self.varmap, Some(&self.optimizer), self.state.step)?;
        Ok(())
    }

    /// Steps until the budget is spent.
    ///
    /// With `s` the zero-based label of the step just taken: every
    /// `log_every` steps the same training batch is re-evaluated and
    /// reported; every `checkpoint_every` steps a validation batch is
    /// evaluated with dropout off and a checkpoint is written.
    pub fn run(&mut self, pipelines: &mut Pipelines) -> anyhow::Result<TrainState> {
        let budget = self.budget(pipelines.train.len());
        println!(
            "Number of epochs: {}, Batch size: {}, Max iterations: {}",
            self.config.epochs, self.config.batch_size, budget
        );
        info!(start = self.state.step, budget, "starting training");

        while self.state.step < budget {
            let batch = pipelines.select(Split::Train).next_batch()?;
            self.train_step(&batch)?;
            let s = self.state.step - 1;

            if s % self.config.log_every == 0 {
                let (metrics, out) = self.inspect(&batch, self.config.keep_prob)?;
                println!(
                    "Step: {s}, Train_loss:{}, Train_acc:{}",
                    metrics.loss,
                    metrics.accuracy.value()
                );
                self.summarize(Split::Train, s, &batch, &metrics, &out)?;
            }

            if s % self.config.checkpoint_every == 0 {
                let val = pipelines.select(Split::Val).next_batch()?;
                let (metrics, out) = self.inspect(&val, 1.0)?;
                println!(
                    "{} ---> Validation_loss:{}, Validation_acc:{}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
                    metrics.loss,
                    metrics.accuracy.value()
                );
                self.summarize(Split::Val, s, &val, &metrics, &out)?;
                self.checkpoint()?;
            }
        }

        let last_saved = self.checkpoints.latest()?.map(|index| index.step);
        if self.state.step > 0 && last_saved != Some(self.state.step) {
            self.checkpoint()?;
        }
        self.enter(Phase::Done);
        info!(step = self.state.step, "training finished");
        Ok(self.state)
    }

    fn loss(&self, out: &SegOutput, labels: &Tensor) -> anyhow::Result<Tensor> {
        let reg = self.model.regularization()?;
        Ok(segmentation_loss(
            &out.logits,
            labels,
            &reg,
            self.config.regularization_scale,
        )?)
    }

    fn inspect(
        &mut self,
        batch: &Batch,
        keep_prob: f32,
    ) -> anyhow::Result<(EvalMetrics, SegOutput)> {
        self.enter(Phase::Evaluating);
        let batch = batch.to_device(&self.device)?;
        let out = self.model.forward(&batch.images, keep_prob)?;
        let loss = self.loss(&out, &batch.labels)?.to_scalar::<f32>()?;
        let other = self.config.classes.other_index();
        let accuracy = pixel_accuracy(&out.prediction, &batch.labels, other)?;
        Ok((EvalMetrics { loss, accuracy }, out))
    }

    fn summarize(
        &mut self,
        split: Split,
        step: u64,
        batch: &Batch,
        metrics: &EvalMetrics,
        out: &SegOutput,
    ) -> anyhow::Result<()> {
        let num_classes = self.config.classes.len();
        let truth = batch.labels.argmax_keepdim(D::Minus1)?;
        let writer = match split {
            Split::Train => &mut self.train_writer,
            Split::Val => &mut self.valid_writer,
        };
        writer.scalar(step, "entropy_loss", metrics.loss);
        writer.scalar(step, "pixel_accuracy", metrics.accuracy.value());
        writer.image(step, "input_image", &batch.images)?;
        writer.image(step, "ground_truth", &label_intensity(&truth, num_classes)?)?;
        writer.image(step, "pred_label", &label_intensity(&out.prediction, num_classes)?)?;
        writer.flush();
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, step = self.state.step, "phase");
            self.phase = phase;
        }
    }
}

/// CUDA device 0 when requested and available, CPU otherwise.
///
/// CUDA needs the `cuda` feature; without it a request falls back to the
/// CPU with a warning.
pub fn select_device(use_cuda: bool) -> anyhow::Result<Device> {
    if !use_cuda {
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    if device.is_cpu() {
        warn!("CUDA requested but built without the `cuda` feature, running on CPU");
    }
    Ok(device)
}

/// Rebuilds the network for `config` and loads its latest checkpoint.
///
/// Fails when the run's log directory holds no checkpoint.
pub fn restore_model(config: &TrainConfig, device: &Device) -> anyhow::Result<(SegNet, u64)> {
    config.validate()?;
    let mut varmap = VarMap::new();
    let model = SegNet::new(config.topology(), &varmap, device, config.seed)?;
    let store = CheckpointStore::new(config.log_dir());
    match store.restore(&mut varmap, None)? {
        Some(step) => Ok((model, step)),
        None => bail!("no checkpoint found in {}", config.log_dir().display()),
    }
}

/// Stream settings derived from a training configuration.
pub fn stream_config(config: &TrainConfig) -> StreamConfig {
    StreamConfig {
        batch_size: config.batch_size,
        canvas: config.canvas,
        classes: config.classes.clone(),
        shuffle: config.shuffle,
        seed: config.seed,
        prefetch: config.prefetch,
    }
}

/// Opens both dataset splits and trains until the step budget is reached.
pub fn run_training(config: TrainConfig) -> anyhow::Result<TrainState> {
    config.validate()?;
    println!("Setting up dataset reader");
    let mut pipelines = Pipelines::open(&config.dataset_dir, stream_config(&config))?;
    let mut trainer = Trainer::new(config)?;
    trainer.run(&mut pipelines)
}
