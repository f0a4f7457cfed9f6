//! SceneSeg command-line tool
//!
//! Trains the segmentation network on a Cityscapes-layout dataset, or
//! overlays predictions from the latest checkpoint on images.
//!
//! ```text
//! sceneseg --mode train --dataset DATA_DIR
//! sceneseg --mode visualize --image IMAGE_PATH
//! sceneseg --mode visualize --imagedir IMAGE_FOLDER_DIR
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, ValueEnum};
use sceneseg_core::{ClassSet, Visualizer};
use sceneseg_trainer::{TrainConfig, restore_model, run_training, select_device};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Train,
    Visualize,
}

/// CLI arguments
#[derive(Debug, Parser)]
#[command(name = "sceneseg")]
#[command(about = "Train or apply the street-scene segmentation network")]
#[command(version)]
struct Cli {
    /// What to do
    #[arg(long, value_enum)]
    mode: Mode,

    /// Dataset root with train/ and val/ splits
    #[arg(long, env = "SCENESEG_DATASET", required_if_eq("mode", "train"))]
    dataset: Option<PathBuf>,

    /// Image to segment
    #[arg(long)]
    image: Option<PathBuf>,

    /// Directory of .png/.jpg images to segment
    #[arg(long)]
    imagedir: Option<PathBuf>,

    /// Number of epochs
    #[arg(long, env = "SCENESEG_EPOCHS")]
    epochs: Option<usize>,

    /// Images per batch
    #[arg(long, env = "SCENESEG_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Adam learning rate
    #[arg(long, env = "SCENESEG_LEARNING_RATE")]
    learning_rate: Option<f64>,

    /// Parent directory of per-run logs and checkpoints
    #[arg(long, env = "SCENESEG_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Comma-separated Cityscapes class indices to train (0-18)
    #[arg(long, value_delimiter = ',')]
    classes: Option<Vec<usize>>,

    /// Seed for weight initialisation and shuffling
    #[arg(long, env = "SCENESEG_SEED")]
    seed: Option<u64>,

    /// Divide hidden layer widths by this factor
    #[arg(long)]
    slim: Option<usize>,

    /// Run on CUDA device 0 (needs a build with the `cuda` feature)
    #[arg(long)]
    cuda: bool,
}

impl Cli {
    /// Merges the flags into a training configuration.
    fn train_config(&self) -> std::result::Result<TrainConfig, (ErrorKind, String)> {
        let mut config = TrainConfig::new(self.dataset.clone().unwrap_or_default())
            .with_slim(self.slim)
            .with_cuda(self.cuda);
        if let Some(epochs) = self.epochs {
            config = config.with_epochs(epochs);
        }
        if let Some(batch_size) = self.batch_size {
            config = config.with_batch_size(batch_size);
        }
        if let Some(lr) = self.learning_rate {
            config = config.with_learning_rate(lr);
        }
        if let Some(log_dir) = &self.log_dir {
            config = config.with_log_root(log_dir);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        if let Some(classes) = &self.classes {
            let classes = ClassSet::new(classes.clone())
                .map_err(|e| (ErrorKind::ValueValidation, e.to_string()))?;
            config = config.with_classes(classes);
        }
        config
            .validate()
            .map_err(|e| (ErrorKind::ValueValidation, format!("{e:#}")))?;
        Ok(config)
    }

    fn check(&self) -> std::result::Result<TrainConfig, (ErrorKind, String)> {
        if self.mode == Mode::Visualize && self.image.is_none() && self.imagedir.is_none() {
            return Err((
                ErrorKind::MissingRequiredArgument,
                "visualize mode needs --image or --imagedir".to_string(),
            ));
        }
        self.train_config()
    }
}

fn train(config: TrainConfig) -> Result<()> {
    let state = run_training(config)?;
    info!(step = state.step, "done");
    Ok(())
}

fn visualize(
    config: TrainConfig,
    image: Option<PathBuf>,
    imagedir: Option<PathBuf>,
) -> Result<()> {
    let device = select_device(config.use_cuda)?;
    let (model, step) = restore_model(&config, &device)?;
    println!("Model restored...");
    info!(step, classes = %config.classes, "loaded checkpoint");
    let visualizer = Visualizer::new(model, config.classes.clone(), config.canvas, device);

    if let Some(path) = image {
        let out = visualizer
            .segment_image(&path)
            .with_context(|| format!("segmenting {}", path.display()))?;
        println!("Saved image : {}", out.display());
    }
    if let Some(dir) = imagedir {
        let outputs = visualizer
            .segment_dir(&dir)
            .with_context(|| format!("segmenting images in {}", dir.display()))?;
        for out in &outputs {
            println!("Saved image : {}", out.display());
        }
        info!(count = outputs.len(), "directory done");
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.check() {
        Ok(config) => config,
        Err((kind, message)) => Cli::command().error(kind, message).exit(),
    };

    let result = match cli.mode {
        Mode::Train => train(config),
        Mode::Visualize => visualize(config, cli.image, cli.imagedir),
    };
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("sceneseg").chain(args.iter().copied()))
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn train_requires_dataset() {
        if std::env::var_os("SCENESEG_DATASET").is_some() {
            return;
        }
        let err = parse(&["--mode", "train"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = parse(&["--mode", "export"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn visualize_needs_an_input() {
        let cli = parse(&["--mode", "visualize"]).unwrap();
        let (kind, _) = cli.check().unwrap_err();
        assert_eq!(kind, ErrorKind::MissingRequiredArgument);

        let cli = parse(&["--mode", "visualize", "--imagedir", "photos"]).unwrap();
        assert!(cli.check().is_ok());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = parse(&[
            "--mode",
            "train",
            "--dataset",
            "/data/cityscapes",
            "--epochs",
            "2",
            "--batch-size",
            "4",
            "--classes",
            "0,10,13",
            "--log-dir",
            "/tmp/runs",
            "--slim",
            "8",
        ])
        .unwrap();
        let config = cli.check().unwrap();
        assert_eq!(config.dataset_dir, PathBuf::from("/data/cityscapes"));
        assert_eq!(config.epochs, 2);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.classes.indices(), &[0, 10, 13]);
        assert_eq!(config.slim, Some(8));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/runs/VGG_skip_c3"));
    }

    #[test]
    fn invalid_values_are_usage_errors() {
        let cli = parse(&["--mode", "train", "--dataset", "d", "--classes", "0,19"]).unwrap();
        assert_eq!(cli.check().unwrap_err().0, ErrorKind::ValueValidation);

        let cli = parse(&["--mode", "train", "--dataset", "d", "--batch-size", "0"]).unwrap();
        assert_eq!(cli.check().unwrap_err().0, ErrorKind::ValueValidation);
    }
}
