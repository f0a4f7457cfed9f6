//! Sample pipeline: dataset indexing, sample loading and prefetching batch
//! streams.
//!
//! Dataset layout:
//!
//! ```text
//! <root>/<split>/leftImg8bit/<stem>_leftImg8bit.png
//! <root>/<split>/gtCoarse/<stem>_gtCoarse_color.safetensors
//! ```

use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use anyhow::{Context, bail};
use candle_core::{Device, Tensor};
use crossbeam_channel::{Receiver, bounded};
use sceneseg_core::label::{materialize, resize_nearest};
use sceneseg_core::preprocess::load_canvas_image;
use sceneseg_core::{Canvas, ClassSet};
use tracing::{debug, info};

const IMAGE_DIR: &str = "leftImg8bit";
const LABEL_DIR: &str = "gtCoarse";
const IMAGE_SUFFIX: &str = "_leftImg8bit";
const LABEL_SUFFIX: &str = "_gtCoarse_color.safetensors";

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label file for an image: `<split_dir>/gtCoarse/<stem>_gtCoarse_color.safetensors`,
/// where `<stem>` is the image stem without its `_leftImg8bit` suffix.
pub fn label_path_for(image_path: &Path, split_dir: &Path) -> PathBuf {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = stem.strip_suffix(IMAGE_SUFFIX).unwrap_or(&stem);
    split_dir.join(LABEL_DIR).join(format!("{base}{LABEL_SUFFIX}"))
}

/// An image and its label file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePair {
    pub image: PathBuf,
    pub label: PathBuf,
}

/// Ordered list of samples in one split.
#[derive(Debug, Clone)]
pub struct SampleIndex {
    split: Split,
    pairs: Vec<SamplePair>,
}

impl SampleIndex {
    /// Lists `<root>/<split>/leftImg8bit/*.png` in name order and pairs each
    /// image with its derived label path. Label files are not checked here;
    /// a missing one fails when the sample is loaded.
    pub fn scan(root: &Path, split: Split) -> anyhow::Result<Self> {
        let split_dir = root.join(split.as_str());
        let image_dir = split_dir.join(IMAGE_DIR);
        let entries = std::fs::read_dir(&image_dir)
            .with_context(|| format!("listing {}", image_dir.display()))?;

        let mut images = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_png = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
            if path.is_file() && is_png {
                images.push(path);
            }
        }
        images.sort();
        if images.is_empty() {
            bail!("no images found in {}", image_dir.display());
        }

        let pairs = images
            .into_iter()
            .map(|image| {
                let label = label_path_for(&image, &split_dir);
                SamplePair { image, label }
            })
            .collect::<Vec<_>>();
        info!(split = %split, samples = pairs.len(), "indexed dataset split");
        Ok(Self { split, pairs })
    }

    pub fn from_pairs(split: Split, pairs: Vec<SamplePair>) -> anyhow::Result<Self> {
        if pairs.is_empty() {
            bail!("{split} split has no samples");
        }
        Ok(Self { split, pairs })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn pairs(&self) -> &[SamplePair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Loads one sample: the canvas-sized image `(H, W, 3)` and its one-hot
/// label `(H, W, C+1)`, nearest-resized onto the canvas when the label
/// matrix has a different extent.
pub fn load_sample(
    pair: &SamplePair,
    canvas: Canvas,
    classes: &ClassSet,
    device: &Device,
) -> anyhow::Result<(Tensor, Tensor)> {
    let (image, _) = load_canvas_image(&pair.image, canvas, device)?;
    let label = materialize(&pair.label, classes, device)?;
    let label = resize_nearest(&label, canvas)?;
    Ok((image, label))
}

/// A stacked batch: images `(B, H, W, 3)` and labels `(B, H, W, C+1)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies both tensors to `device`.
    pub fn to_device(&self, device: &Device) -> anyhow::Result<Self> {
        Ok(Self {
            images: self.images.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }
}

/// Loads and stacks a group of samples.
pub fn assemble_batch(
    pairs: &[SamplePair],
    canvas: Canvas,
    classes: &ClassSet,
    device: &Device,
) -> anyhow::Result<Batch> {
    let mut images = Vec::with_capacity(pairs.len());
    let mut labels = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let (image, label) = load_sample(pair, canvas, classes, device)
            .with_context(|| format!("loading sample {}", pair.image.display()))?;
        images.push(image);
        labels.push(label);
    }
    Ok(Batch {
        images: Tensor::stack(&images, 0)?,
        labels: Tensor::stack(&labels, 0)?,
    })
}

/// Settings for a [`BatchStream`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub batch_size: usize,
    pub canvas: Canvas,
    pub classes: ClassSet,
    /// Reshuffle the sample order at the start of every pass.
    pub shuffle: bool,
    pub seed: u64,
    /// Number of ready batches buffered ahead of the consumer.
    pub prefetch: usize,
}

/// Sample order for one pass over `len` samples.
///
/// Fisher-Yates with a generator seeded from `seed` and `pass`, so each
/// pass gets a different but reproducible order.
pub fn pass_order(len: usize, shuffle: bool, seed: u64, pass: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if shuffle && len > 1 {
        let mut rng = oorandom::Rand64::new(u128::from(seed) << 64 | u128::from(pass));
        for i in (1..len).rev() {
            let j = rng.rand_range(0..(i as u64 + 1)) as usize;
            order.swap(i, j);
        }
    }
    order
}

/// Endless stream of batches produced by a background worker.
///
/// The worker walks the sample list pass after pass. Within a pass samples
/// are grouped in order, so the final batch of a pass may be short. Ready
/// batches wait in a bounded queue. A load failure is forwarded once and
/// ends the stream.
pub struct BatchStream {
    index: SampleIndex,
    config: StreamConfig,
    rx: Receiver<anyhow::Result<Batch>>,
    worker: Option<JoinHandle<()>>,
    failed: bool,
}

impl BatchStream {
    pub fn spawn(index: SampleIndex, config: StreamConfig) -> anyhow::Result<Self> {
        if config.batch_size == 0 {
            bail!("batch size must be positive");
        }
        let (rx, worker) = spawn_worker(&index, &config);
        Ok(Self {
            index,
            config,
            rx,
            worker: Some(worker),
            failed: false,
        })
    }

    pub fn split(&self) -> Split {
        self.index.split()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Blocks until the next batch is ready.
    pub fn next_batch(&mut self) -> anyhow::Result<Batch> {
        if self.failed {
            bail!("{} pipeline stopped after an earlier failure", self.split());
        }
        match self.rx.recv() {
            Ok(Ok(batch)) => Ok(batch),
            Ok(Err(e)) => {
                self.failed = true;
                Err(e.context(format!("{} pipeline failed", self.split())))
            }
            Err(_) => {
                self.failed = true;
                bail!("{} pipeline worker exited", self.split())
            }
        }
    }

    /// Restarts the stream from the first pass.
    pub fn reset(&mut self) {
        self.stop();
        let (rx, worker) = spawn_worker(&self.index, &self.config);
        self.rx = rx;
        self.worker = Some(worker);
        self.failed = false;
        debug!(split = %self.split(), "pipeline reset");
    }

    fn stop(&mut self) {
        // Disconnecting the receiver unblocks a worker waiting on a full queue.
        self.rx = crossbeam_channel::never();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(
    index: &SampleIndex,
    config: &StreamConfig,
) -> (Receiver<anyhow::Result<Batch>>, JoinHandle<()>) {
    let (tx, rx) = bounded(config.prefetch.max(1));
    let pairs = index.pairs().to_vec();
    let split = index.split();
    let config = config.clone();
    let worker = thread::spawn(move || {
        let device = Device::Cpu;
        let mut pass = 0u64;
        loop {
            let order = pass_order(pairs.len(), config.shuffle, config.seed, pass);
            for chunk in order.chunks(config.batch_size) {
                let group: Vec<SamplePair> = chunk.iter().map(|&i| pairs[i].clone()).collect();
                let result = assemble_batch(&group, config.canvas, &config.classes, &device);
                let failed = result.is_err();
                if tx.send(result).is_err() || failed {
                    return;
                }
            }
            pass += 1;
            debug!(split = %split, pass, "pipeline pass complete");
        }
    });
    (rx, worker)
}

/// The training and validation streams.
pub struct Pipelines {
    pub train: BatchStream,
    pub val: BatchStream,
}

impl Pipelines {
    /// Scans both splits under `root` and starts their workers.
    ///
    /// Validation batches are never shuffled.
    pub fn open(root: &Path, config: StreamConfig) -> anyhow::Result<Self> {
        let train = SampleIndex::scan(root, Split::Train)?;
        let val = SampleIndex::scan(root, Split::Val)?;
        let val_config = StreamConfig {
            shuffle: false,
            ..config.clone()
        };
        Ok(Self {
            train: BatchStream::spawn(train, config)?,
            val: BatchStream::spawn(val, val_config)?,
        })
    }

    pub fn select(&mut self, split: Split) -> &mut BatchStream {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
        }
    }
}
