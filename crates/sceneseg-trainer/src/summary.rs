//! Training summaries written as TensorBoard event files: scalar curves plus
//! image snapshots of inputs, ground truth and predictions.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use candle_core::{DType, Tensor};
use tensorboard_rs::summary_writer::SummaryWriter as EventWriter;

/// File name prefix of TensorBoard event files.
pub const EVENTS_PREFIX: &str = "events.out.tfevents";
/// Images written per tag and step.
pub const MAX_IMAGES: usize = 2;

/// Appends summaries to an event file under one directory.
pub struct SummaryWriter {
    dir: PathBuf,
    events: EventWriter,
}

impl SummaryWriter {
    pub fn create(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let events = EventWriter::new(&dir);
        Ok(Self { dir, events })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scalar(&mut self, step: u64, tag: &str, value: f32) {
        self.events.add_scalar(tag, value, step as usize);
    }

    /// Writes up to [`MAX_IMAGES`] images from an NHWC batch with one or
    /// three channels as `{tag}/image/{i}`. Values are clamped to
    /// `[0, 255]`; grey images are expanded to RGB.
    pub fn image(&mut self, step: u64, tag: &str, batch: &Tensor) -> anyhow::Result<usize> {
        let (b, h, w, c) = batch.dims4()?;
        if c != 1 && c != 3 {
            bail!("summary image `{tag}` needs 1 or 3 channels, got {c}");
        }
        let pixels = batch
            .to_dtype(DType::F32)?
            .clamp(0f32, 255f32)?
            .to_dtype(DType::U8)?;

        let count = b.min(MAX_IMAGES);
        for i in 0..count {
            let mut rgb = pixels.get(i)?;
            if c == 1 {
                rgb = rgb.repeat((1, 1, 3))?;
            }
            // Interleaved HWC bytes, shape given as CHW.
            let raw = rgb.flatten_all()?.to_vec1::<u8>()?;
            self.events
                .add_image(&format!("{tag}/image/{i}"), &raw, &[3, h, w], step as usize);
        }
        Ok(count)
    }

    pub fn flush(&mut self) {
        self.events.flush();
    }
}

/// Spreads class indices `(B, H, W, 1)` over the grey range: index `i`
/// maps to `i · 255 / num_classes`.
pub fn label_intensity(indices: &Tensor, num_classes: usize) -> anyhow::Result<Tensor> {
    let scale = 255.0 / num_classes.max(1) as f64;
    Ok(indices.to_dtype(DType::F32)?.affine(scale, 0.0)?.floor()?)
}

/// Event files under a writer directory, sorted by name.
pub fn event_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let is_events = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(EVENTS_PREFIX));
        if path.is_file() && is_events {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
