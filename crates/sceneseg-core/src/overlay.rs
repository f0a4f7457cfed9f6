//! # Inference / Export
//!
//! Runs a trained network over raw images and writes colour-coded class
//! overlays composited onto the originals.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use tracing::info;

use crate::error::{Result, SceneSegError};
use crate::network::SegNet;
use crate::preprocess::{decode_rgb, to_canvas_tensor};
use crate::types::{Canvas, ClassSet};

/// Opacity of the class overlay.
pub const OVERLAY_ALPHA: f32 = 0.5;

/// Suffix appended to an input's base name.
pub const OUTPUT_SUFFIX: &str = "_seg.png";

/// Directory, relative to the input location, that receives overlays.
pub const RESULTS_DIR: &str = "Results";

/// Resolution recorded in every overlay.
pub const OUTPUT_DPI: u32 = 200;

const INCHES_PER_METER: f64 = 1.0 / 0.0254;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Paints a `(height, width)` class map with the palette.
pub fn colorize(prediction: &Tensor, classes: &ClassSet) -> Result<RgbImage> {
    let (h, w) = prediction.dims2()?;
    let classes_per_pixel: Vec<u32> = prediction.flatten_all()?.to_vec1()?;
    let mut img = RgbImage::new(w as u32, h as u32);
    for (pixel, &class) in img.pixels_mut().zip(classes_per_pixel.iter()) {
        *pixel = Rgb(classes.color(class as usize));
    }
    Ok(img)
}

/// Blends `overlay` onto `original` at `alpha`.
///
/// The overlay is resized to the original raster with nearest-neighbour
/// sampling, so class boundaries stay hard and the output keeps the
/// original's dimensions.
#[must_use]
pub fn composite(original: &RgbImage, overlay: &RgbImage, alpha: f32) -> RgbaImage {
    let (w, h) = original.dimensions();
    let overlay = if overlay.dimensions() == (w, h) {
        overlay.clone()
    } else {
        image::imageops::resize(overlay, w, h, FilterType::Nearest)
    };
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = RgbaImage::new(w, h);
    for ((dst, src), paint) in out.pixels_mut().zip(original.pixels()).zip(overlay.pixels()) {
        let mix = |i: usize| {
            (f32::from(src[i]) * (1.0 - alpha) + f32::from(paint[i]) * alpha).round() as u8
        };
        *dst = Rgba([mix(0), mix(1), mix(2), u8::MAX]);
    }
    out
}

/// Output path for `input` inside `out_dir`: `<basename>_seg.png`.
#[must_use]
pub fn output_path(input: &Path, out_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    out_dir.join(format!("{stem}{OUTPUT_SUFFIX}"))
}

/// Writes `img` as an RGBA PNG whose `pHYs` chunk records `dpi`.
pub fn save_png(img: &RgbaImage, path: &Path, dpi: u32) -> Result<()> {
    let file = File::create(path).map_err(|e| SceneSegError::io(path, e))?;
    let encode_err = |source| SceneSegError::ImageEncode {
        path: path.to_path_buf(),
        source,
    };
    let ppm = (f64::from(dpi) * INCHES_PER_METER).round() as u32;
    let mut encoder = png::Encoder::new(BufWriter::new(file), img.width(), img.height());
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_pixel_dims(Some(png::PixelDimensions {
        xppu: ppm,
        yppu: ppm,
        unit: png::Unit::Meter,
    }));
    let mut writer = encoder.write_header().map_err(encode_err)?;
    writer.write_image_data(img.as_raw()).map_err(encode_err)?;
    writer.finish().map_err(encode_err)?;
    Ok(())
}

/// Result directory for inputs living in `input_dir`.
#[must_use]
pub fn results_dir(input_dir: &Path, classes: &ClassSet) -> PathBuf {
    input_dir.join(RESULTS_DIR).join(classes.tag())
}

/// Runs a trained network over images and writes overlays.
pub struct Visualizer {
    model: SegNet,
    classes: ClassSet,
    canvas: Canvas,
    device: Device,
}

impl Visualizer {
    #[must_use]
    pub fn new(model: SegNet, classes: ClassSet, canvas: Canvas, device: Device) -> Self {
        Self {
            model,
            classes,
            canvas,
            device,
        }
    }

    /// Decodes `path`, runs it through the network with dropout disabled and
    /// returns the original raster with its `(height, width)` class map.
    pub fn predict(&self, path: &Path) -> Result<(RgbImage, Tensor)> {
        let original = decode_rgb(path)?;
        let input = to_canvas_tensor(&original, self.canvas, &self.device)?.unsqueeze(0)?;
        let output = self.model.forward(&input, 1.0)?;
        let prediction = output.prediction.squeeze(3)?.squeeze(0)?;
        Ok((original, prediction))
    }

    /// Segments one image and writes its overlay into `out_dir`.
    pub fn segment_file(&self, path: &Path, out_dir: &Path) -> Result<PathBuf> {
        let (original, prediction) = self.predict(path)?;
        let overlay = colorize(&prediction, &self.classes)?;
        let blended = composite(&original, &overlay, OVERLAY_ALPHA);

        std::fs::create_dir_all(out_dir).map_err(|e| SceneSegError::io(out_dir, e))?;
        let out = output_path(path, out_dir);
        save_png(&blended, &out, OUTPUT_DPI)?;
        info!("Saved image : {}", out.display());
        Ok(out)
    }

    /// Segments one image into the results directory next to it.
    pub fn segment_image(&self, path: &Path) -> Result<PathBuf> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        self.segment_file(path, &results_dir(parent, &self.classes))
    }

    /// Segments every `.png`/`.jpg`/`.jpeg` file directly inside `dir`, in
    /// name order, into `<dir>/Results/<tag>/`.
    pub fn segment_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let out_dir = results_dir(dir, &self.classes);
        let mut inputs = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| SceneSegError::io(dir, e))? {
            let path = entry.map_err(|e| SceneSegError::io(dir, e))?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if path.is_file() && is_image {
                inputs.push(path);
            }
        }
        inputs.sort();
        inputs
            .iter()
            .map(|path| self.segment_file(path, &out_dir))
            .collect()
    }
}
