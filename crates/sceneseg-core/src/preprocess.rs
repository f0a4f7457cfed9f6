//! Image decoding and canvas resizing.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use image::imageops::FilterType;

use crate::error::{Result, SceneSegError};
use crate::types::Canvas;

/// Decodes any supported image file into RGB8.
pub fn decode_rgb(path: &Path) -> Result<RgbImage> {
    let img = image::open(path).map_err(|source| SceneSegError::ImageDecode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(img.to_rgb8())
}

/// Bilinearly resizes an RGB image to the canvas and returns it as an
/// `(height, width, 3)` f32 tensor with values in `[0, 255]`.
pub fn to_canvas_tensor(img: &RgbImage, canvas: Canvas, device: &Device) -> Result<Tensor> {
    let resized = if img.dimensions() == (canvas.width as u32, canvas.height as u32) {
        img.clone()
    } else {
        image::imageops::resize(
            img,
            canvas.width as u32,
            canvas.height as u32,
            FilterType::Triangle,
        )
    };
    let raw = resized.into_raw();
    let tensor = Tensor::from_vec(raw, (canvas.height, canvas.width, 3), device)?;
    Ok(tensor.to_dtype(DType::F32)?)
}

/// Decodes `path` and resizes it onto the canvas.
///
/// Also returns the original `(width, height)` so predictions can be mapped
/// back onto the source raster.
pub fn load_canvas_image(
    path: &Path,
    canvas: Canvas,
    device: &Device,
) -> Result<(Tensor, (u32, u32))> {
    let img = decode_rgb(path)?;
    let dims = img.dimensions();
    Ok((to_canvas_tensor(&img, canvas, device)?, dims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn resizes_to_canvas_layout() {
        let img = RgbImage::from_pixel(40, 20, Rgb([10, 20, 30]));
        let tensor = to_canvas_tensor(&img, Canvas::new(16, 32), &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[16, 32, 3]);
        let pixel: Vec<f32> = tensor.get(5).unwrap().get(7).unwrap().to_vec1().unwrap();
        assert_eq!(pixel, vec![10., 20., 30.]);
    }

    #[test]
    fn reports_original_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbImage::from_pixel(50, 30, Rgb([255, 0, 0])).save(&path).unwrap();
        let (tensor, dims) = load_canvas_image(&path, Canvas::new(16, 16), &Device::Cpu).unwrap();
        assert_eq!(dims, (50, 30));
        assert_eq!(tensor.dims(), &[16, 16, 3]);
    }

    #[test]
    fn undecodable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert!(matches!(
            decode_rgb(&path),
            Err(SceneSegError::ImageDecode { .. })
        ));
    }
}
