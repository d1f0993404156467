use anyhow::{Context, Result};
use burn::prelude::*;
use gif::{Encoder, Frame, Repeat};
use image::{GenericImage, Rgb, RgbImage};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Map [-1, 1] normalized values back to [0, 1].
pub fn scale_back(value: f32) -> f32 {
    (value + 1.0) * 0.5
}

/// Convert a BCHW tensor in [-1, 1] to a vector of RGB images.
///
/// Single-channel tensors are expanded to gray RGB.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 3 && channels != 1 {
        return Err(anyhow::anyhow!(
            "expected 1 or 3 channels for images, got {channels}"
        ));
    }

    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))?;
    let hw = height * width;
    let to_u8 = |v: f32| (scale_back(v).clamp(0.0, 1.0) * 255.0) as u8;

    let images = (0..batch)
        .map(|b| {
            let base = b * channels * hw;
            RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let idx = base + y as usize * width + x as usize;
                if channels == 1 {
                    let v = to_u8(values[idx]);
                    Rgb([v, v, v])
                } else {
                    Rgb([
                        to_u8(values[idx]),
                        to_u8(values[idx + hw]),
                        to_u8(values[idx + 2 * hw]),
                    ])
                }
            })
        })
        .collect();

    Ok(images)
}

/// Row-major grid layout for sample sheets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleGrid {
    pub rows: usize,
    pub cols: usize,
}

impl SampleGrid {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn capacity(&self) -> usize {
        self.rows * self.cols
    }

    /// Tile the first `rows * cols` images row-major; extra images are unused.
    pub fn render(&self, images: &[RgbImage]) -> Result<RgbImage> {
        let first = images
            .first()
            .ok_or_else(|| anyhow::anyhow!("no images to merge"))?;
        let (width, height) = first.dimensions();
        let mut out = RgbImage::new(width * self.cols as u32, height * self.rows as u32);

        for (idx, img) in images.iter().take(self.capacity()).enumerate() {
            let row = (idx / self.cols) as u32;
            let col = (idx % self.cols) as u32;
            out.copy_from(img, col * width, row * height)
                .context("failed to copy image into grid")?;
        }

        Ok(out)
    }

    /// Render and write the grid as a PNG, creating parent directories.
    pub fn save(&self, images: &[RgbImage], path: &Path) -> Result<()> {
        let output = self.render(images)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        output
            .save(path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        Ok(())
    }
}

/// Compile a list of PNG frames into an animated GIF.
///
/// Frames are scaled by `scale` and shown for `delay` hundredths of a second.
pub fn compile_frames_to_gif_from_paths(
    frame_paths: &[PathBuf],
    gif_path: &Path,
    scale: f32,
    delay: u16,
) -> Result<()> {
    let first_path = frame_paths
        .first()
        .ok_or_else(|| anyhow::anyhow!("no frames provided for {}", gif_path.display()))?;

    let first = image::open(first_path)
        .with_context(|| format!("failed to open {}", first_path.display()))?
        .to_rgb8();
    let (width, height) = first.dimensions();
    let target_width = ((width as f32) * scale).max(1.0).round() as u32;
    let target_height = ((height as f32) * scale).max(1.0).round() as u32;

    let mut file = File::create(gif_path)
        .with_context(|| format!("failed to create {}", gif_path.display()))?;
    let mut encoder = Encoder::new(&mut file, target_width as u16, target_height as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    for frame_path in frame_paths {
        let img = image::open(frame_path)
            .with_context(|| format!("failed to open {}", frame_path.display()))?
            .to_rgb8();
        let resized = image::imageops::resize(
            &img,
            target_width,
            target_height,
            image::imageops::FilterType::Nearest,
        );
        let mut frame = Frame::from_rgb(target_width as u16, target_height as u16, resized.as_raw());
        frame.delay = delay;
        encoder.write_frame(&frame)?;
    }

    Ok(())
}

/// Compile the PNG sample grids in a directory, in file-name order, into a GIF.
pub fn compile_frames_to_gif(frame_dir: &Path, gif_path: &Path, scale: f32, delay: u16) -> Result<usize> {
    let mut frames: Vec<_> = glob::glob(&format!("{}/*.png", frame_dir.display()))?
        .filter_map(Result::ok)
        .collect();
    frames.sort();

    if frames.is_empty() {
        return Err(anyhow::anyhow!("no png frames found in {}", frame_dir.display()));
    }

    compile_frames_to_gif_from_paths(&frames, gif_path, scale, delay)?;
    Ok(frames.len())
}
