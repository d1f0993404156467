use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use npyz::{NpyFile, Order};
use rand::Rng;
use std::path::{Path, PathBuf};

/// Problems with the contents of a dataset file.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("unsupported array shape {shape:?} in {path}, expected [N, H, W, C] or [2, N, H, W, C] with non-zero H, W, C")]
    UnsupportedShape { path: PathBuf, shape: Vec<usize> },
    #[error("unsupported array dtype in {0}, expected uint8 or float32")]
    UnsupportedDtype(PathBuf),
    #[error("no images found in {0}")]
    Empty(PathBuf),
    #[error("dataset images are {found:?} (CHW) but the model expects {expected:?}")]
    ShapeMismatch { found: [usize; 3], expected: [usize; 3] },
}

/// Images held on the host as CHW floats in [-1, 1].
#[derive(Debug, Clone)]
pub struct ImageDataset {
    values: Vec<f32>,
    len: usize,
    dims: [usize; 3],
}

/// Train split plus an optional held-out split.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: ImageDataset,
    pub test: Option<ImageDataset>,
}

impl ImageDataset {
    /// Build from raw HWC pixel values in [0, 255], normalizing to [-1, 1].
    pub fn from_hwc(raw: &[f32], len: usize, height: usize, width: usize, channels: usize) -> Self {
        let image_len = height * width * channels;
        let mut values = Vec::with_capacity(len * image_len);
        for image in raw.chunks_exact(image_len).take(len) {
            values.extend(hwc_to_chw(image, height, width, channels));
        }
        Self {
            values,
            len,
            dims: [channels, height, width],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Per-image shape as `[channels, height, width]`.
    pub fn image_dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Fail unless every image has the shape the model consumes.
    pub fn ensure_dims(&self, expected: [usize; 3]) -> Result<(), DatasetError> {
        if self.dims != expected {
            return Err(DatasetError::ShapeMismatch {
                found: self.dims,
                expected,
            });
        }
        Ok(())
    }

    /// Draw `batch_size` indices uniformly with replacement.
    pub fn random_indices(&self, batch_size: usize, rng: &mut impl Rng) -> Vec<usize> {
        (0..batch_size).map(|_| rng.gen_range(0..self.len)).collect()
    }

    /// Gather the given images into a `[batch, C, H, W]` tensor.
    pub fn batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Tensor<B, 4> {
        let [channels, height, width] = self.dims;
        let image_len = channels * height * width;
        let mut batch = Vec::with_capacity(indices.len() * image_len);
        for &idx in indices {
            let start = idx * image_len;
            batch.extend_from_slice(&self.values[start..start + image_len]);
        }
        Tensor::from_data(
            TensorData::new(batch, [indices.len(), channels, height, width]),
            device,
        )
    }
}

/// Load a dataset from a `.npy` array or a directory of images.
pub fn load_dataset(path: &Path, image_size: usize) -> Result<DatasetSplits> {
    let splits = if path.is_dir() {
        DatasetSplits {
            train: load_image_dir(path, image_size)?,
            test: None,
        }
    } else {
        load_npy(path)?
    };

    if splits.train.is_empty() {
        return Err(DatasetError::Empty(path.to_path_buf()).into());
    }
    Ok(splits)
}

/// Read a `uint8` or `float32` array of shape `[N, H, W, C]` or `[2, N, H, W, C]`.
pub fn load_npy(path: &Path) -> Result<DatasetSplits> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let npy = NpyFile::new(&bytes[..])
        .with_context(|| format!("failed to parse npy header in {}", path.display()))?;
    let shape: Vec<usize> = npy.shape().iter().map(|&dim| dim as usize).collect();
    let order = npy.order();
    if shape.len() < 4 || shape[shape.len() - 3..].contains(&0) {
        return Err(DatasetError::UnsupportedShape {
            path: path.to_path_buf(),
            shape,
        }
        .into());
    }

    let raw: Vec<f32> = match npy.into_vec::<u8>() {
        Ok(values) => values.into_iter().map(f32::from).collect(),
        Err(_) => NpyFile::new(&bytes[..])?
            .into_vec::<f32>()
            .map_err(|_| DatasetError::UnsupportedDtype(path.to_path_buf()))?,
    };
    let raw = match order {
        Order::C => raw,
        Order::Fortran => fortran_to_c_order(&raw, &shape),
    };

    match shape.as_slice() {
        &[n, h, w, c] => Ok(DatasetSplits {
            train: ImageDataset::from_hwc(&raw, n, h, w, c),
            test: None,
        }),
        &[2, n, h, w, c] => {
            let split_len = n * h * w * c;
            Ok(DatasetSplits {
                train: ImageDataset::from_hwc(&raw[..split_len], n, h, w, c),
                test: Some(ImageDataset::from_hwc(&raw[split_len..], n, h, w, c)),
            })
        }
        _ => Err(DatasetError::UnsupportedShape {
            path: path.to_path_buf(),
            shape,
        }
        .into()),
    }
}

/// Reorder column-major array values into row-major order.
fn fortran_to_c_order(values: &[f32], shape: &[usize]) -> Vec<f32> {
    let mut strides = vec![1usize; shape.len()];
    for axis in 1..shape.len() {
        strides[axis] = strides[axis - 1] * shape[axis - 1];
    }

    let total: usize = shape.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut index = vec![0usize; shape.len()];
    for _ in 0..total {
        let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.push(values[offset]);
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

/// Load every PNG/JPEG under `dir`, resized to `image_size`.
pub fn load_image_dir(dir: &Path, image_size: usize) -> Result<ImageDataset> {
    let mut paths = Vec::new();
    for pattern in ["png", "jpg", "jpeg"] {
        let pattern = format!("{}/**/*.{pattern}", dir.display());
        paths.extend(glob::glob(&pattern)?.filter_map(Result::ok));
    }
    paths.sort();

    if paths.is_empty() {
        return Err(DatasetError::Empty(dir.to_path_buf()).into());
    }

    let size = image_size as u32;
    let mut raw = Vec::with_capacity(paths.len() * image_size * image_size * 3);
    for path in &paths {
        let mut img = image::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?
            .to_rgb8();
        if img.width() != size || img.height() != size {
            img = resize_image(&img, size, size);
        }
        raw.extend(img.as_raw().iter().map(|&v| f32::from(v)));
    }

    tracing::debug!(images = paths.len(), dir = %dir.display(), "loaded image directory");
    Ok(ImageDataset::from_hwc(&raw, paths.len(), image_size, image_size, 3))
}

fn resize_image(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    image::imageops::resize(img, width, height, image::imageops::FilterType::CatmullRom)
}

/// Convert HWC values in [0, 255] to CHW floats in [-1, 1].
fn hwc_to_chw(image: &[f32], height: usize, width: usize, channels: usize) -> Vec<f32> {
    let hw = height * width;
    let mut out = vec![0.0f32; hw * channels];
    for idx in 0..hw {
        for c in 0..channels {
            out[c * hw + idx] = image[idx * channels + c] / 127.5 - 1.0;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use rand::{rngs::StdRng, SeedableRng};

    type TestBackend = NdArray<f32>;

    /// Serialize a minimal version 1.0 `.npy` file.
    fn npy_bytes(descr: &str, shape: &[usize], payload: &[u8]) -> Vec<u8> {
        npy_bytes_with_order(descr, false, shape, payload)
    }

    fn npy_bytes_with_order(descr: &str, fortran: bool, shape: &[usize], payload: &[u8]) -> Vec<u8> {
        let order = if fortran { "True" } else { "False" };
        let dims = shape.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ");
        let dims = if shape.len() == 1 { format!("{dims},") } else { dims };
        let mut header = format!("{{'descr': '{descr}', 'fortran_order': {order}, 'shape': ({dims}), }}");
        let unpadded = 10 + header.len() + 1;
        header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
        header.push('\n');

        let mut out = b"\x93NUMPY\x01\x00".to_vec();
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn write_npy(dir: &Path, name: &str, bytes: Vec<u8>) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn reads_train_only_u8_array() {
        let dir = tempfile::tempdir().unwrap();
        // Two 2x2 RGB images.
        let payload: Vec<u8> = (0..24).map(|v| if v % 2 == 0 { 0 } else { 255 }).collect();
        let path = write_npy(dir.path(), "train.npy", npy_bytes("|u1", &[2, 2, 2, 3], &payload));

        let splits = load_dataset(&path, 2).unwrap();
        assert!(splits.test.is_none());
        assert_eq!(splits.train.len(), 2);
        assert_eq!(splits.train.image_dims(), [3, 2, 2]);

        let batch = splits.train.batch::<TestBackend>(&[0], &Default::default());
        let values = batch.to_data().to_vec::<f32>().unwrap();
        // HWC pixel 0 is (0, 255, 0): channel planes start -1, 1, -1.
        assert_eq!(values[0], -1.0);
        assert_eq!(values[4], 1.0);
        assert_eq!(values[8], -1.0);
    }

    #[test]
    fn reads_two_split_float_array() {
        let dir = tempfile::tempdir().unwrap();
        let floats: Vec<f32> = (0..2 * 3 * 4 * 4 * 3).map(|v| (v % 256) as f32).collect();
        let payload: Vec<u8> = floats.iter().flat_map(|v| v.to_le_bytes()).collect();
        let path = write_npy(dir.path(), "splits.npy", npy_bytes("<f4", &[2, 3, 4, 4, 3], &payload));

        let splits = load_dataset(&path, 4).unwrap();
        assert_eq!(splits.train.len(), 3);
        assert_eq!(splits.test.as_ref().map(ImageDataset::len), Some(3));
        assert!(splits.train.ensure_dims([3, 4, 4]).is_ok());
    }

    #[test]
    fn rejects_unsupported_rank() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_npy(dir.path(), "flat.npy", npy_bytes("|u1", &[4, 4], &[0u8; 16]));
        let err = load_dataset(&path, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::UnsupportedShape { .. })
        ));
    }

    #[test]
    fn rejects_zero_sized_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_npy(dir.path(), "empty.npy", npy_bytes("|u1", &[3, 0, 0, 3], &[]));
        let err = load_dataset(&path, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::UnsupportedShape { .. })
        ));
        assert!(err.to_string().contains("empty.npy"));
    }

    #[test]
    fn fortran_order_arrays_are_reordered() {
        let dir = tempfile::tempdir().unwrap();
        // One 1x2 RGB image: pixel 0 black, pixel 1 white, stored column-major.
        let payload = [0u8, 255, 0, 255, 0, 255];
        let bytes = npy_bytes_with_order("|u1", true, &[1, 1, 2, 3], &payload);
        let path = write_npy(dir.path(), "fortran.npy", bytes);

        let splits = load_dataset(&path, 2).unwrap();
        let batch = splits.train.batch::<TestBackend>(&[0], &Default::default());
        let values = batch.to_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![-1.0, 1.0, -1.0, 1.0, -1.0, 1.0]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_dataset(&dir.path().join("absent.npy"), 64).is_err());
    }

    #[test]
    fn image_dir_is_resized_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(16, 16, image::Rgb([255, 255, 255]))
            .save(dir.path().join("a.png"))
            .unwrap();
        RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]))
            .save(dir.path().join("b.png"))
            .unwrap();

        let splits = load_dataset(dir.path(), 8).unwrap();
        assert_eq!(splits.train.len(), 2);
        assert_eq!(splits.train.image_dims(), [3, 8, 8]);
        assert!(matches!(
            splits.train.ensure_dims([3, 64, 64]),
            Err(DatasetError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn indices_are_drawn_with_replacement_in_range() {
        let raw = vec![0.0f32; 3 * 2 * 2 * 3];
        let dataset = ImageDataset::from_hwc(&raw, 3, 2, 2, 3);
        let mut rng = StdRng::seed_from_u64(7);
        let indices = dataset.random_indices(50, &mut rng);
        assert_eq!(indices.len(), 50);
        assert!(indices.iter().all(|&i| i < 3));
        // 50 draws from 3 images must repeat.
        let mut unique = indices.clone();
        unique.sort();
        unique.dedup();
        assert!(unique.len() <= 3);
    }
}
