#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::Distribution;
use clap::Parser;
use dragan_burn::training::{load_generator, SAMPLE_GRID};
use dragan_burn::utils::{tensor_to_images, SampleGrid};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Sample images from a trained DRAGAN generator")]
struct Args {
    /// A checkpoint directory, or a run directory whose latest checkpoint is used.
    #[arg(long)]
    model_dir: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = SAMPLE_GRID.rows)]
    rows: usize,
    #[arg(long, default_value_t = SAMPLE_GRID.cols)]
    cols: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let checkpoint_dir = resolve_checkpoint_dir(&args.model_dir)?;
    if checkpoint_dir != args.model_dir {
        tracing::info!(
            from = %args.model_dir.display(),
            to = %checkpoint_dir.display(),
            "resolved checkpoint directory"
        );
    }

    #[cfg(feature = "cuda")]
    let device = burn_cuda::CudaDevice::default();
    #[cfg(feature = "cuda")]
    type Backend = burn_cuda::Cuda<f32, i32>;
    #[cfg(not(feature = "cuda"))]
    let device = burn::backend::wgpu::WgpuDevice::default();
    #[cfg(not(feature = "cuda"))]
    type Backend = burn::backend::WebGpu<f32, i32>;

    Backend::seed(&device, args.seed);
    let (generator, model_config) = load_generator::<Backend>(&checkpoint_dir, &device)?;

    let grid = SampleGrid::new(args.rows, args.cols);
    let noise = Tensor::<Backend, 2>::random(
        [grid.capacity(), model_config.latent_dim],
        Distribution::Normal(0.0, 1.0),
        &device,
    );
    let images = tensor_to_images(generator.forward(noise))?;
    grid.save(&images, &args.output)?;
    tracing::info!(path = %args.output.display(), "saved samples");
    Ok(())
}

/// Resolve a checkpoint directory from a run directory or a checkpoint root.
///
/// Picks the `epoch_*` directory with the highest epoch number.
fn resolve_checkpoint_dir(model_dir: &Path) -> Result<PathBuf> {
    if model_dir.join("model.json").exists() {
        return Ok(model_dir.to_path_buf());
    }
    let checkpoint_root = if model_dir.join("checkpoints").is_dir() {
        model_dir.join("checkpoints")
    } else {
        model_dir.to_path_buf()
    };

    let entries = fs::read_dir(&checkpoint_root)
        .with_context(|| format!("failed to read {}", checkpoint_root.display()))?;
    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let epoch = path
                .file_name()?
                .to_str()?
                .strip_prefix("epoch_")?
                .parse::<usize>()
                .ok()?;
            path.join("model.json").exists().then_some((epoch, path))
        })
        .max_by_key(|(epoch, _)| *epoch)
        .map(|(_, path)| path)
        .ok_or_else(|| anyhow::anyhow!("no checkpoints found under {}", checkpoint_root.display()))
}
