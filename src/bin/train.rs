#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use clap::Parser;
#[cfg(not(feature = "cuda"))]
use dragan_burn::model::layers::conv_out;
use dragan_burn::model::{LossConfig, ModelConfig};
use dragan_burn::training::TrainingConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train a DRAGAN image generator with Burn")]
struct Args {
    /// `.npy` image array or a directory of images.
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long, default_value = "runs/dragan")]
    output_dir: PathBuf,
    /// Start from a saved `config.json` instead of the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// GAN variant label (informational).
    #[arg(long = "type")]
    gan_type: Option<String>,
    #[arg(long)]
    epoch: Option<usize>,
    #[arg(long)]
    save_interval: Option<usize>,
    #[arg(long)]
    model_interval: Option<usize>,
    /// Minibatch size. On the WGPU backend it is lowered, with a warning,
    /// when one batch would exceed the device's storage buffer limit.
    #[arg(long)]
    batchsize: Option<usize>,
    /// Gradient penalty weight.
    #[arg(long)]
    lam: Option<f64>,
    #[arg(long)]
    lr_d: Option<f64>,
    #[arg(long)]
    lr_g: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    /// Apply command-line overrides on top of the base configuration.
    fn apply(&self, mut config: TrainingConfig) -> TrainingConfig {
        if let Some(gan_type) = &self.gan_type {
            config.gan_type = Some(gan_type.clone());
        }
        if let Some(epochs) = self.epoch {
            config.num_epochs = epochs;
        }
        if let Some(interval) = self.save_interval {
            config.save_interval = interval;
        }
        if let Some(interval) = self.model_interval {
            config.model_interval = interval;
        }
        if let Some(batch_size) = self.batchsize {
            config.batch_size = batch_size;
        }
        if let Some(lambda) = self.lam {
            config.loss.gradient_penalty = lambda;
        }
        if let Some(lr) = self.lr_d {
            config.learning_rate_d = lr;
        }
        if let Some(lr) = self.lr_g {
            config.learning_rate_g = lr;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let base = match &args.config {
        Some(path) => TrainingConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TrainingConfig::new(ModelConfig::new(), LossConfig::new()),
    };
    let config = args.apply(base);
    if config.loss.gradient_penalty < 0.0 {
        return Err(anyhow::anyhow!("--lam must be non-negative"));
    }

    launch(&args, config)
}

#[cfg(feature = "cuda")]
fn launch(args: &Args, config: TrainingConfig) -> Result<()> {
    use burn_cuda::{Cuda, CudaDevice};

    type Backend = Cuda<f32, i32>;
    let device = CudaDevice::default();
    dragan_burn::training::train::<Autodiff<Backend>>(&args.output_dir, &args.dataset, config, device)
}

#[cfg(not(feature = "cuda"))]
fn launch(args: &Args, mut config: TrainingConfig) -> Result<()> {
    use burn::backend::wgpu::graphics::AutoGraphicsApi;
    use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
    use burn::backend::WebGpu;

    type Backend = WebGpu<f32, i32>;
    let device = WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size =
        setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config, max_storage_buffer_binding_size)?;

    dragan_burn::training::train::<Autodiff<Backend>>(&args.output_dir, &args.dataset, config, device)
}

#[cfg(not(feature = "cuda"))]
fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes = estimate_max_conv_workspace_elems(&config.model).saturating_mul(elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce image_size or model dims."
        ));
    }

    if config.batch_size > max_batch {
        tracing::warn!(
            max_storage_buffer_binding_size,
            per_sample_bytes,
            from = config.batch_size,
            to = max_batch,
            "lowering batch_size to fit the wgpu storage buffer limit"
        );
        config.batch_size = max_batch;
    }

    Ok(())
}

/// Largest im2col/col2im buffer, in elements per sample, across all conv layers.
///
/// The gradient penalty replays every critic conv as a transposed conv of the
/// same size, so the critic forward estimate also covers it.
#[cfg(not(feature = "cuda"))]
fn estimate_max_conv_workspace_elems(model: &ModelConfig) -> u64 {
    let kernel_area = 16u64;
    let mut max_elems = 0u64;

    // Generator transposed convs, 4x4 up to image_size.
    let generator = model.generator_config();
    let upsamples = generator.num_upsamples().max(1) as u32;
    let mut size = 4u64;
    let mut out_channels = (model.generator_dim as u64) << (upsamples - 1);
    for idx in 0..upsamples {
        out_channels = if idx + 1 == upsamples {
            model.channels as u64
        } else {
            out_channels / 2
        };
        max_elems = max_elems.max(out_channels * size * size * kernel_area);
        size *= 2;
    }

    // Critic strided convs, image_size down to 4x4.
    let mut size = model.image_size as u64;
    let mut in_channels = model.channels as u64;
    let mut out_channels = model.discriminator_dim as u64;
    while size > 4 {
        size = conv_out(size as usize, 4, 2, 1) as u64;
        max_elems = max_elems.max(in_channels * size * size * kernel_area);
        in_channels = out_channels;
        out_channels *= 2;
    }

    max_elems
}
