use crate::data::{load_dataset, ImageDataset};
use crate::model::{
    discriminator_losses, generator_loss, Discriminator, Generator, LossConfig, ModelConfig,
};
use crate::utils::{tensor_to_images, SampleGrid};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Size of the fixed latent batch used for sample sheets.
pub const SAMPLE_COUNT: usize = 36;

/// Layout of the sample sheet written every `save_interval` epochs.
pub const SAMPLE_GRID: SampleGrid = SampleGrid { rows: 5, cols: 5 };

/// Training configuration, saved as `config.json` next to the run artifacts.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub loss: LossConfig,
    /// GAN variant label. Only logged.
    #[config(default = "None")]
    pub gan_type: Option<String>,
    #[config(default = 1000)]
    pub num_epochs: usize,
    /// Epochs between sample sheets; 0 disables sampling and checkpoints.
    #[config(default = 10)]
    pub save_interval: usize,
    /// Epochs between generator checkpoints, checked only on sampling epochs.
    #[config(default = 500)]
    pub model_interval: usize,
    #[config(default = 100)]
    pub batch_size: usize,
    #[config(default = 1e-4)]
    pub learning_rate_d: f64,
    #[config(default = 1e-4)]
    pub learning_rate_g: f64,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = "AdamConfig::new().with_epsilon(1e-7)")]
    pub optimizer_gen: AdamConfig,
    #[config(default = "AdamConfig::new().with_epsilon(1e-7)")]
    pub optimizer_disc: AdamConfig,
}

/// Number of minibatches drawn per epoch.
pub fn steps_per_epoch(dataset_len: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        dataset_len / batch_size
    }
}

/// Sample sheets are written on the first batch of every `save_interval`-th epoch.
pub fn should_sample(epoch: usize, index: usize, save_interval: usize) -> bool {
    index == 0 && save_interval > 0 && epoch % save_interval == 0
}

/// Checkpoints only fire on sampling steps whose epoch is also a multiple of `model_interval`.
pub fn should_checkpoint(
    epoch: usize,
    index: usize,
    save_interval: usize,
    model_interval: usize,
) -> bool {
    should_sample(epoch, index, save_interval) && model_interval > 0 && epoch % model_interval == 0
}

/// Inputs of one training step.
#[derive(Clone, Debug)]
pub struct Minibatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub noise: Tensor<B, 2>,
    pub perturbation: Tensor<B, 4>,
}

impl<B: Backend> Minibatch<B> {
    /// Draw real images with replacement plus fresh latent noise and perturbation.
    pub fn draw(
        dataset: &ImageDataset,
        batch_size: usize,
        latent_dim: usize,
        rng: &mut impl Rng,
        device: &B::Device,
    ) -> Self {
        let indices = dataset.random_indices(batch_size, rng);
        let images = dataset.batch::<B>(&indices, device);
        let noise = Tensor::random([batch_size, latent_dim], Distribution::Normal(0.0, 1.0), device);
        let perturbation = dragan_perturbation(&images);
        Self {
            images,
            noise,
            perturbation,
        }
    }

    /// Real images pushed off the data manifold by the perturbation.
    pub fn mixed(&self) -> Tensor<B, 4> {
        self.images.clone().add(self.perturbation.clone())
    }
}

/// Population standard deviation over every element of the batch.
pub fn batch_std<B: Backend>(images: &Tensor<B, 4>) -> f64 {
    let mean = images.clone().mean().into_scalar().elem::<f64>();
    let variance = images
        .clone()
        .sub_scalar(mean)
        .square()
        .mean()
        .into_scalar()
        .elem::<f64>();
    variance.sqrt()
}

/// Local DRAGAN noise: `0.5 * std(batch) * U(0,1)[B,C,H,W] * U(0,1)[B,1,1,1]`.
pub fn dragan_perturbation<B: Backend>(images: &Tensor<B, 4>) -> Tensor<B, 4> {
    let dims = images.dims();
    let device = images.device();
    let scale = 0.5 * batch_std(images);
    let noise = Tensor::<B, 4>::random(dims, Distribution::Uniform(0.0, 1.0), &device);
    let per_sample = Tensor::<B, 4>::random([dims[0], 1, 1, 1], Distribution::Uniform(0.0, 1.0), &device);
    noise.mul(per_sample).mul_scalar(scale)
}

/// Scalar diagnostics from one training step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepLosses {
    pub loss_d: f64,
    pub loss_g: f64,
    pub loss_real: f64,
    pub loss_fake: f64,
    pub gradient_penalty: f64,
}

impl StepLosses {
    pub fn is_finite(&self) -> bool {
        [
            self.loss_d,
            self.loss_g,
            self.loss_real,
            self.loss_fake,
            self.gradient_penalty,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// One logged step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub epoch: usize,
    pub index: usize,
    pub steps_per_epoch: usize,
    pub global_step: usize,
    #[serde(flatten)]
    pub losses: StepLosses,
}

/// Critic-side results of a discriminator update.
#[derive(Clone, Copy, Debug)]
pub struct CriticStep {
    pub loss_d: f64,
    pub loss_real: f64,
    pub loss_fake: f64,
    pub gradient_penalty: f64,
}

/// Networks, optimizers and counters for a run.
pub struct TrainingState<B: AutodiffBackend> {
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
    optim_gen: OptimizerAdaptor<Adam, Generator<B>, B>,
    optim_disc: OptimizerAdaptor<Adam, Discriminator<B>, B>,
    loss_config: LossConfig,
    learning_rate_g: f64,
    learning_rate_d: f64,
    pub step: usize,
}

impl<B: AutodiffBackend> TrainingState<B> {
    /// Fresh networks and optimizers for the given configuration.
    pub fn new(config: &TrainingConfig, device: &B::Device) -> Self {
        Self {
            generator: config.model.init_generator(device),
            discriminator: config.model.init_discriminator(device),
            optim_gen: config.optimizer_gen.init::<B, Generator<B>>(),
            optim_disc: config.optimizer_disc.init::<B, Discriminator<B>>(),
            loss_config: config.loss.clone(),
            learning_rate_g: config.learning_rate_g,
            learning_rate_d: config.learning_rate_d,
            step: 0,
        }
    }

    /// One Adam update of the discriminator; the generator is left untouched.
    pub fn discriminator_step(&mut self, batch: &Minibatch<B>) -> CriticStep {
        let [batch_size, _, _, _] = batch.images.dims();
        let device = batch.images.device();
        let alpha = Tensor::<B, 4>::random([batch_size, 1, 1, 1], Distribution::Uniform(0.0, 1.0), &device);

        let fake = self.generator.forward(batch.noise.clone()).detach();
        let losses = discriminator_losses(
            &self.discriminator,
            batch.images.clone(),
            fake,
            batch.mixed(),
            alpha,
            &self.loss_config,
        );

        let step = CriticStep {
            loss_d: losses.loss.clone().into_scalar().elem::<f64>(),
            loss_real: losses.real.into_scalar().elem::<f64>(),
            loss_fake: losses.fake.into_scalar().elem::<f64>(),
            gradient_penalty: losses.penalty.into_scalar().elem::<f64>(),
        };

        let grads = GradientsParams::from_grads(losses.loss.backward(), &self.discriminator);
        self.discriminator = self
            .optim_disc
            .step(self.learning_rate_d, self.discriminator.clone(), grads);
        step
    }

    /// One Adam update of the generator; the discriminator is left untouched.
    pub fn generator_step(&mut self, noise: Tensor<B, 2>) -> f64 {
        let fake = self.generator.forward(noise);
        let loss = generator_loss(self.discriminator.forward(fake));
        let value = loss.clone().into_scalar().elem::<f64>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.generator);
        self.generator = self
            .optim_gen
            .step(self.learning_rate_g, self.generator.clone(), grads);
        value
    }

    /// Discriminator update followed by a generator update on the same noise.
    pub fn train_step(&mut self, batch: Minibatch<B>) -> StepLosses {
        let critic = self.discriminator_step(&batch);
        let loss_g = self.generator_step(batch.noise);
        self.step += 1;
        StepLosses {
            loss_d: critic.loss_d,
            loss_g,
            loss_real: critic.loss_real,
            loss_fake: critic.loss_fake,
            gradient_penalty: critic.gradient_penalty,
        }
    }

    /// Run the generator without tracking gradients.
    pub fn generate(&self, noise: Tensor<B, 2>) -> Tensor<B::InnerBackend, 4> {
        self.generator.valid().forward(noise.inner())
    }
}

/// Collaborators invoked by the training loop.
pub trait TrainingObserver<B: AutodiffBackend> {
    /// Called after every training step.
    fn on_step(&mut self, record: &StepRecord, state: &TrainingState<B>) -> Result<()>;

    /// Receives the generator output for the fixed sample noise.
    fn on_sample(&mut self, epoch: usize, images: Tensor<B::InnerBackend, 4>) -> Result<()>;

    /// Persist the generator.
    fn on_checkpoint(
        &mut self,
        epoch: usize,
        generator: &Generator<B>,
        record: &StepRecord,
    ) -> Result<()>;
}

/// Drive `config.num_epochs` epochs of DRAGAN training over `dataset`.
pub fn run<B: AutodiffBackend, O: TrainingObserver<B>>(
    state: &mut TrainingState<B>,
    dataset: &ImageDataset,
    config: &TrainingConfig,
    observer: &mut O,
    rng: &mut StdRng,
    device: &B::Device,
) -> Result<()> {
    if dataset.is_empty() {
        return Err(anyhow::anyhow!("no training images"));
    }
    let steps = steps_per_epoch(dataset.len(), config.batch_size);
    if steps == 0 {
        tracing::warn!(
            images = dataset.len(),
            batch_size = config.batch_size,
            "dataset is smaller than one batch, epochs will run no steps"
        );
    }

    let latent_dim = config.model.latent_dim;
    let fixed_noise = Tensor::<B, 2>::random(
        [SAMPLE_COUNT, latent_dim],
        Distribution::Normal(0.0, 1.0),
        device,
    );

    for epoch in 0..config.num_epochs {
        tracing::info!(epoch, "epoch started");
        for index in 0..steps {
            let batch = Minibatch::draw(dataset, config.batch_size, latent_dim, rng, device);
            let losses = state.train_step(batch);
            let record = StepRecord {
                epoch,
                index,
                steps_per_epoch: steps,
                global_step: state.step,
                losses,
            };

            tracing::info!(
                epoch,
                step = index,
                "{}/{} loss_d: {:.6} loss_g: {:.6} loss_real: {:.6} loss_fake: {:.6}",
                index,
                steps,
                losses.loss_d,
                losses.loss_g,
                losses.loss_real,
                losses.loss_fake
            );
            if !losses.is_finite() {
                tracing::warn!(epoch, step = index, ?losses, "non-finite loss");
            }
            observer.on_step(&record, state)?;

            if should_sample(epoch, index, config.save_interval) {
                observer.on_sample(epoch, state.generate(fixed_noise.clone()))?;
                if should_checkpoint(epoch, index, config.save_interval, config.model_interval) {
                    observer.on_checkpoint(epoch, &state.generator, &record)?;
                }
            }
        }
    }

    Ok(())
}

/// Metadata written next to each generator checkpoint.
#[derive(Serialize, Deserialize, Debug)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub step: usize,
    pub losses: StepLosses,
}

/// Writes sample sheets, generator checkpoints and the per-step metrics log.
pub struct ArtifactWriter {
    sample_dir: PathBuf,
    checkpoint_dir: PathBuf,
    model_config: ModelConfig,
    metrics: BufWriter<File>,
}

impl ArtifactWriter {
    pub fn create(output_dir: &Path, model_config: ModelConfig) -> Result<Self> {
        let sample_dir = output_dir.join("samples");
        let checkpoint_dir = output_dir.join("checkpoints");
        std::fs::create_dir_all(&sample_dir)
            .with_context(|| format!("failed to create {}", sample_dir.display()))?;
        std::fs::create_dir_all(&checkpoint_dir)
            .with_context(|| format!("failed to create {}", checkpoint_dir.display()))?;

        let metrics_path = output_dir.join("losses.jsonl");
        let metrics = File::create(&metrics_path)
            .with_context(|| format!("failed to create {}", metrics_path.display()))?;

        Ok(Self {
            sample_dir,
            checkpoint_dir,
            model_config,
            metrics: BufWriter::new(metrics),
        })
    }

    pub fn sample_path(&self, epoch: usize) -> PathBuf {
        self.sample_dir.join(format!("sample_{epoch:05}.png"))
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("epoch_{epoch}"))
    }
}

impl<B: AutodiffBackend> TrainingObserver<B> for ArtifactWriter {
    fn on_step(&mut self, record: &StepRecord, _state: &TrainingState<B>) -> Result<()> {
        serde_json::to_writer(&mut self.metrics, record)?;
        writeln!(self.metrics)?;
        Ok(())
    }

    fn on_sample(&mut self, epoch: usize, images: Tensor<B::InnerBackend, 4>) -> Result<()> {
        let images = tensor_to_images(images)?;
        let path = self.sample_path(epoch);
        SAMPLE_GRID.save(&images, &path)?;
        self.metrics.flush()?;
        tracing::info!(epoch, path = %path.display(), "saved sample grid");
        Ok(())
    }

    fn on_checkpoint(
        &mut self,
        epoch: usize,
        generator: &Generator<B>,
        record: &StepRecord,
    ) -> Result<()> {
        let dir = self.checkpoint_path(epoch);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        generator
            .clone()
            .save_file(dir.join("generator"), &CompactRecorder::new())
            .map_err(|e| anyhow::anyhow!("failed to save generator at epoch {epoch}: {e}"))?;
        self.model_config
            .save(dir.join("model.json"))
            .with_context(|| format!("failed to save model config in {}", dir.display()))?;

        let meta = CheckpointMeta {
            epoch,
            step: record.global_step,
            losses: record.losses,
        };
        let meta_path = dir.join("meta.json");
        let meta_file = File::create(&meta_path)
            .with_context(|| format!("failed to create {}", meta_path.display()))?;
        serde_json::to_writer_pretty(meta_file, &meta)
            .with_context(|| format!("failed to write {}", meta_path.display()))?;

        tracing::info!(epoch, step = record.global_step, dir = %dir.display(), "checkpoint saved");
        Ok(())
    }
}

/// Load a generator written by [`ArtifactWriter`] from its checkpoint directory.
pub fn load_generator<B: Backend>(
    checkpoint_dir: &Path,
    device: &B::Device,
) -> Result<(Generator<B>, ModelConfig)> {
    let config_path = checkpoint_dir.join("model.json");
    let model_config = ModelConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let generator = model_config
        .init_generator::<B>(device)
        .load_file(checkpoint_dir.join("generator"), &CompactRecorder::new(), device)
        .map_err(|e| {
            anyhow::anyhow!(
                "failed to load generator weights from {}: {e}",
                checkpoint_dir.display()
            )
        })?;
    Ok((generator, model_config))
}

/// Train a DRAGAN generator on `dataset_path`, writing artifacts under `output_dir`.
pub fn train<B: AutodiffBackend>(
    output_dir: &Path,
    dataset_path: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    config.model.validate()?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    config
        .save(output_dir.join("config.json"))
        .context("failed to save config.json")?;

    let splits = load_dataset(dataset_path, config.model.image_size)
        .with_context(|| format!("failed to load dataset {}", dataset_path.display()))?;
    splits.train.ensure_dims(config.model.image_dims())?;
    tracing::info!(
        train = splits.train.len(),
        test = splits.test.as_ref().map_or(0, ImageDataset::len),
        gan_type = config.gan_type.as_deref().unwrap_or("DRAGAN"),
        "dataset loaded"
    );

    B::seed(&device, config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut state = TrainingState::<B>::new(&config, &device);
    tracing::info!(
        generator_params = state.generator.num_params(),
        discriminator_params = state.discriminator.num_params(),
        batch_size = config.batch_size,
        lambda = config.loss.gradient_penalty,
        "models initialized"
    );

    let mut writer = ArtifactWriter::create(output_dir, config.model.clone())?;
    run(&mut state, &splits.train, &config, &mut writer, &mut rng, &device)?;
    tracing::info!(steps = state.step, "training complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn default_schedule_checkpoints_only_at_0_and_500() {
        let config = TrainingConfig::new(ModelConfig::new(), LossConfig::new());
        let mut sampled = Vec::new();
        let mut checkpointed = Vec::new();
        for epoch in 0..config.num_epochs {
            for index in 0..3 {
                if should_sample(epoch, index, config.save_interval) {
                    sampled.push(epoch);
                }
                if should_checkpoint(epoch, index, config.save_interval, config.model_interval) {
                    checkpointed.push(epoch);
                }
            }
        }
        assert_eq!(sampled.len(), 100);
        assert!(sampled.iter().all(|e| e % 10 == 0));
        assert_eq!(checkpointed, vec![0, 500]);
    }

    #[test]
    fn checkpoint_is_nested_under_sampling() {
        // 15 is a multiple of model_interval but not of save_interval.
        assert!(!should_checkpoint(15, 0, 10, 5));
        assert!(should_checkpoint(20, 0, 10, 5));
        assert!(!should_checkpoint(20, 1, 10, 5));
        assert!(!should_sample(0, 0, 0));
        assert!(!should_checkpoint(0, 0, 10, 0));
    }

    #[test]
    fn steps_per_epoch_floors() {
        assert_eq!(steps_per_epoch(250, 100), 2);
        assert_eq!(steps_per_epoch(99, 100), 0);
        assert_eq!(steps_per_epoch(10, 0), 0);
    }

    #[test]
    fn config_defaults_match_cli_defaults() {
        let config = TrainingConfig::new(ModelConfig::new(), LossConfig::new());
        assert_eq!(config.num_epochs, 1000);
        assert_eq!(config.save_interval, 10);
        assert_eq!(config.model_interval, 500);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.loss.gradient_penalty, 10.0);
        assert_eq!(config.learning_rate_d, 1e-4);
        assert_eq!(config.learning_rate_g, 1e-4);
        assert_eq!(config.model.latent_dim, 100);
        assert!(config.gan_type.is_none());
    }

    #[test]
    fn perturbation_is_bounded_by_half_std() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::random([4, 3, 4, 4], Distribution::Uniform(-1.0, 1.0), &device);
        let bound = 0.5 * batch_std(&images) as f32;
        let delta = dragan_perturbation(&images).to_data().to_vec::<f32>().unwrap();
        assert!(delta.iter().all(|&d| (0.0..=bound + 1e-6).contains(&d)));
    }

    #[test]
    fn constant_batch_has_no_perturbation() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::full([2, 3, 4, 4], 0.3, &device);
        assert!(batch_std(&images) < 1e-6);
        let delta = dragan_perturbation(&images).to_data().to_vec::<f32>().unwrap();
        assert!(delta.iter().all(|d| d.abs() < 1e-6));
    }

    #[test]
    fn minibatch_has_configured_shapes() {
        let device = Default::default();
        let raw: Vec<f32> = (0..5 * 8 * 8 * 3).map(|v| (v % 256) as f32).collect();
        let dataset = ImageDataset::from_hwc(&raw, 5, 8, 8, 3);
        let mut rng = StdRng::seed_from_u64(3);
        let batch = Minibatch::<TestBackend>::draw(&dataset, 4, 2, &mut rng, &device);
        assert_eq!(batch.images.dims(), [4, 3, 8, 8]);
        assert_eq!(batch.noise.dims(), [4, 2]);
        assert_eq!(batch.perturbation.dims(), [4, 3, 8, 8]);
        assert_eq!(batch.mixed().dims(), [4, 3, 8, 8]);
    }

    #[test]
    fn checkpoint_errors_name_the_failing_file() {
        type TrainBackend = burn::backend::Autodiff<TestBackend>;

        let dir = tempfile::tempdir().unwrap();
        let model = ModelConfig::new()
            .with_image_size(8)
            .with_latent_dim(2)
            .with_generator_dim(4)
            .with_discriminator_dim(4);
        let mut writer = ArtifactWriter::create(dir.path(), model.clone()).unwrap();
        // A directory where meta.json should go makes the file creation fail.
        std::fs::create_dir_all(writer.checkpoint_path(0).join("meta.json")).unwrap();

        let generator = model.init_generator::<TrainBackend>(&Default::default());
        let record = StepRecord {
            epoch: 0,
            index: 0,
            steps_per_epoch: 1,
            global_step: 1,
            losses: StepLosses::default(),
        };
        let err = <ArtifactWriter as TrainingObserver<TrainBackend>>::on_checkpoint(
            &mut writer,
            0,
            &generator,
            &record,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("meta.json"));
    }

    #[test]
    fn non_finite_losses_are_detected() {
        let mut losses = StepLosses::default();
        assert!(losses.is_finite());
        losses.gradient_penalty = f64::NAN;
        assert!(!losses.is_finite());
    }
}
