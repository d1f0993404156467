pub mod discriminator;
pub mod generator;
pub mod layers;

use anyhow::Result;
use burn::module::{ModuleVisitor, Param};
use burn::prelude::*;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{Generator, GeneratorConfig, BASE_SIZE};

/// Hyperparameters for the generator and discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 64)]
    pub image_size: usize,
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 100)]
    pub latent_dim: usize,
    #[config(default = 64)]
    pub generator_dim: usize,
    #[config(default = 64)]
    pub discriminator_dim: usize,
    #[config(default = 0.02)]
    pub init_std: f64,
}

/// Weighting for the critic loss terms.
#[derive(Config, Debug)]
pub struct LossConfig {
    /// Gradient penalty weight (lambda).
    #[config(default = 10.0)]
    pub gradient_penalty: f64,
}

impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(
            self.latent_dim,
            self.generator_dim,
            self.channels,
            self.image_size,
        )
        .with_init_std(self.init_std)
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.discriminator_dim, self.channels, self.image_size)
            .with_init_std(self.init_std)
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        self.discriminator_config().init(device)
    }

    /// Image shape as `[channels, height, width]`.
    pub fn image_dims(&self) -> [usize; 3] {
        [self.channels, self.image_size, self.image_size]
    }

    /// Reject sizes the 4x4-doubling architecture cannot produce.
    pub fn validate(&self) -> Result<()> {
        let size = self.image_size;
        if size <= BASE_SIZE || size % BASE_SIZE != 0 || !(size / BASE_SIZE).is_power_of_two() {
            return Err(anyhow::anyhow!(
                "image_size must be 4 * 2^k with k >= 1, got {size}"
            ));
        }
        if self.channels == 0 || self.latent_dim == 0 {
            return Err(anyhow::anyhow!("channels and latent_dim must be positive"));
        }
        if self.generator_dim == 0 || self.discriminator_dim == 0 {
            return Err(anyhow::anyhow!("generator_dim and discriminator_dim must be positive"));
        }
        Ok(())
    }
}

/// A differentiable realness score over image batches.
pub trait Critic<B: Backend> {
    /// Per-sample scores of shape `[batch, 1]`.
    fn score(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Scores together with `d score_b / d images_b` for every sample.
    ///
    /// The returned gradient must remain differentiable with respect to the
    /// critic's own parameters.
    fn score_with_input_grad(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 4>);
}

/// Critic loss and the terms it was built from.
#[derive(Debug)]
pub struct DiscriminatorLosses<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub real: Tensor<B, 1>,
    pub fake: Tensor<B, 1>,
    pub penalty: Tensor<B, 1>,
}

/// Convex combination `alpha * real + (1 - alpha) * mixed`, alpha broadcast per sample.
pub fn mix_samples<B: Backend>(
    real: Tensor<B, 4>,
    mixed: Tensor<B, 4>,
    alpha: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let dims = real.dims();
    assert_eq!(dims, mixed.dims(), "real and mixed batches differ in shape");
    assert_eq!(
        alpha.dims(),
        [dims[0], 1, 1, 1],
        "alpha must hold one coefficient per sample"
    );

    let keep = alpha.clone().neg().add_scalar(1.0);
    alpha.mul(real).add(keep.mul(mixed))
}

/// DRAGAN gradient penalty: mean over the batch of `(||grad D(x_hat)|| - 1)^2`.
pub fn gradient_penalty<B: Backend, C: Critic<B>>(
    critic: &C,
    real: Tensor<B, 4>,
    mixed: Tensor<B, 4>,
    alpha: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let x_hat = mix_samples(real, mixed, alpha);
    let (_, grad) = critic.score_with_input_grad(x_hat);

    let [batch, channels, height, width] = grad.dims();
    let norm = grad
        .reshape([batch, channels * height * width])
        .square()
        .sum_dim(1)
        .sqrt();
    norm.sub_scalar(1.0).square().mean()
}

/// `loss_fake - loss_real + lambda * penalty`.
pub fn discriminator_losses<B: Backend, C: Critic<B>>(
    critic: &C,
    real: Tensor<B, 4>,
    fake: Tensor<B, 4>,
    mixed: Tensor<B, 4>,
    alpha: Tensor<B, 4>,
    loss_config: &LossConfig,
) -> DiscriminatorLosses<B> {
    let loss_real = critic.score(real.clone()).mean();
    let loss_fake = critic.score(fake).mean();
    let penalty = gradient_penalty(critic, real, mixed, alpha);

    let loss = loss_fake
        .clone()
        .sub(loss_real.clone())
        .add(penalty.clone().mul_scalar(loss_config.gradient_penalty));

    DiscriminatorLosses {
        loss,
        real: loss_real,
        fake: loss_fake,
        penalty,
    }
}

/// Generator objective: maximize the critic's mean score on fakes.
pub fn generator_loss<B: Backend>(fake_scores: Tensor<B, 2>) -> Tensor<B, 1> {
    fake_scores.mean().neg()
}

struct ParamCollector {
    values: Vec<Vec<f32>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.values.push(param.val().into_data().iter::<f32>().collect());
    }
}

/// Copy every float parameter of a module, in visiting order.
pub fn parameter_snapshot<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<f32>> {
    let mut collector = ParamCollector { values: Vec::new() };
    module.visit(&mut collector);
    collector.values
}
