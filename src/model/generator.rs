use crate::model::layers::normal_init;
use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Spatial size of the projected latent before upsampling.
pub const BASE_SIZE: usize = 4;

/// Configuration for the DCGAN generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub latent_dim: usize,
    pub generator_dim: usize,
    pub channels: usize,
    pub image_size: usize,
    #[config(default = 0.02)]
    pub init_std: f64,
}

/// Dense projection to 4x4 followed by stride-2 transposed convs up to the image size.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    project: Linear<B>,
    deconvs: Vec<ConvTranspose2d<B>>,
    #[module(ignore)]
    base_channels: usize,
}

impl GeneratorConfig {
    /// Number of 2x upsampling stages between 4x4 and `image_size`.
    pub fn num_upsamples(&self) -> usize {
        let mut size = BASE_SIZE;
        let mut count = 0;
        while size < self.image_size {
            size *= 2;
            count += 1;
        }
        count
    }

    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let upsamples = self.num_upsamples().max(1);
        let base_channels = self.generator_dim << (upsamples - 1);

        let project = LinearConfig::new(self.latent_dim, base_channels * BASE_SIZE * BASE_SIZE)
            .with_bias(false)
            .with_initializer(normal_init(self.init_std))
            .init(device);

        let mut deconvs = Vec::with_capacity(upsamples);
        let mut in_channels = base_channels;
        for idx in 0..upsamples {
            let out_channels = if idx + 1 == upsamples {
                self.channels
            } else {
                in_channels / 2
            };
            deconvs.push(
                ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
                    .with_stride([2, 2])
                    .with_padding([1, 1])
                    .with_bias(false)
                    .with_initializer(normal_init(self.init_std))
                    .init(device),
            );
            in_channels = out_channels;
        }

        Generator {
            project,
            deconvs,
            base_channels,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Map latent vectors `[batch, latent_dim]` to images `[batch, channels, size, size]` in [-1, 1].
    pub fn forward(&self, noise: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, _] = noise.dims();
        let x = relu(self.project.forward(noise));
        let mut x = x.reshape([batch, self.base_channels, BASE_SIZE, BASE_SIZE]);

        let last = self.deconvs.len() - 1;
        for (idx, deconv) in self.deconvs.iter().enumerate() {
            x = deconv.forward(x);
            if idx != last {
                x = relu(x);
            }
        }
        x.tanh()
    }
}
