use crate::model::layers::{conv2d_input_grad, conv_out, leaky_relu_slope, normal_init};
use crate::model::Critic;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

const KERNEL: usize = 4;
const STRIDE: usize = 2;
const PADDING: usize = 1;

/// Configuration for the DCGAN-style critic.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub discriminator_dim: usize,
    pub channels: usize,
    pub image_size: usize,
    #[config(default = 0.2)]
    pub negative_slope: f64,
    #[config(default = 0.02)]
    pub init_std: f64,
}

/// Strided conv stack down to 4x4 followed by a 4x4 valid conv to one score.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    head: Conv2d<B>,
    #[module(ignore)]
    negative_slope: f64,
}

impl DiscriminatorConfig {
    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let mut convs = Vec::new();
        let mut size = self.image_size;
        let mut in_channels = self.channels;
        let mut out_channels = self.discriminator_dim;
        while size > KERNEL {
            convs.push(
                Conv2dConfig::new([in_channels, out_channels], [KERNEL, KERNEL])
                    .with_stride([STRIDE, STRIDE])
                    .with_padding(PaddingConfig2d::Explicit(PADDING, PADDING))
                    .with_bias(false)
                    .with_initializer(normal_init(self.init_std))
                    .init(device),
            );
            size = conv_out(size, KERNEL, STRIDE, PADDING);
            in_channels = out_channels;
            out_channels *= 2;
        }

        let head = Conv2dConfig::new([in_channels, 1], [KERNEL, KERNEL])
            .with_padding(PaddingConfig2d::Valid)
            .with_bias(false)
            .with_initializer(normal_init(self.init_std))
            .init(device);

        Discriminator {
            convs,
            head,
            negative_slope: self.negative_slope,
        }
    }
}

impl<B: Backend> Discriminator<B> {
    /// Forward pass returning per-sample scores of shape `[batch, 1]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_recorded(images).0
    }

    /// Forward pass that also keeps every pre-activation for the input gradient.
    fn forward_recorded(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Vec<Tensor<B, 4>>) {
        let mut pre_activations = Vec::with_capacity(self.convs.len());
        let mut x = images;
        for conv in &self.convs {
            let pre = conv.forward(x);
            pre_activations.push(pre.clone());
            x = leaky_relu(pre, self.negative_slope);
        }

        let out = self.head.forward(x);
        let [batch, channels, height, width] = out.dims();
        (out.reshape([batch, channels * height * width]), pre_activations)
    }

    /// Gradient of each sample's score with respect to that sample's pixels.
    ///
    /// Built layer by layer in reverse from the recorded pre-activations, so
    /// the result stays attached to the conv weights on the autodiff tape.
    fn input_grad(&self, images: &Tensor<B, 4>, pre_activations: &[Tensor<B, 4>]) -> Tensor<B, 4> {
        let [batch, _, height, width] = images.dims();
        let device = images.device();

        let last = &pre_activations[pre_activations.len() - 1];
        let [_, _, last_h, last_w] = last.dims();
        let mut grad = Tensor::<B, 4>::ones([batch, 1, 1, 1], &device);
        grad = conv2d_input_grad(grad, self.head.weight.val(), 1, 0, [last_h, last_w]);

        for idx in (0..self.convs.len()).rev() {
            grad = grad.mul(leaky_relu_slope(&pre_activations[idx], self.negative_slope));
            let input_size = if idx == 0 {
                [height, width]
            } else {
                let [_, _, h, w] = pre_activations[idx - 1].dims();
                [h, w]
            };
            grad = conv2d_input_grad(grad, self.convs[idx].weight.val(), STRIDE, PADDING, input_size);
        }

        grad
    }
}

impl<B: Backend> Critic<B> for Discriminator<B> {
    fn score(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }

    fn score_with_input_grad(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 4>) {
        let (scores, pre_activations) = self.forward_recorded(images.clone());
        let grad = self.input_grad(&images, &pre_activations);
        (scores, grad)
    }
}
