use burn::nn::Initializer;
use burn::prelude::*;
use burn::tensor::module::conv_transpose2d;
use burn::tensor::ops::ConvTransposeOptions;

/// Weight initializer shared by every layer: N(0, std), no bias.
pub fn normal_init(std: f64) -> Initializer {
    Initializer::Normal { mean: 0.0, std }
}

/// Output size of a square convolution along one spatial axis.
pub fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}

/// Propagate a gradient from a conv2d output back to its input.
///
/// This is the vector-Jacobian product of `conv2d(x, weight)` with respect to
/// `x`, i.e. a transposed convolution with the same weight. The result is an
/// ordinary tensor expression of `weight`, so it can itself be differentiated
/// with respect to the layer parameters.
pub fn conv2d_input_grad<B: Backend>(
    grad_output: Tensor<B, 4>,
    weight: Tensor<B, 4>,
    stride: usize,
    padding: usize,
    input_size: [usize; 2],
) -> Tensor<B, 4> {
    let [_, _, out_h, out_w] = grad_output.dims();
    let [_, _, kernel_h, kernel_w] = weight.dims();
    // Strided convs drop trailing rows; pad them back so the shape matches x.
    let covered_h = (out_h - 1) * stride + kernel_h - 2 * padding;
    let covered_w = (out_w - 1) * stride + kernel_w - 2 * padding;
    let padding_out = [input_size[0] - covered_h, input_size[1] - covered_w];

    conv_transpose2d(
        grad_output,
        weight,
        None,
        ConvTransposeOptions::new([stride, stride], [padding, padding], padding_out, [1, 1], 1),
    )
}

/// Derivative of leaky ReLU evaluated at the pre-activation values.
///
/// The mask carries no gradient of its own: the second derivative of leaky
/// ReLU is zero everywhere it is defined.
pub fn leaky_relu_slope<B: Backend>(pre_activation: &Tensor<B, 4>, negative_slope: f64) -> Tensor<B, 4> {
    let negative = pre_activation.clone().lower_elem(0.0);
    Tensor::ones(pre_activation.dims(), &pre_activation.device()).mask_fill(negative, negative_slope)
}
