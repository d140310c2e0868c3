//! GPU tensor kernels mirroring the CPU math in [`crate::core`] and
//! [`crate::loss`]: feature extraction with a backward cache, batch-norm
//! forward/backward, and the composite perceptual loss with its closed-form
//! gradient. No autograd — the same hand-derived input gradients as the CPU
//! path, expressed in burn tensor ops.

use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;

use super::GpuExtractor;
use crate::core::StatsMode;
use crate::loss::LossConfig;

fn conv_opts(pad_h: usize, pad_w: usize, groups: usize) -> ConvOptions<2> {
    ConvOptions::new([1, 1], [pad_h, pad_w], [1, 1], groups)
}

/// Forward-pass intermediates for [`input_gradient_gpu`].
pub struct GpuActivations<B: Backend> {
    h1: Tensor<B, 4>,
    xhat1: Tensor<B, 4>,
    inv_std1: Tensor<B, 4>,
    xhat2: Tensor<B, 4>,
    inv_std2: Tensor<B, 4>,
    feat: Tensor<B, 4>,
    mode: StatsMode,
}

/// Batch-norm forward. Returns `(y, xhat, inv_std)`; `inv_std` is a
/// broadcastable `[1, C, 1, 1]` tensor. Running estimates are updated in
/// [`StatsMode::Adapt`], with the unbiased variance.
#[allow(clippy::too_many_arguments)]
fn bn_forward<B: Backend>(
    x: Tensor<B, 4>,
    gamma: &Tensor<B, 4>,
    beta: &Tensor<B, 4>,
    running_mean: &mut Tensor<B, 4>,
    running_var: &mut Tensor<B, 4>,
    eps: f32,
    momentum: f32,
    mode: StatsMode,
) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
    let dims = x.dims();
    let m = (dims[0] * dims[2] * dims[3]) as f32;

    let (mean, var) = match mode {
        StatsMode::Adapt => {
            let mean = x.clone().mean_dim(0).mean_dim(2).mean_dim(3);
            let centered = x.clone().sub(mean.clone());
            let var = centered
                .clone()
                .mul(centered)
                .mean_dim(0)
                .mean_dim(2)
                .mean_dim(3);

            let unbiased = if m > 1.0 {
                var.clone().mul_scalar(m / (m - 1.0))
            } else {
                var.clone()
            };
            *running_mean = running_mean
                .clone()
                .mul_scalar(1.0 - momentum)
                .add(mean.clone().mul_scalar(momentum));
            *running_var = running_var
                .clone()
                .mul_scalar(1.0 - momentum)
                .add(unbiased.mul_scalar(momentum));

            (mean, var)
        }
        StatsMode::Frozen => (running_mean.clone(), running_var.clone()),
    };

    let inv_std = var.add_scalar(eps).sqrt().recip();
    let xhat = x.sub(mean).mul(inv_std.clone());
    let y = xhat.clone().mul(gamma.clone()).add(beta.clone());
    (y, xhat, inv_std)
}

/// Batch-norm input gradient for a forward pass in the given mode.
fn bn_backward<B: Backend>(
    dy: Tensor<B, 4>,
    xhat: &Tensor<B, 4>,
    inv_std: &Tensor<B, 4>,
    gamma: &Tensor<B, 4>,
    mode: StatsMode,
) -> Tensor<B, 4> {
    let scale = gamma.clone().mul(inv_std.clone());
    match mode {
        StatsMode::Frozen => dy.mul(scale),
        StatsMode::Adapt => {
            let mean_dy = dy.clone().mean_dim(0).mean_dim(2).mean_dim(3);
            let mean_dy_xhat = dy
                .clone()
                .mul(xhat.clone())
                .mean_dim(0)
                .mean_dim(2)
                .mean_dim(3);
            dy.sub(mean_dy)
                .sub(xhat.clone().mul(mean_dy_xhat))
                .mul(scale)
        }
    }
}

/// Feature tap with a backward cache.
pub fn extract_features_cached_gpu<B: Backend>(
    ex: &mut GpuExtractor<B>,
    x: Tensor<B, 4>,
) -> (Tensor<B, 4>, GpuActivations<B>) {
    let pad = (ex.config.kernel_size - 1) / 2;
    let eps = ex.config.bn_eps;
    let momentum = ex.config.bn_momentum;
    let mode = ex.mode;

    let u1 = conv2d(x, ex.w1.clone(), Some(ex.b1.clone()), conv_opts(pad, pad, 1));
    let (y1, xhat1, inv_std1) = bn_forward(
        u1,
        &ex.g1,
        &ex.beta1,
        &mut ex.rm1,
        &mut ex.rv1,
        eps,
        momentum,
        mode,
    );
    let h1 = relu(y1);

    let u2 = conv2d(
        h1.clone(),
        ex.w2.clone(),
        Some(ex.b2.clone()),
        conv_opts(pad, pad, 1),
    );
    let (y2, xhat2, inv_std2) = bn_forward(
        u2,
        &ex.g2,
        &ex.beta2,
        &mut ex.rm2,
        &mut ex.rv2,
        eps,
        momentum,
        mode,
    );
    let feat = relu(y2);

    (
        feat.clone(),
        GpuActivations {
            h1,
            xhat1,
            inv_std1,
            xhat2,
            inv_std2,
            feat,
            mode,
        },
    )
}

/// Feature tap without a cache (reference features).
pub fn extract_features_gpu<B: Backend>(ex: &mut GpuExtractor<B>, x: Tensor<B, 4>) -> Tensor<B, 4> {
    extract_features_cached_gpu(ex, x).0
}

/// Gradient of the loss with respect to the input image, given the gradient
/// with respect to the cached feature tensor. Weights stay fixed; the
/// convolution backward uses the pre-flipped kernels.
pub fn input_gradient_gpu<B: Backend>(
    ex: &GpuExtractor<B>,
    acts: &GpuActivations<B>,
    dfeat: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let pad = (ex.config.kernel_size - 1) / 2;

    let mask2 = acts.feat.clone().greater_elem(0.0).float();
    let dy2 = dfeat.mul(mask2);
    let du2 = bn_backward(dy2, &acts.xhat2, &acts.inv_std2, &ex.g2, acts.mode);
    let dh1 = conv2d(du2, ex.w2_flip.clone(), None, conv_opts(pad, pad, 1));

    let mask1 = acts.h1.clone().greater_elem(0.0).float();
    let dy1 = dh1.mul(mask1);
    let du1 = bn_backward(dy1, &acts.xhat1, &acts.inv_std1, &ex.g1, acts.mode);
    conv2d(du1, ex.w1_flip.clone(), None, conv_opts(pad, pad, 1))
}

/// Pre-compute the separable Gaussian window as depthwise convolution
/// kernels: horizontal `[C, 1, 1, K]` and vertical `[C, 1, K, 1]`.
pub fn gaussian_window_gpu<B: Backend>(
    size: usize,
    sigma: f32,
    channels: usize,
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let kernel = crate::utils::gaussian_kernel_1d(size, sigma);
    let vals = kernel.to_vec();
    let horizontal = Tensor::<B, 1>::from_data(TensorData::new(vals.clone(), [size]), device)
        .reshape([1, 1, 1, size])
        .repeat_dim(0, channels);
    let vertical = Tensor::<B, 1>::from_data(TensorData::new(vals, [size]), device)
        .reshape([1, 1, size, 1])
        .repeat_dim(0, channels);
    (horizontal, vertical)
}

/// Separable depthwise window filtering: `pad = 0` is valid-mode, `pad =
/// k - 1` the adjoint (the window is symmetric).
fn window_filter<B: Backend>(
    x: Tensor<B, 4>,
    horizontal: &Tensor<B, 4>,
    vertical: &Tensor<B, 4>,
    pad: usize,
    channels: usize,
) -> Tensor<B, 4> {
    let h = conv2d(x, horizontal.clone(), None, conv_opts(0, pad, channels));
    conv2d(h, vertical.clone(), None, conv_opts(pad, 0, channels))
}

/// Composite perceptual loss and its gradient with respect to `pred`,
/// mirroring [`crate::loss::PerceptualLoss::evaluate_with_grad`]. Returns the
/// scalar loss still on the device (single readback per epoch, done by the
/// caller) and the gradient tensor.
pub fn perceptual_loss_with_grad_gpu<B: Backend>(
    pred: Tensor<B, 4>,
    target: Tensor<B, 4>,
    horizontal: &Tensor<B, 4>,
    vertical: &Tensor<B, 4>,
    config: &LossConfig,
) -> (Tensor<B, 1>, Tensor<B, 4>) {
    let dims = pred.dims();
    let channels = dims[1];
    let c1 = (config.k1 * config.data_range).powi(2);
    let c2 = (config.k2 * config.data_range).powi(2);
    let omega = config.omega;

    let valid = |t: Tensor<B, 4>| window_filter(t, horizontal, vertical, 0, channels);

    let mu_x = valid(pred.clone());
    let mu_y = valid(target.clone());
    let vx = valid(pred.clone().mul(pred.clone())).sub(mu_x.clone().mul(mu_x.clone()));
    let vy = valid(target.clone().mul(target.clone())).sub(mu_y.clone().mul(mu_y.clone()));
    let cov = valid(pred.clone().mul(target.clone())).sub(mu_x.clone().mul(mu_y.clone()));

    let a1 = mu_x.clone().mul(mu_y.clone()).mul_scalar(2.0).add_scalar(c1);
    let a2 = cov.mul_scalar(2.0).add_scalar(c2);
    let b1 = mu_x
        .clone()
        .mul(mu_x.clone())
        .add(mu_y.clone().mul(mu_y.clone()))
        .add_scalar(c1);
    let b2 = vx.add(vy).add_scalar(c2);
    let denom = b1.clone().mul(b2.clone());
    let s = a1.clone().mul(a2.clone()).div(denom.clone());

    let s_dims = s.dims();
    let n_valid = (s_dims[0] * s_dims[1] * s_dims[2] * s_dims[3]) as f32;
    let ssim_mean = s.clone().mean();

    // Partials of the SSIM map with respect to the local statistics.
    let ds_dmu_x = mu_y
        .clone()
        .mul(a2)
        .div(denom.clone())
        .mul_scalar(2.0)
        .sub(mu_x.clone().mul(s.clone()).div(b1).mul_scalar(2.0));
    let ds_dvx = s.div(b2).neg();
    let ds_dcov = a1.mul_scalar(2.0).div(denom);

    let inner = ds_dmu_x
        .sub(mu_x.mul(ds_dvx.clone()).mul_scalar(2.0))
        .sub(mu_y.mul(ds_dcov.clone()));
    let adj_pad = config.window_size - 1;
    let adj = |t: Tensor<B, 4>| window_filter(t, horizontal, vertical, adj_pad, channels);
    let gx = adj(inner)
        .add(pred.clone().mul(adj(ds_dvx)).mul_scalar(2.0))
        .add(target.clone().mul(adj(ds_dcov)));

    let diff = pred.sub(target);
    let n_total = (dims[0] * dims[1] * dims[2] * dims[3]) as f32;
    let mse_mean = diff.clone().mul(diff.clone()).mean();

    let loss = ssim_mean
        .neg()
        .add_scalar(1.0)
        .mul_scalar(omega)
        .add(mse_mean.mul_scalar(1.0 - omega));
    let grad = gx
        .mul_scalar(-omega / n_valid)
        .add(diff.mul_scalar(2.0 * (1.0 - omega) / n_total));
    (loss, grad)
}
