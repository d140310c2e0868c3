//! Feature-extraction kernel: convolution and batch-norm primitives plus the
//! lightweight CNN used as a differentiable similarity probe.
//!
//! The extractor is never trained here — at correction time its weights are
//! fixed and the only gradient that matters is the one flowing **into the
//! image**. All backward passes are therefore closed-form input gradients,
//! derived by hand:
//!
//! ```text
//! conv (stride 1):   dx = conv(dy, flip-transpose(W))
//! batch norm:        dx = γ/σ · (dy − mean(dy) − x̂ · mean(dy ⊙ x̂))
//! relu:              dx = dy ⊙ [y > 0]
//! ```
//!
//! The batch-norm backward uses batch statistics when the extractor adapts
//! ([`StatsMode::Adapt`]) and collapses to a per-channel scale when the
//! statistics are frozen ([`StatsMode::Frozen`]).

use ndarray::{s, Array1, Array4, Axis, Zip};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Error type for correction operations.
#[derive(Debug, Clone)]
pub enum CorrectionError {
    /// Shape mismatch in tensor operations
    ShapeMismatch(String),
    /// Invalid extractor, loss, or loop configuration
    InvalidConfig(String),
    /// Checkpoint serialization or I/O failure
    Checkpoint(String),
}

impl fmt::Display for CorrectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionError::ShapeMismatch(msg) => write!(f, "Shape mismatch: {}", msg),
            CorrectionError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            CorrectionError::Checkpoint(msg) => write!(f, "Checkpoint: {}", msg),
        }
    }
}

impl Error for CorrectionError {}

pub type CorrectionResult<T> = Result<T, CorrectionError>;

/// Behavior of the extractor's normalization statistics during correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsMode {
    /// Normalize with batch statistics and keep updating the running
    /// estimates on every forward call (the original behavior).
    Adapt,
    /// Normalize with the stored running estimates; nothing mutates.
    Frozen,
}

/// Feature extractor architecture parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Image channels. Default 3.
    pub in_channels: usize,
    /// Feature-map channels after each convolution stage. Default 128.
    pub feature_channels: usize,
    /// Square convolution kernel edge, odd. Default 3.
    pub kernel_size: usize,
    /// Batch-norm variance floor. Default 1e-5.
    pub bn_eps: f32,
    /// Batch-norm running-statistics update rate. Default 0.1.
    pub bn_momentum: f32,
    /// Half-width of the uniform weight initialization. Default 0.05.
    pub init_scale: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            feature_channels: 128,
            kernel_size: 3,
            bn_eps: 1e-5,
            bn_momentum: 0.1,
            init_scale: 0.05,
        }
    }
}

// ============================================================================
// Convolution kernels
// ============================================================================

/// Swap the channel axes of a weight tensor and flip its spatial taps.
///
/// Maps `[a, b, k, k]` to `[b, a, k, k]` with both kernel axes reversed. For
/// stride-1 convolution this turns a forward kernel into the kernel of its
/// input gradient (and a transposed convolution into a plain one).
pub(crate) fn flip_transpose(weight: &Array4<f32>) -> Array4<f32> {
    let (a, b, kh, kw) = weight.dim();
    let mut out = Array4::zeros((b, a, kh, kw));
    for i in 0..a {
        for j in 0..b {
            for u in 0..kh {
                for v in 0..kw {
                    out[[j, i, kh - 1 - u, kw - 1 - v]] = weight[[i, j, u, v]];
                }
            }
        }
    }
    out
}

/// Stride-1 2D convolution with zero padding, via im2col and a single
/// matrix product per batch item.
///
/// `x` is `[batch, in_c, h, w]`, `weight` is `[out_c, in_c, k, k]`. Output
/// spatial extent is `h + 2*pad - k + 1`.
///
/// # Errors
/// `ShapeMismatch` if the channel counts disagree or the padded image is
/// smaller than the kernel.
pub(crate) fn conv2d(
    x: &Array4<f32>,
    weight: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    pad: usize,
) -> CorrectionResult<Array4<f32>> {
    let (batch, in_c, h, w) = x.dim();
    let (out_c, w_in_c, kh, kw) = weight.dim();

    if in_c != w_in_c {
        return Err(CorrectionError::ShapeMismatch(format!(
            "Convolution input channels: expected {}, got {}",
            w_in_c, in_c
        )));
    }
    if h + 2 * pad < kh || w + 2 * pad < kw {
        return Err(CorrectionError::ShapeMismatch(format!(
            "Padded image {}x{} smaller than kernel {}x{}",
            h + 2 * pad,
            w + 2 * pad,
            kh,
            kw
        )));
    }

    let h_out = h + 2 * pad - kh + 1;
    let w_out = w + 2 * pad - kw + 1;

    let w_mat = weight
        .view()
        .into_shape_with_order((out_c, in_c * kh * kw))
        .map_err(|e| CorrectionError::ShapeMismatch(e.to_string()))?;

    let mut out = Array4::zeros((batch, out_c, h_out, w_out));
    let mut col = ndarray::Array2::zeros((in_c * kh * kw, h_out * w_out));

    for b in 0..batch {
        col.fill(0.0);
        for c in 0..in_c {
            for ki in 0..kh {
                for kj in 0..kw {
                    let row = (c * kh + ki) * kw + kj;
                    for oi in 0..h_out {
                        let src_i = oi as isize + ki as isize - pad as isize;
                        if src_i < 0 || src_i >= h as isize {
                            continue;
                        }
                        for oj in 0..w_out {
                            let src_j = oj as isize + kj as isize - pad as isize;
                            if src_j < 0 || src_j >= w as isize {
                                continue;
                            }
                            col[[row, oi * w_out + oj]] =
                                x[[b, c, src_i as usize, src_j as usize]];
                        }
                    }
                }
            }
        }

        let out_mat = w_mat.dot(&col);
        let out_block = out_mat
            .into_shape_with_order((out_c, h_out, w_out))
            .map_err(|e| CorrectionError::ShapeMismatch(e.to_string()))?;
        out.slice_mut(s![b, .., .., ..]).assign(&out_block);
    }

    if let Some(bias) = bias {
        if bias.len() != out_c {
            return Err(CorrectionError::ShapeMismatch(format!(
                "Bias length: expected {}, got {}",
                out_c,
                bias.len()
            )));
        }
        for oc in 0..out_c {
            let mut channel = out.slice_mut(s![.., oc, .., ..]);
            channel += bias[oc];
        }
    }

    Ok(out)
}

/// Stride-1 convolution layer with a pre-flipped kernel for input gradients.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// Forward weights, `[out_c, in_c, k, k]`
    pub weight: Array4<f32>,
    /// Per-output-channel bias
    pub bias: Array1<f32>,
    /// `flip_transpose(weight)`, `[in_c, out_c, k, k]`
    flipped: Array4<f32>,
}

impl Conv2d {
    pub(crate) fn from_weights(weight: Array4<f32>, bias: Array1<f32>) -> Self {
        let flipped = flip_transpose(&weight);
        Self {
            weight,
            bias,
            flipped,
        }
    }

    fn random(out_c: usize, in_c: usize, k: usize, scale: f32, rng: &mut StdRng) -> Self {
        let dist = Uniform::new(-scale, scale);
        let weight = Array4::random_using((out_c, in_c, k, k), dist, rng);
        Self::from_weights(weight, Array1::zeros(out_c))
    }

    fn kernel_size(&self) -> usize {
        self.weight.dim().2
    }

    pub fn forward(&self, x: &Array4<f32>, pad: usize) -> CorrectionResult<Array4<f32>> {
        conv2d(x, &self.weight, Some(&self.bias), pad)
    }

    /// Gradient of the loss with respect to this layer's input, given the
    /// gradient with respect to its output. `forward_pad` is the padding the
    /// forward pass used; weights are held fixed.
    pub fn input_gradient(
        &self,
        dy: &Array4<f32>,
        forward_pad: usize,
    ) -> CorrectionResult<Array4<f32>> {
        let back_pad = self.kernel_size() - 1 - forward_pad;
        conv2d(dy, &self.flipped, None, back_pad)
    }

    /// The pre-flipped gradient kernel, `[in_c, out_c, k, k]`.
    pub fn flipped(&self) -> &Array4<f32> {
        &self.flipped
    }
}

/// Stride-1 transposed convolution layer (the reconstruction head).
///
/// With stride 1 a transposed convolution is a plain convolution with the
/// flip-transposed kernel, so the layer pre-computes that form once.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    /// Weights in transposed layout, `[in_c, out_c, k, k]`
    pub weight: Array4<f32>,
    /// Per-output-channel bias
    pub bias: Array1<f32>,
    /// `flip_transpose(weight)`, `[out_c, in_c, k, k]`
    as_conv: Array4<f32>,
}

impl ConvTranspose2d {
    pub(crate) fn from_weights(weight: Array4<f32>, bias: Array1<f32>) -> Self {
        let as_conv = flip_transpose(&weight);
        Self {
            weight,
            bias,
            as_conv,
        }
    }

    fn random(in_c: usize, out_c: usize, k: usize, scale: f32, rng: &mut StdRng) -> Self {
        let dist = Uniform::new(-scale, scale);
        let weight = Array4::random_using((in_c, out_c, k, k), dist, rng);
        Self::from_weights(weight, Array1::zeros(out_c))
    }

    pub fn forward(&self, x: &Array4<f32>, forward_pad: usize) -> CorrectionResult<Array4<f32>> {
        let k = self.weight.dim().2;
        conv2d(x, &self.as_conv, Some(&self.bias), k - 1 - forward_pad)
    }
}

// ============================================================================
// Batch normalization
// ============================================================================

/// Per-channel batch normalization over `[batch, channel, h, w]` tensors.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub eps: f32,
    pub momentum: f32,
}

/// Forward-pass intermediates needed by [`BatchNorm2d::backward`].
#[derive(Debug, Clone)]
pub struct BnCache {
    xhat: Array4<f32>,
    inv_std: Array1<f32>,
    mode: StatsMode,
}

impl Default for BnCache {
    fn default() -> Self {
        Self {
            xhat: Array4::zeros((0, 0, 0, 0)),
            inv_std: Array1::zeros(0),
            mode: StatsMode::Adapt,
        }
    }
}

impl BatchNorm2d {
    fn new(channels: usize, eps: f32, momentum: f32) -> Self {
        Self {
            gamma: Array1::ones(channels),
            beta: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            eps,
            momentum,
        }
    }

    /// Normalize `x`, filling `cache` for the backward pass.
    ///
    /// In [`StatsMode::Adapt`] the normalization uses batch statistics and
    /// the running estimates are updated (with the unbiased variance, the
    /// torch convention). In [`StatsMode::Frozen`] the stored running
    /// estimates are used and nothing mutates.
    pub fn forward(&mut self, x: &Array4<f32>, mode: StatsMode, cache: &mut BnCache) -> Array4<f32> {
        let (b, c, h, w) = x.dim();
        let m = (b * h * w) as f32;

        let mut y = Array4::zeros((b, c, h, w));
        let mut xhat = Array4::zeros((b, c, h, w));
        let mut inv_std = Array1::zeros(c);

        for ch in 0..c {
            let view = x.index_axis(Axis(1), ch);
            let (mean, var) = match mode {
                StatsMode::Adapt => {
                    let mean = view.sum() / m;
                    let var = view.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / m;
                    (mean, var)
                }
                StatsMode::Frozen => (self.running_mean[ch], self.running_var[ch]),
            };

            let inv = 1.0 / (var + self.eps).sqrt();
            inv_std[ch] = inv;
            let g = self.gamma[ch];
            let be = self.beta[ch];

            let mut xh = xhat.index_axis_mut(Axis(1), ch);
            let mut yv = y.index_axis_mut(Axis(1), ch);
            Zip::from(&mut xh).and(&mut yv).and(&view).for_each(|xh, yv, &v| {
                let n = (v - mean) * inv;
                *xh = n;
                *yv = g * n + be;
            });

            if mode == StatsMode::Adapt {
                let unbiased = if m > 1.0 { var * m / (m - 1.0) } else { var };
                self.running_mean[ch] =
                    (1.0 - self.momentum) * self.running_mean[ch] + self.momentum * mean;
                self.running_var[ch] =
                    (1.0 - self.momentum) * self.running_var[ch] + self.momentum * unbiased;
            }
        }

        cache.xhat = xhat;
        cache.inv_std = inv_std;
        cache.mode = mode;
        y
    }

    /// Input gradient for the forward pass recorded in `cache`.
    pub fn backward(&self, cache: &BnCache, dy: &Array4<f32>) -> Array4<f32> {
        let (b, c, h, w) = dy.dim();
        let m = (b * h * w) as f32;
        let mut dx = Array4::zeros((b, c, h, w));

        for ch in 0..c {
            let scale = self.gamma[ch] * cache.inv_std[ch];
            let dyv = dy.index_axis(Axis(1), ch);
            let mut dxv = dx.index_axis_mut(Axis(1), ch);

            match cache.mode {
                StatsMode::Frozen => {
                    Zip::from(&mut dxv).and(&dyv).for_each(|o, &d| *o = d * scale);
                }
                StatsMode::Adapt => {
                    let xh = cache.xhat.index_axis(Axis(1), ch);
                    let mean_dy = dyv.sum() / m;
                    let mean_dy_xh = Zip::from(&dyv)
                        .and(&xh)
                        .fold(0.0f32, |acc, &d, &x| acc + d * x)
                        / m;
                    Zip::from(&mut dxv).and(&dyv).and(&xh).for_each(|o, &d, &x| {
                        *o = scale * (d - mean_dy - x * mean_dy_xh);
                    });
                }
            }
        }

        dx
    }
}

// ============================================================================
// Feature extractor
// ============================================================================

fn relu(mut x: Array4<f32>) -> Array4<f32> {
    x.mapv_inplace(|v| v.max(0.0));
    x
}

/// Forward-pass intermediates for one [`FeatureExtractor::extract_cached`]
/// call, reused across loop iterations and consumed by
/// [`FeatureExtractor::backward_input`].
#[derive(Debug, Clone)]
pub struct Activations {
    h1: Array4<f32>,
    bn1: BnCache,
    bn2: BnCache,
    feat: Array4<f32>,
}

impl Default for Activations {
    fn default() -> Self {
        Self {
            h1: Array4::zeros((0, 0, 0, 0)),
            bn1: BnCache::default(),
            bn2: BnCache::default(),
            feat: Array4::zeros((0, 0, 0, 0)),
        }
    }
}

impl Activations {
    /// The feature tensor produced by the cached forward pass.
    pub fn features(&self) -> &Array4<f32> {
        &self.feat
    }
}

/// Lightweight two-stage CNN used as a differentiable similarity probe.
///
/// # Architecture
///
/// - `conv1`: in → feature channels, same-padded, then batch norm and ReLU
/// - `conv2`: feature → feature channels, same-padded, then batch norm and
///   ReLU — the output of this stage is the **feature tensor**
/// - `deconv`: feature → in channels, output clamped to `[0, 1]` — the
///   direct-use reconstruction head, unused by the correction loop
///
/// # Weight initialization
///
/// Weights from U(-init_scale, init_scale), biases zero, batch-norm gamma 1
/// and beta 0.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    pub config: ExtractorConfig,
    pub conv1: Conv2d,
    pub bn1: BatchNorm2d,
    pub conv2: Conv2d,
    pub bn2: BatchNorm2d,
    pub deconv: ConvTranspose2d,
    mode: StatsMode,
}

impl FeatureExtractor {
    /// Create an extractor with entropy-seeded random weights.
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration is unusable (see
    /// [`FeatureExtractor::with_rng`]).
    pub fn new(config: ExtractorConfig) -> CorrectionResult<Self> {
        let mut rng = StdRng::from_entropy();
        Self::with_rng(config, &mut rng)
    }

    /// Create an extractor drawing its weights from the given RNG, for
    /// reproducible runs.
    ///
    /// # Errors
    /// `InvalidConfig` if a channel count is zero, the kernel edge is even or
    /// zero, or a numeric parameter is out of range.
    pub fn with_rng(config: ExtractorConfig, rng: &mut StdRng) -> CorrectionResult<Self> {
        if config.in_channels == 0 || config.feature_channels == 0 {
            return Err(CorrectionError::InvalidConfig(
                "Channel counts must be > 0".to_string(),
            ));
        }
        if config.kernel_size == 0 || config.kernel_size % 2 == 0 {
            return Err(CorrectionError::InvalidConfig(format!(
                "Kernel size must be odd and positive, got {}",
                config.kernel_size
            )));
        }
        if config.bn_eps <= 0.0 || config.init_scale <= 0.0 {
            return Err(CorrectionError::InvalidConfig(
                "bn_eps and init_scale must be positive".to_string(),
            ));
        }
        if config.bn_momentum <= 0.0 || config.bn_momentum > 1.0 {
            return Err(CorrectionError::InvalidConfig(format!(
                "bn_momentum must be in (0, 1], got {}",
                config.bn_momentum
            )));
        }

        let k = config.kernel_size;
        let fc = config.feature_channels;
        let ic = config.in_channels;
        let scale = config.init_scale;

        Ok(Self {
            conv1: Conv2d::random(fc, ic, k, scale, rng),
            bn1: BatchNorm2d::new(fc, config.bn_eps, config.bn_momentum),
            conv2: Conv2d::random(fc, fc, k, scale, rng),
            bn2: BatchNorm2d::new(fc, config.bn_eps, config.bn_momentum),
            deconv: ConvTranspose2d::random(fc, ic, k, scale, rng),
            mode: StatsMode::Adapt,
            config,
        })
    }

    /// Rebuild an extractor from persisted parts (checkpoint restore).
    pub(crate) fn from_parts(
        config: ExtractorConfig,
        conv1: Conv2d,
        bn1: BatchNorm2d,
        conv2: Conv2d,
        bn2: BatchNorm2d,
        deconv: ConvTranspose2d,
    ) -> Self {
        Self {
            config,
            conv1,
            bn1,
            conv2,
            bn2,
            deconv,
            mode: StatsMode::Adapt,
        }
    }

    pub fn stats_mode(&self) -> StatsMode {
        self.mode
    }

    pub fn set_stats_mode(&mut self, mode: StatsMode) {
        self.mode = mode;
    }

    fn same_pad(&self) -> usize {
        (self.config.kernel_size - 1) / 2
    }

    fn check_input(&self, x: &Array4<f32>) -> CorrectionResult<()> {
        let (_, c, h, w) = x.dim();
        if c != self.config.in_channels {
            return Err(CorrectionError::ShapeMismatch(format!(
                "Input channels: expected {}, got {}",
                self.config.in_channels, c
            )));
        }
        if h == 0 || w == 0 {
            return Err(CorrectionError::ShapeMismatch(
                "Input has zero spatial extent".to_string(),
            ));
        }
        Ok(())
    }

    /// Feature tap: run both convolution stages and return the feature
    /// tensor, discarding the backward cache.
    ///
    /// # Errors
    /// `ShapeMismatch` if the input channel count disagrees with the config.
    pub fn extract(&mut self, x: &Array4<f32>) -> CorrectionResult<Array4<f32>> {
        let mut acts = Activations::default();
        self.extract_cached(x, &mut acts)?;
        Ok(acts.feat)
    }

    /// Feature tap that records every intermediate needed by
    /// [`backward_input`](FeatureExtractor::backward_input) into `acts`.
    pub fn extract_cached(
        &mut self,
        x: &Array4<f32>,
        acts: &mut Activations,
    ) -> CorrectionResult<()> {
        self.check_input(x)?;
        let pad = self.same_pad();
        let mode = self.mode;

        let u1 = self.conv1.forward(x, pad)?;
        let y1 = self.bn1.forward(&u1, mode, &mut acts.bn1);
        let h1 = relu(y1);

        let u2 = self.conv2.forward(&h1, pad)?;
        let y2 = self.bn2.forward(&u2, mode, &mut acts.bn2);

        acts.feat = relu(y2);
        acts.h1 = h1;
        Ok(())
    }

    /// Gradient of the loss with respect to the **input image**, given the
    /// gradient with respect to the feature tensor of the forward pass
    /// recorded in `acts`. Weights stay fixed.
    ///
    /// # Errors
    /// `ShapeMismatch` if `dfeat` does not match the cached feature tensor.
    pub fn backward_input(
        &self,
        acts: &Activations,
        dfeat: &Array4<f32>,
    ) -> CorrectionResult<Array4<f32>> {
        if dfeat.dim() != acts.feat.dim() {
            return Err(CorrectionError::ShapeMismatch(format!(
                "Feature gradient {:?} vs cached features {:?}",
                dfeat.dim(),
                acts.feat.dim()
            )));
        }
        let pad = self.same_pad();

        // Stage 2 backward: ReLU mask, batch norm, convolution.
        let mut dy2 = dfeat.clone();
        Zip::from(&mut dy2).and(&acts.feat).for_each(|d, &f| {
            if f <= 0.0 {
                *d = 0.0;
            }
        });
        let du2 = self.bn2.backward(&acts.bn2, &dy2);
        let mut dh1 = self.conv2.input_gradient(&du2, pad)?;

        // Stage 1 backward.
        Zip::from(&mut dh1).and(&acts.h1).for_each(|d, &f| {
            if f <= 0.0 {
                *d = 0.0;
            }
        });
        let du1 = self.bn1.backward(&acts.bn1, &dh1);
        self.conv1.input_gradient(&du1, pad)
    }

    /// Full reconstruction pass: features through the transposed-convolution
    /// head, clamped to `[0, 1]`. Not used by the correction loop.
    pub fn forward(&mut self, x: &Array4<f32>) -> CorrectionResult<Array4<f32>> {
        let mut acts = Activations::default();
        self.extract_cached(x, &mut acts)?;
        let mut out = self.deconv.forward(&acts.feat, self.same_pad())?;
        out.mapv_inplace(|v| v.clamp(0.0, 1.0));
        Ok(out)
    }
}
