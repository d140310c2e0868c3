//! GPU-accelerated correction using the burn framework.
//!
//! Provides GPU-based tensor operations via configurable backend (wgpu or
//! CUDA). The correction loop mirrors the CPU path in [`crate::correction`]
//! op for op — same closed-form gradients, same convergence bookkeeping —
//! with one scalar readback per epoch (the loss steers the control flow).

pub mod convert;
pub mod tensors;

// Prevent enabling both backends simultaneously
#[cfg(all(feature = "cuda", feature = "wgpu"))]
compile_error!("Features `cuda` and `wgpu` are mutually exclusive. Use --no-default-features --features cuda for CUDA.");

/// GPU backend type alias — resolves at compile time based on feature flags.
#[cfg(feature = "cuda")]
pub type GpuBackend = burn::backend::CudaJit;
#[cfg(not(feature = "cuda"))]
pub type GpuBackend = burn::backend::wgpu::Wgpu;

use burn::prelude::*;
use ndarray::Array4;

use crate::core::{CorrectionResult, ExtractorConfig, FeatureExtractor, StatsMode};
use crate::correction::{
    Correction, ConvergenceTracker, CorrectionObserver, EpochRecord, PlateauScheduler, StopReason,
};
use crate::CorrectionConfig;

use convert::{array1_to_channel_tensor, array1_to_tensor, array4_to_tensor, channel_tensor_to_array1, tensor_to_array4};
use tensors::{
    extract_features_cached_gpu, extract_features_gpu, gaussian_window_gpu, input_gradient_gpu,
    perceptual_loss_with_grad_gpu,
};

/// Initialize the GPU device for the active backend.
#[cfg(feature = "cuda")]
pub fn init_device() -> <GpuBackend as burn::prelude::Backend>::Device {
    burn::backend::cuda_jit::CudaDevice { index: 0 }
}

/// Initialize the GPU device for the active backend.
#[cfg(not(feature = "cuda"))]
pub fn init_device() -> <GpuBackend as burn::prelude::Backend>::Device {
    burn::backend::wgpu::WgpuDevice::default()
}

/// Feature extractor weights held as device tensors.
///
/// Weights never change on the device (only the image is optimized); the
/// batch-norm running statistics do drift in [`StatsMode::Adapt`] and can be
/// copied back with [`GpuExtractor::to_cpu`].
pub struct GpuExtractor<B: Backend> {
    pub config: ExtractorConfig,
    pub(crate) mode: StatsMode,
    pub device: B::Device,
    pub(crate) w1: Tensor<B, 4>,
    pub(crate) b1: Tensor<B, 1>,
    pub(crate) w1_flip: Tensor<B, 4>,
    pub(crate) g1: Tensor<B, 4>,
    pub(crate) beta1: Tensor<B, 4>,
    pub(crate) rm1: Tensor<B, 4>,
    pub(crate) rv1: Tensor<B, 4>,
    pub(crate) w2: Tensor<B, 4>,
    pub(crate) b2: Tensor<B, 1>,
    pub(crate) w2_flip: Tensor<B, 4>,
    pub(crate) g2: Tensor<B, 4>,
    pub(crate) beta2: Tensor<B, 4>,
    pub(crate) rm2: Tensor<B, 4>,
    pub(crate) rv2: Tensor<B, 4>,
}

impl<B: Backend> GpuExtractor<B> {
    /// Create a GpuExtractor from a CPU extractor by copying weights (and
    /// their pre-flipped gradient kernels) to the device.
    pub fn from_cpu(extractor: &FeatureExtractor, device: &B::Device) -> Self {
        Self {
            config: extractor.config.clone(),
            mode: extractor.stats_mode(),
            device: device.clone(),
            w1: array4_to_tensor(&extractor.conv1.weight, device),
            b1: array1_to_tensor(&extractor.conv1.bias, device),
            w1_flip: array4_to_tensor(extractor.conv1.flipped(), device),
            g1: array1_to_channel_tensor(&extractor.bn1.gamma, device),
            beta1: array1_to_channel_tensor(&extractor.bn1.beta, device),
            rm1: array1_to_channel_tensor(&extractor.bn1.running_mean, device),
            rv1: array1_to_channel_tensor(&extractor.bn1.running_var, device),
            w2: array4_to_tensor(&extractor.conv2.weight, device),
            b2: array1_to_tensor(&extractor.conv2.bias, device),
            w2_flip: array4_to_tensor(extractor.conv2.flipped(), device),
            g2: array1_to_channel_tensor(&extractor.bn2.gamma, device),
            beta2: array1_to_channel_tensor(&extractor.bn2.beta, device),
            rm2: array1_to_channel_tensor(&extractor.bn2.running_mean, device),
            rv2: array1_to_channel_tensor(&extractor.bn2.running_var, device),
        }
    }

    /// Copy the drifted running statistics back to a CPU extractor for
    /// checkpointing.
    pub fn to_cpu(&self, extractor: &mut FeatureExtractor) {
        extractor.bn1.running_mean = channel_tensor_to_array1(self.rm1.clone());
        extractor.bn1.running_var = channel_tensor_to_array1(self.rv1.clone());
        extractor.bn2.running_mean = channel_tensor_to_array1(self.rm2.clone());
        extractor.bn2.running_var = channel_tensor_to_array1(self.rv2.clone());
    }

    pub fn stats_mode(&self) -> StatsMode {
        self.mode
    }

    pub fn set_stats_mode(&mut self, mode: StatsMode) {
        self.mode = mode;
    }
}

/// GPU mirror of [`crate::correction::correct_single`].
///
/// Data flow per epoch:
/// 1. Reference and subject features on the device
/// 2. Composite loss and its gradient, pushed back into the subject pixels
/// 3. Momentum-SGD step on the subject tensor (still on device)
/// 4. One scalar loss readback for the convergence bookkeeping
///
/// # Errors
/// Same taxonomy as the CPU loop: `InvalidConfig` and `ShapeMismatch` are
/// checked host-side before any upload.
pub fn correct_gpu<B: Backend>(
    extractor: &mut GpuExtractor<B>,
    initial: &Array4<f32>,
    original: &Array4<f32>,
    config: &CorrectionConfig,
    observer: &mut dyn CorrectionObserver,
) -> CorrectionResult<Correction> {
    use crate::core::CorrectionError;

    config.validate()?;
    if initial.dim() != original.dim() {
        return Err(CorrectionError::ShapeMismatch(format!(
            "Initial EI {:?} vs original EI {:?}",
            initial.dim(),
            original.dim()
        )));
    }
    let (_, channels, h, w) = initial.dim();
    if channels != extractor.config.in_channels {
        return Err(CorrectionError::ShapeMismatch(format!(
            "Input channels: expected {}, got {}",
            extractor.config.in_channels, channels
        )));
    }
    let win = config.loss.window_size;
    if h < win || w < win {
        return Err(CorrectionError::ShapeMismatch(format!(
            "SSIM window {} exceeds spatial extent {}x{}",
            win, h, w
        )));
    }

    extractor.set_stats_mode(config.stats_mode);
    let device = extractor.device.clone();
    let (horizontal, vertical) = gaussian_window_gpu::<B>(
        config.loss.window_size,
        config.loss.sigma,
        extractor.config.feature_channels,
        &device,
    );

    let target = array4_to_tensor::<B>(original, &device);
    let mut subject = array4_to_tensor::<B>(initial, &device);
    let mut best = subject.clone();
    let mut velocity = Tensor::<B, 4>::zeros(subject.dims(), &device);

    let mut scheduler = PlateauScheduler::new(config.learning_rate, &config.scheduler);
    let mut tracker = ConvergenceTracker::new(config.improvement_epsilon);

    let mut history = Vec::with_capacity(config.epochs);
    let mut stop = StopReason::EpochBudgetExhausted;
    let mut epochs_run = 0;

    for epoch in 1..=config.epochs {
        let target_features = extract_features_gpu(extractor, target.clone());
        let (features, acts) = extract_features_cached_gpu(extractor, subject.clone());

        let (loss_tensor, dfeat) = perceptual_loss_with_grad_gpu(
            features,
            target_features,
            &horizontal,
            &vertical,
            &config.loss,
        );
        let grad = input_gradient_gpu(extractor, &acts, dfeat);

        velocity = velocity.mul_scalar(config.momentum).add(grad);
        subject = subject.sub(velocity.clone().mul_scalar(scheduler.lr()));

        let loss = loss_tensor
            .into_data()
            .to_vec::<f32>()
            .expect("loss readback")[0];

        history.push(loss);
        if tracker.observe(loss) {
            best = subject.clone();
        }

        observer.on_epoch(&EpochRecord {
            epoch,
            loss,
            best_loss: tracker.best_loss(),
            stall: tracker.stall(),
            learning_rate: scheduler.lr(),
        });

        scheduler.step(loss);

        epochs_run = epoch;
        if tracker.best_loss() < config.threshold || tracker.stall() >= config.patience {
            stop = StopReason::Converged;
            break;
        }
    }

    Ok(Correction {
        preliminary: tensor_to_array4(best),
        loss_history: history,
        best_loss: tracker.best_loss(),
        epochs_run,
        stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::{correct_single, SilentObserver};
    use crate::utils::seeded_rng;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn test_device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    fn small_extractor(seed: u64) -> FeatureExtractor {
        let mut rng = seeded_rng(seed);
        FeatureExtractor::with_rng(
            ExtractorConfig {
                in_channels: 1,
                feature_channels: 2,
                ..ExtractorConfig::default()
            },
            &mut rng,
        )
        .expect("extractor")
    }

    fn small_config() -> CorrectionConfig {
        CorrectionConfig {
            epochs: 3,
            loss: crate::LossConfig {
                window_size: 5,
                ..crate::LossConfig::default()
            },
            ..CorrectionConfig::default()
        }
    }

    #[test]
    fn test_features_match_cpu() {
        let mut cpu = small_extractor(61);
        let device = test_device();
        let mut gpu: GpuExtractor<TestBackend> = GpuExtractor::from_cpu(&cpu, &device);

        let x = crate::data::noise(1, 1, 8, 8, 4);
        let cpu_feat = cpu.extract(&x).expect("cpu features");
        let gpu_feat = tensor_to_array4(extract_features_gpu(&mut gpu, array4_to_tensor(&x, &device)));

        assert_eq!(cpu_feat.dim(), gpu_feat.dim());
        for (a, b) in cpu_feat.iter().zip(gpu_feat.iter()) {
            assert!((a - b).abs() < 1e-3, "feature mismatch: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_loss_and_gradient_match_cpu() {
        let device = test_device();
        let pred = crate::data::noise(1, 2, 10, 10, 8);
        let target = crate::data::noise(1, 2, 10, 10, 9);

        let loss_config = crate::LossConfig {
            window_size: 5,
            ..crate::LossConfig::default()
        };
        let cpu_loss = crate::PerceptualLoss::new(loss_config.clone()).expect("loss");
        let (cpu_value, cpu_grad) = cpu_loss.evaluate_with_grad(&pred, &target).expect("grad");

        let (horizontal, vertical) =
            gaussian_window_gpu::<TestBackend>(loss_config.window_size, loss_config.sigma, 2, &device);
        let (gpu_value_t, gpu_grad_t) = perceptual_loss_with_grad_gpu(
            array4_to_tensor(&pred, &device),
            array4_to_tensor(&target, &device),
            &horizontal,
            &vertical,
            &loss_config,
        );
        let gpu_value = gpu_value_t.into_data().to_vec::<f32>().expect("value")[0];
        let gpu_grad = tensor_to_array4(gpu_grad_t);

        assert!(
            (cpu_value - gpu_value).abs() < 1e-4,
            "loss mismatch: {} vs {}",
            cpu_value,
            gpu_value
        );
        for (a, b) in cpu_grad.iter().zip(gpu_grad.iter()) {
            assert!((a - b).abs() < 1e-3, "gradient mismatch: {} vs {}", a, b);
        }
    }

    #[test]
    fn test_correct_gpu_identity_converges_immediately() {
        let cpu = small_extractor(62);
        let device = test_device();
        let mut gpu: GpuExtractor<TestBackend> = GpuExtractor::from_cpu(&cpu, &device);

        let ei = crate::data::checkerboard(1, 1, 8, 8, 2);
        let result =
            correct_gpu(&mut gpu, &ei, &ei, &small_config(), &mut SilentObserver).expect("gpu run");

        assert_eq!(result.stop, StopReason::Converged);
        assert_eq!(result.epochs_run, 1);
        assert!(result.best_loss < small_config().threshold);
    }

    #[test]
    fn test_correct_gpu_matches_cpu() {
        let cpu_template = small_extractor(63);
        let device = test_device();
        let mut gpu: GpuExtractor<TestBackend> = GpuExtractor::from_cpu(&cpu_template, &device);
        let mut cpu = cpu_template.clone();

        let original = crate::data::checkerboard(1, 1, 10, 10, 2);
        let initial = crate::data::defocus(&original, 1.0);
        let config = small_config();

        let cpu_result =
            correct_single(&mut cpu, &initial, &original, &config, &mut SilentObserver)
                .expect("cpu run");
        let gpu_result =
            correct_gpu(&mut gpu, &initial, &original, &config, &mut SilentObserver)
                .expect("gpu run");

        assert_eq!(cpu_result.epochs_run, gpu_result.epochs_run);
        assert!(
            (cpu_result.best_loss - gpu_result.best_loss).abs() < 5e-3,
            "best loss drift: cpu {} vs gpu {}",
            cpu_result.best_loss,
            gpu_result.best_loss
        );
    }

    #[test]
    fn test_correct_gpu_rejects_shape_mismatch() {
        let cpu = small_extractor(64);
        let device = test_device();
        let mut gpu: GpuExtractor<TestBackend> = GpuExtractor::from_cpu(&cpu, &device);

        let a = ndarray::Array4::<f32>::zeros((1, 1, 8, 8));
        let b = ndarray::Array4::<f32>::zeros((1, 1, 10, 10));
        assert!(correct_gpu(&mut gpu, &a, &b, &small_config(), &mut SilentObserver).is_err());
    }

    #[test]
    fn test_running_stats_transfer_back() {
        let cpu = small_extractor(65);
        let device = test_device();
        let mut gpu: GpuExtractor<TestBackend> = GpuExtractor::from_cpu(&cpu, &device);

        let x = crate::data::noise(1, 1, 8, 8, 12);
        let _ = extract_features_gpu(&mut gpu, array4_to_tensor(&x, &device));

        let mut restored = cpu.clone();
        gpu.to_cpu(&mut restored);
        // One adapt-mode forward must have moved the running mean.
        let drift: f32 = restored
            .bn1
            .running_mean
            .iter()
            .zip(cpu.bn1.running_mean.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(drift > 0.0, "running statistics should have drifted");
    }
}
