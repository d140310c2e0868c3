//! Extractor weight persistence.
//!
//! Checkpoints carry everything needed to rebuild a [`FeatureExtractor`]:
//! the architecture config, both convolution stages, the reconstruction
//! head, and the batch-norm parameters *including* the running statistics
//! (which drift during correction in [`crate::StatsMode::Adapt`]).

use crate::core::{
    BatchNorm2d, Conv2d, ConvTranspose2d, CorrectionError, CorrectionResult, ExtractorConfig,
    FeatureExtractor,
};
use ndarray::{Array1, Array4};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Serialized form of one extractor.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractorCheckpoint {
    pub config: ExtractorConfig,
    pub conv1_weight: Array4<f32>,
    pub conv1_bias: Array1<f32>,
    pub bn1_gamma: Array1<f32>,
    pub bn1_beta: Array1<f32>,
    pub bn1_running_mean: Array1<f32>,
    pub bn1_running_var: Array1<f32>,
    pub conv2_weight: Array4<f32>,
    pub conv2_bias: Array1<f32>,
    pub bn2_gamma: Array1<f32>,
    pub bn2_beta: Array1<f32>,
    pub bn2_running_mean: Array1<f32>,
    pub bn2_running_var: Array1<f32>,
    pub deconv_weight: Array4<f32>,
    pub deconv_bias: Array1<f32>,
}

impl ExtractorCheckpoint {
    pub fn from_extractor(extractor: &FeatureExtractor) -> Self {
        Self {
            config: extractor.config.clone(),
            conv1_weight: extractor.conv1.weight.clone(),
            conv1_bias: extractor.conv1.bias.clone(),
            bn1_gamma: extractor.bn1.gamma.clone(),
            bn1_beta: extractor.bn1.beta.clone(),
            bn1_running_mean: extractor.bn1.running_mean.clone(),
            bn1_running_var: extractor.bn1.running_var.clone(),
            conv2_weight: extractor.conv2.weight.clone(),
            conv2_bias: extractor.conv2.bias.clone(),
            bn2_gamma: extractor.bn2.gamma.clone(),
            bn2_beta: extractor.bn2.beta.clone(),
            bn2_running_mean: extractor.bn2.running_mean.clone(),
            bn2_running_var: extractor.bn2.running_var.clone(),
            deconv_weight: extractor.deconv.weight.clone(),
            deconv_bias: extractor.deconv.bias.clone(),
        }
    }

    /// Rebuild the extractor, re-deriving the flipped gradient kernels.
    ///
    /// # Errors
    /// `ShapeMismatch` if the stored tensors disagree with the stored config.
    pub fn into_extractor(self) -> CorrectionResult<FeatureExtractor> {
        let fc = self.config.feature_channels;
        let ic = self.config.in_channels;
        let k = self.config.kernel_size;

        check_shape("conv1 weight", self.conv1_weight.dim(), (fc, ic, k, k))?;
        check_shape("conv2 weight", self.conv2_weight.dim(), (fc, fc, k, k))?;
        check_shape("deconv weight", self.deconv_weight.dim(), (fc, ic, k, k))?;
        check_len("conv1 bias", self.conv1_bias.len(), fc)?;
        check_len("conv2 bias", self.conv2_bias.len(), fc)?;
        check_len("deconv bias", self.deconv_bias.len(), ic)?;
        check_len("bn1 gamma", self.bn1_gamma.len(), fc)?;
        check_len("bn2 gamma", self.bn2_gamma.len(), fc)?;

        let bn1 = BatchNorm2d {
            gamma: self.bn1_gamma,
            beta: self.bn1_beta,
            running_mean: self.bn1_running_mean,
            running_var: self.bn1_running_var,
            eps: self.config.bn_eps,
            momentum: self.config.bn_momentum,
        };
        let bn2 = BatchNorm2d {
            gamma: self.bn2_gamma,
            beta: self.bn2_beta,
            running_mean: self.bn2_running_mean,
            running_var: self.bn2_running_var,
            eps: self.config.bn_eps,
            momentum: self.config.bn_momentum,
        };

        Ok(FeatureExtractor::from_parts(
            self.config,
            Conv2d::from_weights(self.conv1_weight, self.conv1_bias),
            bn1,
            Conv2d::from_weights(self.conv2_weight, self.conv2_bias),
            bn2,
            ConvTranspose2d::from_weights(self.deconv_weight, self.deconv_bias),
        ))
    }
}

fn check_shape(
    name: &str,
    got: (usize, usize, usize, usize),
    expected: (usize, usize, usize, usize),
) -> CorrectionResult<()> {
    if got != expected {
        return Err(CorrectionError::ShapeMismatch(format!(
            "Checkpoint {}: expected {:?}, got {:?}",
            name, expected, got
        )));
    }
    Ok(())
}

fn check_len(name: &str, got: usize, expected: usize) -> CorrectionResult<()> {
    if got != expected {
        return Err(CorrectionError::ShapeMismatch(format!(
            "Checkpoint {}: expected length {}, got {}",
            name, expected, got
        )));
    }
    Ok(())
}

/// Write an extractor checkpoint as JSON.
///
/// # Errors
/// `Checkpoint` on file or serialization failure.
pub fn save_extractor<P: AsRef<Path>>(
    path: P,
    extractor: &FeatureExtractor,
) -> CorrectionResult<()> {
    let file = File::create(path.as_ref())
        .map_err(|e| CorrectionError::Checkpoint(format!("create: {}", e)))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, &ExtractorCheckpoint::from_extractor(extractor))
        .map_err(|e| CorrectionError::Checkpoint(format!("serialize: {}", e)))
}

/// Read an extractor checkpoint from JSON.
///
/// # Errors
/// `Checkpoint` on file or deserialization failure, `ShapeMismatch` if the
/// stored tensors drifted from the stored config.
pub fn load_extractor<P: AsRef<Path>>(path: P) -> CorrectionResult<FeatureExtractor> {
    let file = File::open(path.as_ref())
        .map_err(|e| CorrectionError::Checkpoint(format!("open: {}", e)))?;
    let reader = BufReader::new(file);
    let checkpoint: ExtractorCheckpoint = serde_json::from_reader(reader)
        .map_err(|e| CorrectionError::Checkpoint(format!("deserialize: {}", e)))?;
    checkpoint.into_extractor()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StatsMode;
    use crate::utils::seeded_rng;
    use approx::assert_abs_diff_eq;

    fn small_extractor() -> FeatureExtractor {
        let mut rng = seeded_rng(41);
        FeatureExtractor::with_rng(
            ExtractorConfig {
                in_channels: 2,
                feature_channels: 3,
                ..ExtractorConfig::default()
            },
            &mut rng,
        )
        .expect("extractor")
    }

    #[test]
    fn test_round_trip_preserves_behavior() {
        let mut ex = small_extractor();

        // Let the running statistics drift before the round trip.
        let warmup = crate::data::noise(1, 2, 6, 6, 5);
        ex.extract(&warmup).expect("warmup");

        let restored = ExtractorCheckpoint::from_extractor(&ex)
            .into_extractor()
            .expect("restore");

        let mut ex_frozen = ex.clone();
        let mut restored_frozen = restored;
        ex_frozen.set_stats_mode(StatsMode::Frozen);
        restored_frozen.set_stats_mode(StatsMode::Frozen);

        let probe = crate::data::noise(1, 2, 6, 6, 6);
        let a = ex_frozen.extract(&probe).expect("a");
        let b = restored_frozen.extract(&probe).expect("b");
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_save_and_load_file() {
        let ex = small_extractor();
        let dir = std::env::temp_dir().join("eipc-checkpoint-test");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("extractor.json");

        save_extractor(&path, &ex).expect("save");
        let restored = load_extractor(&path).expect("load");
        assert_eq!(restored.config.feature_channels, 3);
        for (a, b) in ex.conv1.weight.iter().zip(restored.conv1.weight.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_shape_drift_rejected() {
        let ex = small_extractor();
        let mut ckpt = ExtractorCheckpoint::from_extractor(&ex);
        ckpt.conv1_weight = Array4::zeros((1, 1, 3, 3));
        assert!(ckpt.into_extractor().is_err());
    }
}
