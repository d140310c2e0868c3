//! EI pre-correction demo binary.
//!
//! Synthesizes aberration-free target EIs, degrades them with a defocus
//! stand-in for the upstream optical simulation, runs the pixel-space
//! correction loop (CPU, Rayon-batched, or GPU), and writes JSONL metrics
//! for real-time dashboard tailing.

use clap::Parser;
use eipc::checkpoint::{load_extractor, save_extractor};
use eipc::correction::{
    correct_batch_parallel, correct_single, CorrectionObserver, EpochRecord, StderrReporter,
    StopReason,
};
use eipc::gpu::{self, GpuExtractor};
use eipc::utils::{seeded_rng, tensor_stats};
use eipc::{data, CorrectionConfig, ExtractorConfig, FeatureExtractor, LossConfig, StatsMode};
use ndarray::Array4;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "eipc-correct",
    about = "Pre-correct synthetic elemental images against their ideal references"
)]
struct Args {
    /// EI height in pixels
    #[arg(long, default_value_t = 104)]
    height: usize,

    /// EI width in pixels
    #[arg(long, default_value_t = 104)]
    width: usize,

    /// Image channels
    #[arg(long, default_value_t = 3)]
    channels: usize,

    /// Feature-map channels of the extractor
    #[arg(long, default_value_t = 128)]
    feature_channels: usize,

    /// Number of EIs to correct
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Checkerboard tile edge of the synthetic target
    #[arg(long, default_value_t = 8)]
    tile: usize,

    /// Defocus sigma of the synthetic aberration stand-in
    #[arg(long, default_value_t = 1.5)]
    blur_sigma: f32,

    /// Epoch budget per EI
    #[arg(long, default_value_t = 120)]
    epochs: usize,

    /// Initial learning rate
    #[arg(long, default_value_t = 5e-3)]
    lr: f32,

    /// Convergence threshold on the best loss
    #[arg(long, default_value_t = 1e-4)]
    threshold: f32,

    /// Early-stop patience
    #[arg(long, default_value_t = 10)]
    patience: usize,

    /// SSIM weight in the composite loss
    #[arg(long, default_value_t = 0.8)]
    omega: f32,

    /// RNG seed for weights and synthetic data
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "data/output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Checkpoint directory
    #[arg(long, default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Resume extractor weights from a checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Use GPU acceleration (wgpu backend by default)
    #[arg(long, default_value_t = false)]
    gpu: bool,

    /// Correct EIs in Rayon-parallel batches (CPU only)
    #[arg(long, default_value_t = false)]
    parallel: bool,

    /// Freeze the extractor's normalization statistics
    #[arg(long, default_value_t = false)]
    freeze_stats: bool,
}

/// Observer appending one JSON object per epoch, with a stderr status line.
struct JsonlReporter {
    file: File,
    stderr: StderrReporter,
}

impl CorrectionObserver for JsonlReporter {
    fn on_epoch(&mut self, record: &EpochRecord) {
        let line = serde_json::to_string(record).expect("serialize record");
        writeln!(self.file, "{}", line).expect("write metrics");
        self.stderr.on_epoch(record);
    }
}

fn stop_label(stop: StopReason) -> &'static str {
    match stop {
        StopReason::Converged => "converged",
        StopReason::EpochBudgetExhausted => "epoch budget exhausted",
    }
}

fn save_ei(path: &PathBuf, ei: &Array4<f32>) {
    let file = File::create(path).expect("create EI output file");
    serde_json::to_writer(file, ei).expect("serialize EI");
}

fn main() {
    let args = Args::parse();

    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent).expect("create metrics output directory");
    }
    fs::create_dir_all(&args.checkpoint_dir).expect("create checkpoint directory");

    let mut rng = seeded_rng(args.seed);
    let extractor = if let Some(ref path) = args.resume {
        eprintln!("Resuming extractor from {}", path.display());
        load_extractor(path).expect("load extractor checkpoint")
    } else {
        FeatureExtractor::with_rng(
            ExtractorConfig {
                in_channels: args.channels,
                feature_channels: args.feature_channels,
                ..ExtractorConfig::default()
            },
            &mut rng,
        )
        .expect("create extractor")
    };

    let config = CorrectionConfig {
        learning_rate: args.lr,
        epochs: args.epochs,
        threshold: args.threshold,
        patience: args.patience,
        stats_mode: if args.freeze_stats {
            StatsMode::Frozen
        } else {
            StatsMode::Adapt
        },
        loss: LossConfig {
            omega: args.omega,
            ..LossConfig::default()
        },
        ..CorrectionConfig::default()
    };
    config.validate().expect("correction config");

    eprintln!("EI Pre-Correction");
    eprintln!(
        "  EI: {}x{}x{}, count: {}",
        args.channels, args.height, args.width, args.count
    );
    eprintln!(
        "  Extractor: {} -> {} channels, kernel {}",
        extractor.config.in_channels, extractor.config.feature_channels,
        extractor.config.kernel_size
    );
    eprintln!(
        "  Epochs: {}, LR: {}, threshold: {}, patience: {}, omega: {}",
        args.epochs, args.lr, args.threshold, args.patience, args.omega
    );
    eprintln!("  Metrics: {}", args.metrics_file.display());
    if args.gpu {
        eprintln!("  Backend: GPU");
    } else if args.parallel {
        eprintln!("  Backend: CPU (Rayon)");
    } else {
        eprintln!("  Backend: CPU");
    }

    // Synthetic dataset: checkerboard targets, defocused subjects.
    let pairs: Vec<(Array4<f32>, Array4<f32>)> = (0..args.count)
        .map(|i| {
            let original =
                data::checkerboard(1, args.channels, args.height, args.width, args.tile + i);
            let initial = data::defocus(&original, args.blur_sigma);
            (initial, original)
        })
        .collect();

    let metrics = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)
        .expect("open metrics file");
    let mut reporter = JsonlReporter {
        file: metrics,
        stderr: StderrReporter { every: 10 },
    };

    let started = Instant::now();

    if args.gpu {
        let device = gpu::init_device();
        let mut cpu_extractor = extractor.clone();
        let mut gpu_extractor: GpuExtractor<gpu::GpuBackend> =
            GpuExtractor::from_cpu(&extractor, &device);

        for (i, (initial, original)) in pairs.iter().enumerate() {
            let result = gpu::correct_gpu(&mut gpu_extractor, initial, original, &config, &mut reporter)
                .expect("GPU correction");
            report_one(i, &result.preliminary, result.best_loss, result.epochs_run, result.stop);
            save_ei(
                &args.checkpoint_dir.join(format!("corrected_ei_{i}.json")),
                &result.preliminary,
            );
        }

        gpu_extractor.to_cpu(&mut cpu_extractor);
        save_extractor(args.checkpoint_dir.join("extractor.json"), &cpu_extractor)
            .expect("save extractor checkpoint");
    } else if args.parallel && args.count > 1 {
        let mut index = 0;
        for chunk in pairs.chunks(config.batch_size) {
            let results =
                correct_batch_parallel(&extractor, chunk, &config).expect("parallel correction");
            for result in results {
                report_one(
                    index,
                    &result.preliminary,
                    result.best_loss,
                    result.epochs_run,
                    result.stop,
                );
                save_ei(
                    &args
                        .checkpoint_dir
                        .join(format!("corrected_ei_{index}.json")),
                    &result.preliminary,
                );
                index += 1;
            }
        }
        save_extractor(args.checkpoint_dir.join("extractor.json"), &extractor)
            .expect("save extractor checkpoint");
    } else {
        let mut ex = extractor.clone();
        for (i, (initial, original)) in pairs.iter().enumerate() {
            let result = correct_single(&mut ex, initial, original, &config, &mut reporter)
                .expect("correction");
            report_one(i, &result.preliminary, result.best_loss, result.epochs_run, result.stop);
            save_ei(
                &args.checkpoint_dir.join(format!("corrected_ei_{i}.json")),
                &result.preliminary,
            );
        }
        save_extractor(args.checkpoint_dir.join("extractor.json"), &ex)
            .expect("save extractor checkpoint");
    }

    eprintln!("Done in {:.1}s", started.elapsed().as_secs_f32());
}

fn report_one(
    index: usize,
    corrected: &Array4<f32>,
    best_loss: f32,
    epochs_run: usize,
    stop: StopReason,
) {
    let stats = tensor_stats(corrected);
    eprintln!(
        "EI {index}: {} after {} epochs, best loss {:.6}, output range [{:.3}, {:.3}], mean {:.3}",
        stop_label(stop),
        epochs_run,
        best_loss,
        stats.min,
        stats.max,
        stats.mean
    );
}
