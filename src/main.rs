use std::path::{Path, PathBuf};

use anyhow::Result;
use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;

use pneumonia_detection::{
    pipeline::{self, CONFIG_FILE, GRADCAM_FILE},
    PipelineConfig,
};

type TrainBackend = Autodiff<NdArray>;

/// Pneumonia detection on chest X-rays with transfer learning and Grad-CAM
#[derive(Parser, Debug)]
#[command(name = "pneumonia_detection")]
#[command(version)]
#[command(about = "Chest X-ray pneumonia classifier built with Burn", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train, fine-tune and evaluate on a dataset with train/ and test/ folders
    Train {
        /// Dataset root containing train/{NORMAL,PNEUMONIA} and test/{NORMAL,PNEUMONIA}
        #[arg(short, long, default_value = "data/chest_xray")]
        data_dir: PathBuf,

        /// Directory for checkpoints, reports and charts
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        #[command(flatten)]
        overrides: Overrides,

        /// Number of initial training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Number of fine-tuning epochs
        #[arg(long)]
        fine_tune_epochs: Option<usize>,

        /// Skip the fine-tuning phase
        #[arg(long, default_value = "false")]
        no_fine_tune: bool,

        /// Batch size for training and evaluation
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Random seed for shuffling and augmentation
        #[arg(long)]
        seed: Option<u64>,

        /// Image to explain with Grad-CAM once training is done
        #[arg(long)]
        gradcam_image: Option<PathBuf>,
    },

    /// Grad-CAM heatmap for one image from a saved checkpoint
    Gradcam {
        /// Checkpoint path, with or without the .mpk extension
        #[arg(short, long, default_value = "output/pneumonia_model_finetuned_best.mpk")]
        checkpoint: PathBuf,

        /// Image to explain
        #[arg(short, long)]
        image: PathBuf,

        /// Overlay destination, next to the checkpoint when unset
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args, Debug)]
struct Overrides {
    /// Configuration saved by an earlier run
    #[arg(long)]
    config: Option<PathBuf>,

    /// Square input size in pixels
    #[arg(long)]
    image_size: Option<usize>,

    /// Convolution to explain, e.g. block5_conv3 (last convolution by default)
    #[arg(long)]
    gradcam_layer: Option<String>,
}

impl Overrides {
    /// Start from `--config`, else from `fallback` if it exists, else the
    /// defaults, then apply the explicit overrides.
    fn resolve(&self, fallback: Option<&Path>) -> Result<PipelineConfig> {
        let mut config = match (&self.config, fallback) {
            (Some(path), _) => PipelineConfig::from_file(path)?,
            (None, Some(path)) if path.is_file() => {
                log::info!("Using configuration from {}", path.display());
                PipelineConfig::from_file(path)?
            }
            _ => PipelineConfig::new(),
        };
        if let Some(size) = self.image_size {
            config.data.image_size = size;
        }
        if let Some(layer) = &self.gradcam_layer {
            config.gradcam_layer = Some(layer.clone());
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let device = NdArrayDevice::Cpu;

    match cli.command {
        Commands::Train {
            data_dir,
            output_dir,
            overrides,
            epochs,
            fine_tune_epochs,
            no_fine_tune,
            batch_size,
            seed,
            gradcam_image,
        } => {
            println!("=== Pneumonia Detection with Burn ===");
            let mut config = overrides.resolve(None)?;
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(epochs) = fine_tune_epochs {
                config.fine_tune.epochs = epochs;
            }
            if no_fine_tune {
                config.fine_tune.enabled = false;
            }
            if let Some(batch_size) = batch_size {
                config.data.batch_size = batch_size;
            }
            if seed.is_some() {
                config.seed = seed;
            }

            let summary = pipeline::run_training::<TrainBackend>(
                &config,
                &data_dir,
                &output_dir,
                gradcam_image.as_deref(),
                device,
            )?;

            let final_metrics = &summary.final_evaluation().metrics;
            println!("\n=== Training Complete ===");
            println!(
                "Test AUC: {:.4}  accuracy: {:.2}%",
                final_metrics.auc,
                final_metrics.accuracy * 100.0
            );
            println!("Outputs saved to {}", summary.output_dir.display());
        }
        Commands::Gradcam {
            checkpoint,
            image,
            output,
            overrides,
        } => {
            let checkpoint_dir = checkpoint.parent().unwrap_or(Path::new("."));
            let config = overrides.resolve(Some(&checkpoint_dir.join(CONFIG_FILE)))?;
            let output = output.unwrap_or_else(|| checkpoint_dir.join(GRADCAM_FILE));

            let result = pipeline::run_gradcam::<TrainBackend>(
                &config,
                &checkpoint,
                &image,
                &output,
                device,
            )?;
            println!(
                "{}: {} (p = {:.4}), heatmap from {} saved to {}",
                image.display(),
                result.predicted,
                result.probability,
                result.layer,
                output.display()
            );
        }
    }

    Ok(())
}
