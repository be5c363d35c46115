//! End-to-end run: data, model, initial training, evaluation, fine-tuning,
//! a second evaluation and the optional Grad-CAM overlay.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use burn::{config::Config, module::AutodiffModule, tensor::backend::AutodiffBackend};

use crate::{
    charts,
    checkpoint::{load_checkpoint, read_metadata},
    config::PipelineConfig,
    data::{Augmenter, DatasetSplits, XrayDataLoader},
    evaluator::{evaluate, Evaluation},
    gradcam::{explain_image, GradCamResult},
    metrics::TrainingHistory,
    model::summary::{render_summary, write_summary},
    trainer::{PhasePlan, PneumoniaTrainer},
};

pub const BEST_MODEL_FILE: &str = "pneumonia_model_best";
pub const FINETUNED_MODEL_FILE: &str = "pneumonia_model_finetuned_best";
pub const CONFIG_FILE: &str = "config.json";
pub const ARCHITECTURE_FILE: &str = "model_architecture.txt";
pub const REPORT_FILE: &str = "classification_report.txt";
pub const HISTORY_CSV_FILE: &str = "training_history.csv";
pub const HISTORY_CHART_FILE: &str = "training_history.svg";
pub const GRADCAM_FILE: &str = "gradcam_overlay.png";

#[derive(Debug)]
pub struct RunSummary {
    pub initial: Evaluation,
    pub fine_tuned: Option<Evaluation>,
    pub history: TrainingHistory,
    pub gradcam: Option<GradCamResult>,
    pub output_dir: PathBuf,
}

impl RunSummary {
    /// Evaluation of the model the run ended with.
    pub fn final_evaluation(&self) -> &Evaluation {
        self.fine_tuned.as_ref().unwrap_or(&self.initial)
    }
}

/// Run the full pipeline on `data_dir`, writing every artifact to
/// `output_dir`. A Grad-CAM overlay is produced when `gradcam_image` is set.
pub fn run_training<B: AutodiffBackend>(
    config: &PipelineConfig,
    data_dir: &Path,
    output_dir: &Path,
    gradcam_image: Option<&Path>,
    device: B::Device,
) -> anyhow::Result<RunSummary> {
    config.validate()?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    config
        .save(output_dir.join(CONFIG_FILE))
        .context("saving the effective configuration")?;

    let splits = DatasetSplits::load(data_dir, &config.data)?;
    splits.log_stats();

    let batch_size = config.data.batch_size;
    let augmenter = Augmenter::new(
        config.data.augmentation.clone(),
        config.seed.map(|seed| seed.wrapping_add(1)),
    );
    let mut train_loader = XrayDataLoader::new(splits.train, batch_size)
        .shuffled(config.seed)
        .with_augmenter(augmenter);
    let mut val_loader = XrayDataLoader::new(splits.validation, batch_size);
    let mut test_loader = XrayDataLoader::new(splits.test, batch_size);

    let image_size = config.data.image_size;
    let model = config.model.build::<B>(&device)?;
    let architecture_path = output_dir.join(ARCHITECTURE_FILE);
    write_summary(&model, image_size, &architecture_path)?;

    let trainer = PneumoniaTrainer::<B>::new(device.clone(), config.threshold);
    let mut history = TrainingHistory::new();
    let mut report = String::new();

    let outcome = trainer.train(
        model,
        &mut train_loader,
        &mut val_loader,
        PhasePlan::initial(&config.training, output_dir.join(BEST_MODEL_FILE)),
    )?;
    log::info!(
        "Initial training done: best epoch {} with val_auc {:.4}{}",
        outcome.best_epoch,
        outcome.best_auc,
        if outcome.stopped_early { " (stopped early)" } else { "" }
    );
    history.extend(outcome.history);
    let mut model = outcome.model;

    let initial = evaluate(&model.valid(), &mut test_loader, &device, config.threshold)?;
    initial.metrics.print_summary("Test set - initial model");
    initial.write_charts(output_dir, "", "initial model")?;
    report.push_str(&initial.report_section("Initial model"));

    let fine_tuned = if config.fine_tune.enabled {
        let outcome = trainer.fine_tune(
            model,
            config.fine_tune.unfreeze_layers,
            &mut train_loader,
            &mut val_loader,
            PhasePlan::fine_tune(&config.fine_tune, output_dir.join(FINETUNED_MODEL_FILE)),
        )?;
        log::info!(
            "Fine-tuning done: best epoch {} with val_auc {:.4}{}",
            outcome.best_epoch,
            outcome.best_auc,
            if outcome.stopped_early { " (stopped early)" } else { "" }
        );
        history.extend(outcome.history);
        model = outcome.model;
        append_summary(&architecture_path, &render_summary(&model, image_size))?;

        let evaluation = evaluate(&model.valid(), &mut test_loader, &device, config.threshold)?;
        evaluation.metrics.print_summary("Test set - fine-tuned model");
        evaluation.write_charts(output_dir, "_finetuned", "fine-tuned model")?;
        report.push('\n');
        report.push_str(&evaluation.report_section("Fine-tuned model"));
        Some(evaluation)
    } else {
        log::info!("Fine-tuning disabled, keeping the initial model");
        None
    };

    let report_path = output_dir.join(REPORT_FILE);
    std::fs::write(&report_path, &report)
        .with_context(|| format!("writing {}", report_path.display()))?;

    history.print_history();
    history
        .write_csv(&output_dir.join(HISTORY_CSV_FILE))
        .context("writing training history")?;
    charts::write_svg(
        &charts::render_history(&history),
        &output_dir.join(HISTORY_CHART_FILE),
    )?;

    let gradcam = match gradcam_image {
        Some(image) => Some(explain_image(
            &model,
            image,
            config.gradcam_layer.as_deref(),
            image_size,
            config.threshold,
            &output_dir.join(GRADCAM_FILE),
            &device,
        )?),
        None => None,
    };

    log::info!("All outputs written to {}", output_dir.display());

    Ok(RunSummary {
        initial,
        fine_tuned,
        history,
        gradcam,
        output_dir: output_dir.to_path_buf(),
    })
}

/// Grad-CAM for `image` with weights restored from `checkpoint`.
pub fn run_gradcam<B: AutodiffBackend>(
    config: &PipelineConfig,
    checkpoint: &Path,
    image: &Path,
    output_path: &Path,
    device: B::Device,
) -> anyhow::Result<GradCamResult> {
    config.validate()?;
    if let Some(metadata) = read_metadata(checkpoint)? {
        log::info!(
            "Checkpoint from the {} phase, epoch {} (val_auc {:.4}, saved {})",
            metadata.phase,
            metadata.epoch,
            metadata.val_auc,
            metadata.saved_at
        );
    }

    let model = load_checkpoint(config.model.init::<B>(&device), checkpoint, &device)?;
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    explain_image(
        &model,
        image,
        config.gradcam_layer.as_deref(),
        config.data.image_size,
        config.threshold,
        output_path,
        &device,
    )
}

fn append_summary(path: &Path, summary: &str) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "\n== After fine-tuning ==\n")?;
    file.write_all(summary.as_bytes())?;
    log::info!("Fine-tuned model summary appended to {}", path.display());
    Ok(())
}
