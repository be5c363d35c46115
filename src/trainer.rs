use std::path::PathBuf;

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::BinaryCrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{activation::sigmoid, backend::AutodiffBackend},
};

use crate::{
    checkpoint::{save_checkpoint, CheckpointMetadata},
    data::{XrayBatch, XrayBatcher, XrayDataLoader},
    error::{self, PipelineError},
    evaluator::predict,
    metrics::{ClassificationMetrics, EpochRecord, TrainingHistory, TrainingPhase},
    model::PneumoniaModel,
    monitor::{
        BestCheckpoint, EarlyStopAction, EarlyStopping, EpochMonitor, EpochSnapshot,
        ReduceLrOnPlateau,
    },
};

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 20)]
    pub epochs: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 5)]
    pub early_stopping_patience: usize,
    #[config(default = 3)]
    pub lr_patience: usize,
    #[config(default = 0.2)]
    pub lr_factor: f64,
    #[config(default = 1e-6)]
    pub min_learning_rate: f64,
    /// Validation loss must drop by more than this to count as improvement
    #[config(default = 1e-4)]
    pub lr_min_delta: f64,
}

impl TrainingConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.epochs == 0 {
            return Err(PipelineError::Config("epochs must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(PipelineError::Config("learning_rate must be positive".into()));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(PipelineError::Config("lr_factor must be in (0, 1)".into()));
        }
        if self.min_learning_rate < 0.0 {
            return Err(PipelineError::Config("min_learning_rate must be >= 0".into()));
        }
        Ok(())
    }
}

#[derive(Config, Debug)]
pub struct FineTuneConfig {
    #[config(default = true)]
    pub enabled: bool,
    #[config(default = 10)]
    pub epochs: usize,
    #[config(default = 1e-5)]
    pub learning_rate: f64,
    /// How many backbone layers (conv, bn, relu, pool entries) to unfreeze,
    /// counted from the end
    #[config(default = 30)]
    pub unfreeze_layers: usize,
    #[config(default = 5)]
    pub early_stopping_patience: usize,
}

impl FineTuneConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.enabled && self.epochs == 0 {
            return Err(PipelineError::Config("fine-tune epochs must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(PipelineError::Config(
                "fine-tune learning_rate must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Settings of one training phase.
pub struct PhasePlan {
    pub phase: TrainingPhase,
    pub epochs: usize,
    pub learning_rate: f64,
    pub early_stopping_patience: usize,
    pub lr_decay: Option<ReduceLrOnPlateau>,
    /// Best-AUC checkpoint location, without extension
    pub checkpoint_path: PathBuf,
}

impl PhasePlan {
    pub fn initial(config: &TrainingConfig, checkpoint_path: PathBuf) -> Self {
        Self {
            phase: TrainingPhase::Initial,
            epochs: config.epochs,
            learning_rate: config.learning_rate,
            early_stopping_patience: config.early_stopping_patience,
            lr_decay: Some(
                ReduceLrOnPlateau::new(
                    config.lr_patience,
                    config.lr_factor,
                    config.min_learning_rate,
                )
                .with_min_delta(config.lr_min_delta),
            ),
            checkpoint_path,
        }
    }

    pub fn fine_tune(config: &FineTuneConfig, checkpoint_path: PathBuf) -> Self {
        Self {
            phase: TrainingPhase::FineTune,
            epochs: config.epochs,
            learning_rate: config.learning_rate,
            early_stopping_patience: config.early_stopping_patience,
            lr_decay: None,
            checkpoint_path,
        }
    }
}

pub struct PhaseOutcome<B: AutodiffBackend> {
    /// Weights of the best epoch
    pub model: PneumoniaModel<B>,
    pub history: TrainingHistory,
    pub best_epoch: usize,
    pub best_auc: f64,
    pub stopped_early: bool,
}

pub struct PneumoniaTrainer<B: AutodiffBackend> {
    device: B::Device,
    threshold: f32,
}

impl<B: AutodiffBackend> PneumoniaTrainer<B> {
    pub fn new(device: B::Device, threshold: f32) -> Self {
        Self { device, threshold }
    }

    /// Train the head on top of the frozen backbone.
    pub fn train(
        &self,
        model: PneumoniaModel<B>,
        train_loader: &mut XrayDataLoader,
        val_loader: &mut XrayDataLoader,
        plan: PhasePlan,
    ) -> anyhow::Result<PhaseOutcome<B>> {
        self.run_phase(model.freeze_backbone(), train_loader, val_loader, plan)
    }

    /// Unfreeze the tail of the backbone and continue training with a fresh
    /// optimizer.
    pub fn fine_tune(
        &self,
        model: PneumoniaModel<B>,
        unfreeze_layers: usize,
        train_loader: &mut XrayDataLoader,
        val_loader: &mut XrayDataLoader,
        plan: PhasePlan,
    ) -> anyhow::Result<PhaseOutcome<B>> {
        let model = model.unfreeze_last_layers(unfreeze_layers);
        let (trainable, frozen) = model.parameter_counts();
        log::info!(
            "Unfroze last {} backbone layers: {}/{} blocks trainable, {} trainable / {} frozen params",
            unfreeze_layers,
            model.backbone.len() - model.frozen_blocks(),
            model.backbone.len(),
            trainable,
            frozen
        );
        self.run_phase(model, train_loader, val_loader, plan)
    }

    pub fn run_phase(
        &self,
        mut model: PneumoniaModel<B>,
        train_loader: &mut XrayDataLoader,
        val_loader: &mut XrayDataLoader,
        mut plan: PhasePlan,
    ) -> anyhow::Result<PhaseOutcome<B>> {
        let mut optimizer = AdamConfig::new().init::<B, PneumoniaModel<B>>();
        let mut checkpoint = BestCheckpoint::new();
        let mut early_stopping = EarlyStopping::new(plan.early_stopping_patience);
        let mut history = TrainingHistory::new();
        // a record, not a clone: clones share batch-norm running statistics
        let mut best_record: Option<<PneumoniaModel<B> as Module<B>>::Record> = None;
        let mut learning_rate = plan.learning_rate;
        let mut stopped_early = false;

        log::info!(
            "Starting {} phase: up to {} epochs, lr {:.1e}, {} train / {} validation images",
            plan.phase,
            plan.epochs,
            learning_rate,
            train_loader.len(),
            val_loader.len()
        );

        for epoch in 1..=plan.epochs {
            let (trained, train_loss, train_accuracy) =
                self.train_epoch(model, &mut optimizer, train_loader, learning_rate)?;
            model = trained;

            let val = predict(&model.valid(), val_loader, &self.device)?;
            let val_metrics = ClassificationMetrics::from_probabilities(
                &val.probabilities,
                &val.labels,
                self.threshold,
                val.loss,
            );

            log::info!(
                "[{}] epoch {}/{} - loss {:.4} - acc {:.4} - val_loss {:.4} - val_acc {:.4} - val_auc {:.4} - val_precision {:.4} - val_recall {:.4} - lr {:.1e}",
                plan.phase,
                epoch,
                plan.epochs,
                train_loss,
                train_accuracy,
                val_metrics.loss,
                val_metrics.accuracy,
                val_metrics.auc,
                val_metrics.precision,
                val_metrics.recall,
                learning_rate
            );

            history.add(EpochRecord {
                phase: plan.phase,
                epoch,
                train_loss,
                train_accuracy,
                val_loss: val_metrics.loss,
                val_accuracy: val_metrics.accuracy,
                val_auc: val_metrics.auc,
                val_precision: val_metrics.precision,
                val_recall: val_metrics.recall,
                learning_rate,
            });

            let snapshot = EpochSnapshot {
                epoch,
                train_loss,
                val_loss: val_metrics.loss,
                val_accuracy: val_metrics.accuracy,
                val_auc: val_metrics.auc,
                learning_rate,
            };

            if checkpoint.on_epoch_end(&snapshot) {
                let metadata = CheckpointMetadata::new(
                    plan.phase,
                    epoch,
                    snapshot.val_auc,
                    snapshot.val_loss,
                    learning_rate,
                );
                save_checkpoint(&model, &plan.checkpoint_path, &metadata)?;
            }

            match early_stopping.on_epoch_end(&snapshot) {
                EarlyStopAction::Improved => best_record = Some(model.clone().into_record()),
                EarlyStopAction::Wait(wait) => {
                    log::debug!("{}: {} epochs without improvement", early_stopping.name(), wait)
                }
                EarlyStopAction::Stop => stopped_early = true,
            }

            if let Some(lr_decay) = plan.lr_decay.as_mut() {
                if let Some(new_lr) = lr_decay.on_epoch_end(&snapshot) {
                    learning_rate = new_lr;
                }
            }

            if stopped_early {
                break;
            }
        }

        if let Some(best) = best_record {
            log::info!(
                "Restoring weights from epoch {} (val_auc {:.4})",
                early_stopping.best_epoch(),
                early_stopping.best_auc()
            );
            model = model.load_record(best);
        }

        Ok(PhaseOutcome {
            model,
            history,
            best_epoch: early_stopping.best_epoch(),
            best_auc: early_stopping.best_auc(),
            stopped_early,
        })
    }

    /// One pass over the training loader. Returns the updated model, the
    /// mean loss and the accuracy at the decision threshold.
    fn train_epoch<O>(
        &self,
        mut model: PneumoniaModel<B>,
        optimizer: &mut O,
        loader: &mut XrayDataLoader,
        learning_rate: f64,
    ) -> anyhow::Result<(PneumoniaModel<B>, f64, f64)>
    where
        O: Optimizer<PneumoniaModel<B>, B>,
    {
        let loss_fn = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&self.device);

        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        let mut seen = 0usize;

        let batches = loader.epoch_batches();
        let num_batches = batches.len();
        for (i, indices) in batches.iter().enumerate() {
            let items = loader.load_items(indices)?;
            let batch: XrayBatch<B> = XrayBatcher.batch(items, &self.device);

            let logits = model.forward_train(batch.images);
            let [batch_size, _] = logits.dims();
            let logits = logits.reshape([batch_size]);
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());

            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                anyhow::bail!(
                    "training loss became {} at batch {}/{}, training diverged",
                    loss_value,
                    i + 1,
                    num_batches
                );
            }
            let batch_correct: i64 = sigmoid(logits.detach())
                .greater_elem(self.threshold)
                .equal(batch.targets.equal_elem(1))
                .int()
                .sum()
                .into_scalar()
                .elem();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(learning_rate, model, grads);

            loss_sum += loss_value * batch_size as f64;
            correct += batch_correct as usize;
            seen += batch_size;

            log::debug!(
                "batch {}/{} - loss {:.4}",
                i + 1,
                num_batches,
                loss_value
            );
        }

        let mean_loss = if seen > 0 { loss_sum / seen as f64 } else { 0.0 };
        let accuracy = if seen > 0 {
            correct as f64 / seen as f64
        } else {
            0.0
        };
        Ok((model, mean_loss, accuracy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::{load_checkpoint, read_metadata},
        data::{XrayDataset, XrayLabel},
        metrics::roc_auc,
        model::{BackboneConfig, ModelConfig},
    };
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn write_split(dir: &Path, per_class: usize) {
        for label in XrayLabel::ALL {
            let class_dir = dir.join(label.dir_name());
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..per_class {
                let shade = (if label.is_positive() { 180 } else { 60 }) + (i as u8) * 7;
                RgbImage::from_fn(8, 8, |x, y| Rgb([shade, (x * 20) as u8, (y * 20) as u8]))
                    .save(class_dir.join(format!("img_{i}.png")))
                    .unwrap();
            }
        }
    }

    fn loaders(root: &Path) -> (XrayDataLoader, XrayDataLoader) {
        write_split(&root.join("train"), 4);
        write_split(&root.join("val"), 2);
        let train = XrayDataset::from_class_dirs(&root.join("train"), 8).unwrap();
        let val = XrayDataset::from_class_dirs(&root.join("val"), 8).unwrap();
        (
            XrayDataLoader::new(train, 4).shuffled(Some(5)),
            XrayDataLoader::new(val, 4),
        )
    }

    fn unfrozen_model(device: &NdArrayDevice) -> PneumoniaModel<TestBackend> {
        ModelConfig::new()
            .with_backbone(
                BackboneConfig::new()
                    .with_stages(vec![1, 1])
                    .with_base_filters(4)
                    .with_max_filters(8),
            )
            .with_head_units(4)
            .init::<TestBackend>(device)
            .unfreeze_last_layers(usize::MAX)
    }

    fn plan(checkpoint_path: PathBuf, epochs: usize, patience: usize) -> PhasePlan {
        PhasePlan {
            phase: TrainingPhase::FineTune,
            epochs,
            learning_rate: 1e-2,
            early_stopping_patience: patience,
            lr_decay: None,
            checkpoint_path,
        }
    }

    #[test]
    fn test_phase_restores_best_epoch_and_matches_checkpoint() {
        let dir = TempDir::new().unwrap();
        let device = NdArrayDevice::Cpu;
        let (mut train_loader, mut val_loader) = loaders(dir.path());
        let checkpoint_path = dir.path().join("best");

        let trainer = PneumoniaTrainer::<TestBackend>::new(NdArrayDevice::Cpu, 0.5);
        let outcome = trainer
            .run_phase(
                unfrozen_model(&device),
                &mut train_loader,
                &mut val_loader,
                plan(checkpoint_path.clone(), 4, 4),
            )
            .unwrap();

        // epoch 1 always improves, so three flat epochs never exhaust patience 4
        assert!(!outcome.stopped_early);
        assert_eq!(outcome.history.len(), 4);
        let best = outcome.history.best_epoch().unwrap();
        assert_eq!(outcome.best_epoch, best.epoch);
        assert_eq!(outcome.best_auc, best.val_auc);

        // only strict improvements are saved, so the last save is the best epoch
        let metadata = read_metadata(&checkpoint_path).unwrap().unwrap();
        assert_eq!(metadata.epoch, outcome.best_epoch);

        // the restored model reproduces the best epoch's validation AUC,
        // batch-norm statistics included
        let restored = predict(&outcome.model.valid(), &mut val_loader, &device).unwrap();
        assert!((roc_auc(&restored.probabilities, &restored.labels) - outcome.best_auc).abs() < 1e-9);

        let reloaded = load_checkpoint(unfrozen_model(&device), &checkpoint_path, &device).unwrap();
        let from_disk = predict(&reloaded.valid(), &mut val_loader, &device).unwrap();
        for (a, b) in restored.probabilities.iter().zip(&from_disk.probabilities) {
            assert!((a - b).abs() < 2e-2, "restored {a} vs checkpoint {b}");
        }
    }

    #[test]
    fn test_phase_stops_once_patience_runs_out() {
        let dir = TempDir::new().unwrap();
        let device = NdArrayDevice::Cpu;
        let (mut train_loader, mut val_loader) = loaders(dir.path());
        let patience = 1;

        let trainer = PneumoniaTrainer::<TestBackend>::new(NdArrayDevice::Cpu, 0.5);
        let outcome = trainer
            .run_phase(
                unfrozen_model(&device),
                &mut train_loader,
                &mut val_loader,
                plan(dir.path().join("best"), 8, patience),
            )
            .unwrap();

        if outcome.stopped_early {
            assert_eq!(outcome.history.len(), outcome.best_epoch + patience);
        } else {
            assert_eq!(outcome.history.len(), 8);
        }
    }

    #[test]
    fn test_lr_decay_applies_from_the_next_epoch() {
        let dir = TempDir::new().unwrap();
        let device = NdArrayDevice::Cpu;
        let (mut train_loader, mut val_loader) = loaders(dir.path());

        // a huge min_delta makes every epoch after the first a plateau
        let mut phase = plan(dir.path().join("best"), 4, 4);
        phase.lr_decay = Some(ReduceLrOnPlateau::new(1, 0.5, 1e-9).with_min_delta(1e9));

        let trainer = PneumoniaTrainer::<TestBackend>::new(NdArrayDevice::Cpu, 0.5);
        let outcome = trainer
            .run_phase(unfrozen_model(&device), &mut train_loader, &mut val_loader, phase)
            .unwrap();

        let rates: Vec<f64> = outcome
            .history
            .records()
            .iter()
            .map(|r| r.learning_rate)
            .collect();
        assert_eq!(rates, vec![1e-2, 1e-2, 5e-3, 2.5e-3]);
    }

    #[test]
    fn test_default_hyperparameters() {
        let training = TrainingConfig::new();
        assert_eq!(training.epochs, 20);
        assert_eq!(training.learning_rate, 1e-4);
        assert_eq!(training.early_stopping_patience, 5);
        assert_eq!(training.lr_patience, 3);
        assert_eq!(training.lr_factor, 0.2);
        assert_eq!(training.min_learning_rate, 1e-6);

        let fine_tune = FineTuneConfig::new();
        assert_eq!(fine_tune.epochs, 10);
        assert_eq!(fine_tune.learning_rate, 1e-5);
        assert_eq!(fine_tune.unfreeze_layers, 30);
    }

    #[test]
    fn test_fine_tune_plan_has_no_lr_decay() {
        let plan = PhasePlan::fine_tune(&FineTuneConfig::new(), PathBuf::from("x"));
        assert!(plan.lr_decay.is_none());
        let plan = PhasePlan::initial(&TrainingConfig::new(), PathBuf::from("x"));
        assert!(plan.lr_decay.is_some());
    }

    #[test]
    fn test_invalid_lr_factor_rejected() {
        let config = TrainingConfig::new().with_lr_factor(1.5);
        assert!(config.validate().is_err());
    }
}
