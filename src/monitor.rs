//! Epoch-end observers: best checkpoint, early stopping and LR decay.
//!
//! Each monitor keeps its own best value and patience counter and is fed the
//! same [`EpochSnapshot`] once per epoch. Monitors only decide; the trainer
//! acts on their decisions (saving, restoring, changing the learning rate).

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EpochSnapshot {
    /// 1-based epoch within the current phase
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub val_auc: f64,
    pub learning_rate: f64,
}

pub trait EpochMonitor {
    type Action;

    fn on_epoch_end(&mut self, snapshot: &EpochSnapshot) -> Self::Action;

    fn name(&self) -> &'static str;
}

/// Requests a checkpoint whenever validation AUC strictly exceeds every
/// value seen before in the phase.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    best_auc: f64,
}

impl BestCheckpoint {
    pub fn new() -> Self {
        Self {
            best_auc: f64::NEG_INFINITY,
        }
    }

    pub fn best_auc(&self) -> f64 {
        self.best_auc
    }
}

impl Default for BestCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochMonitor for BestCheckpoint {
    /// `true` when the model should be saved
    type Action = bool;

    fn on_epoch_end(&mut self, snapshot: &EpochSnapshot) -> bool {
        if snapshot.val_auc > self.best_auc {
            log::info!(
                "val_auc improved from {:.4} to {:.4}",
                self.best_auc,
                snapshot.val_auc
            );
            self.best_auc = snapshot.val_auc;
            true
        } else {
            log::info!("val_auc did not improve from {:.4}", self.best_auc);
            false
        }
    }

    fn name(&self) -> &'static str {
        "BestCheckpoint"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStopAction {
    /// New best value: keep a copy of the current weights
    Improved,
    /// No improvement for the given number of consecutive epochs
    Wait(usize),
    /// Patience exhausted
    Stop,
}

/// Stops training once validation AUC has not improved for `patience`
/// consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_auc: f64,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_auc: f64::NEG_INFINITY,
            best_epoch: 0,
            wait: 0,
        }
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn best_auc(&self) -> f64 {
        self.best_auc
    }
}

impl EpochMonitor for EarlyStopping {
    type Action = EarlyStopAction;

    fn on_epoch_end(&mut self, snapshot: &EpochSnapshot) -> EarlyStopAction {
        if snapshot.val_auc > self.best_auc {
            self.best_auc = snapshot.val_auc;
            self.best_epoch = snapshot.epoch;
            self.wait = 0;
            return EarlyStopAction::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            log::info!(
                "Early stopping: no val_auc improvement for {} epochs (best {:.4} at epoch {})",
                self.wait,
                self.best_auc,
                self.best_epoch
            );
            EarlyStopAction::Stop
        } else {
            EarlyStopAction::Wait(self.wait)
        }
    }

    fn name(&self) -> &'static str {
        "EarlyStopping"
    }
}

/// Multiplies the learning rate by `factor` when validation loss has not
/// decreased by more than `min_delta` for `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    patience: usize,
    factor: f64,
    min_lr: f64,
    min_delta: f64,
    best_loss: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(patience: usize, factor: f64, min_lr: f64) -> Self {
        Self {
            patience,
            factor,
            min_lr,
            min_delta: 1e-4,
            best_loss: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }
}

impl EpochMonitor for ReduceLrOnPlateau {
    /// New learning rate when a reduction happens
    type Action = Option<f64>;

    fn on_epoch_end(&mut self, snapshot: &EpochSnapshot) -> Option<f64> {
        if snapshot.val_loss < self.best_loss - self.min_delta {
            self.best_loss = snapshot.val_loss;
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait < self.patience || snapshot.learning_rate <= self.min_lr {
            return None;
        }

        let new_lr = (snapshot.learning_rate * self.factor).max(self.min_lr);
        self.wait = 0;
        log::info!(
            "Reducing learning rate from {:.2e} to {:.2e}",
            snapshot.learning_rate,
            new_lr
        );
        Some(new_lr)
    }

    fn name(&self) -> &'static str {
        "ReduceLrOnPlateau"
    }
}
