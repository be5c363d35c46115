use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::XrayLabel;

/// 2x2 confusion matrix, rows actual, columns predicted, both ordered
/// `[NORMAL, PNEUMONIA]`: `[[TN, FP], [FN, TP]]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub cells: [[usize; 2]; 2],
}

impl ConfusionMatrix {
    pub fn from_labels(actual: &[XrayLabel], predicted: &[XrayLabel]) -> Self {
        let mut cells = [[0usize; 2]; 2];
        for (a, p) in actual.iter().zip(predicted) {
            cells[a.to_index()][p.to_index()] += 1;
        }
        Self { cells }
    }

    pub fn true_negatives(&self) -> usize {
        self.cells[0][0]
    }

    pub fn false_positives(&self) -> usize {
        self.cells[0][1]
    }

    pub fn false_negatives(&self) -> usize {
        self.cells[1][0]
    }

    pub fn true_positives(&self) -> usize {
        self.cells[1][1]
    }

    pub fn total(&self) -> usize {
        self.cells.iter().flatten().sum()
    }

    /// Samples whose actual class is `label`
    pub fn support(&self, label: XrayLabel) -> usize {
        self.cells[label.to_index()].iter().sum()
    }

    /// Samples predicted as `label`
    pub fn predicted(&self, label: XrayLabel) -> usize {
        let col = label.to_index();
        self.cells[0][col] + self.cells[1][col]
    }

    /// Precision treating `label` as the positive class
    pub fn precision(&self, label: XrayLabel) -> f64 {
        let i = label.to_index();
        ratio(self.cells[i][i], self.predicted(label))
    }

    /// Recall treating `label` as the positive class
    pub fn recall(&self, label: XrayLabel) -> f64 {
        let i = label.to_index();
        ratio(self.cells[i][i], self.support(label))
    }

    pub fn f1(&self, label: XrayLabel) -> f64 {
        let p = self.precision(label);
        let r = self.recall(label);
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_negatives() + self.true_positives(), self.total())
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// ROC curve at every achievable threshold, from `(0, 0)` to `(1, 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// Threshold of each point; the first one is `+inf`
    pub thresholds: Vec<f64>,
    pub auc: f64,
}

impl RocCurve {
    /// Build the curve from positive-class probabilities.
    ///
    /// Points are emitted at each distinct score (predict positive when
    /// `score >= threshold`), ties are handled as one step. When only one
    /// class is present the AUC is undefined and reported as 0.5.
    pub fn from_scores(scores: &[f32], labels: &[XrayLabel]) -> Self {
        let mut pairs: Vec<(f32, bool)> = scores
            .iter()
            .zip(labels)
            .map(|(&s, l)| (s, l.is_positive()))
            .collect();
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let positives = pairs.iter().filter(|(_, p)| *p).count();
        let negatives = pairs.len() - positives;

        let mut fpr = vec![0.0];
        let mut tpr = vec![0.0];
        let mut thresholds = vec![f64::INFINITY];
        let (mut tp, mut fp) = (0usize, 0usize);

        let mut i = 0;
        while i < pairs.len() {
            let score = pairs[i].0;
            // total_cmp so that a NaN score still forms its own group
            while i < pairs.len() && pairs[i].0.total_cmp(&score).is_eq() {
                if pairs[i].1 {
                    tp += 1;
                } else {
                    fp += 1;
                }
                i += 1;
            }
            fpr.push(ratio(fp, negatives));
            tpr.push(ratio(tp, positives));
            thresholds.push(score as f64);
        }

        let auc = if positives == 0 || negatives == 0 {
            0.5
        } else {
            trapezoid(&fpr, &tpr)
        };

        Self {
            fpr,
            tpr,
            thresholds,
            auc,
        }
    }
}

fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| (xs[1] - xs[0]) * (ys[0] + ys[1]) / 2.0)
        .sum()
}

/// Area under the ROC curve; 0.5 when only one class is present.
pub fn roc_auc(scores: &[f32], labels: &[XrayLabel]) -> f64 {
    RocCurve::from_scores(scores, labels).auc
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub loss: f64,
    pub accuracy: f64,
    /// Positive-class (PNEUMONIA) precision
    pub precision: f64,
    /// Positive-class recall, i.e. sensitivity
    pub recall: f64,
    pub f1_score: f64,
    pub auc: f64,
    pub confusion_matrix: ConfusionMatrix,
}

impl ClassificationMetrics {
    /// Threshold probabilities (`p > threshold` is positive) and score them
    /// against the ground truth.
    pub fn from_probabilities(
        probabilities: &[f32],
        labels: &[XrayLabel],
        threshold: f32,
        loss: f64,
    ) -> Self {
        let predicted: Vec<XrayLabel> = probabilities
            .iter()
            .map(|&p| XrayLabel::from_probability(p, threshold))
            .collect();
        let confusion_matrix = ConfusionMatrix::from_labels(labels, &predicted);
        let positive = XrayLabel::Pneumonia;

        Self {
            loss,
            accuracy: confusion_matrix.accuracy(),
            precision: confusion_matrix.precision(positive),
            recall: confusion_matrix.recall(positive),
            f1_score: confusion_matrix.f1(positive),
            auc: roc_auc(probabilities, labels),
            confusion_matrix,
        }
    }

    pub fn print_summary(&self, title: &str) {
        let cm = &self.confusion_matrix.cells;
        println!("=== {title} ===");
        println!("Loss:        {:.4}", self.loss);
        println!("Accuracy:    {:.4}", self.accuracy);
        println!("AUC:         {:.4}", self.auc);
        println!("Precision:   {:.4}", self.precision);
        println!("Sensitivity: {:.4}", self.recall);
        println!("F1-Score:    {:.4}", self.f1_score);
        println!("Confusion Matrix:");
        println!("                   Predicted");
        println!("                   NORMAL  PNEUMONIA");
        println!("Actual NORMAL      {:6}  {:9}", cm[0][0], cm[0][1]);
        println!("       PNEUMONIA   {:6}  {:9}", cm[1][0], cm[1][1]);
        println!("==============================");
    }
}

/// Per-class precision/recall/F1/support with accuracy, macro and weighted
/// averages.
pub fn classification_report(cm: &ConfusionMatrix) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>14} {:>10} {:>10} {:>10} {:>10}",
        "", "precision", "recall", "f1-score", "support"
    );
    let _ = writeln!(out);

    let total = cm.total();
    let mut macro_avg = [0.0f64; 3];
    let mut weighted_avg = [0.0f64; 3];
    for label in XrayLabel::ALL {
        let values = [cm.precision(label), cm.recall(label), cm.f1(label)];
        let support = cm.support(label);
        let _ = writeln!(
            out,
            "{:>14} {:>10.4} {:>10.4} {:>10.4} {:>10}",
            label.dir_name(),
            values[0],
            values[1],
            values[2],
            support
        );
        for k in 0..3 {
            macro_avg[k] += values[k] / XrayLabel::ALL.len() as f64;
            weighted_avg[k] += values[k] * ratio(support, total);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:>14} {:>10} {:>10} {:>10.4} {:>10}",
        "accuracy",
        "",
        "",
        cm.accuracy(),
        total
    );
    for (name, avg) in [("macro avg", macro_avg), ("weighted avg", weighted_avg)] {
        let _ = writeln!(
            out,
            "{:>14} {:>10.4} {:>10.4} {:>10.4} {:>10}",
            name, avg[0], avg[1], avg[2], total
        );
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingPhase {
    Initial,
    FineTune,
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingPhase::Initial => f.write_str("initial"),
            TrainingPhase::FineTune => f.write_str("fine_tune"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub phase: TrainingPhase,
    /// 1-based within the phase
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub val_auc: f64,
    pub val_precision: f64,
    pub val_recall: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    records: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn extend(&mut self, other: TrainingHistory) {
        self.records.extend(other.records);
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn phase(&self, phase: TrainingPhase) -> impl Iterator<Item = &EpochRecord> {
        self.records.iter().filter(move |r| r.phase == phase)
    }

    /// Highest validation AUC; the earliest epoch wins ties.
    pub fn best_epoch(&self) -> Option<&EpochRecord> {
        self.records
            .iter()
            .fold(None, |best: Option<&EpochRecord>, r| match best {
                Some(b) if b.val_auc >= r.val_auc => Some(b),
                _ => Some(r),
            })
    }

    pub fn print_history(&self) {
        println!("┌───────────┬───────┬────────────┬────────────┬───────────┬───────────┬────────────┐");
        println!("│ Phase     │ Epoch │ Train Loss │ Val Loss   │ Train Acc │ Val AUC   │ LR         │");
        println!("├───────────┼───────┼────────────┼────────────┼───────────┼───────────┼────────────┤");

        for r in &self.records {
            println!(
                "│ {:<9} │ {:5} │ {:10.4} │ {:10.4} │ {:9.4} │ {:9.4} │ {:10.2e} │",
                r.phase.to_string(),
                r.epoch,
                r.train_loss,
                r.val_loss,
                r.train_accuracy,
                r.val_auc,
                r.learning_rate
            );
        }
        println!("└───────────┴───────┴────────────┴────────────┴───────────┴───────────┴────────────┘");

        if let Some(best) = self.best_epoch() {
            println!(
                "Best epoch: {} ({}) with validation AUC: {:.4}",
                best.epoch, best.phase, best.val_auc
            );
        }
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from(
            "phase,epoch,train_loss,train_accuracy,val_loss,val_accuracy,val_auc,val_precision,val_recall,learning_rate\n",
        );
        for r in &self.records {
            let _ = writeln!(
                out,
                "{},{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:e}",
                r.phase,
                r.epoch,
                r.train_loss,
                r.train_accuracy,
                r.val_loss,
                r.val_accuracy,
                r.val_auc,
                r.val_precision,
                r.val_recall,
                r.learning_rate
            );
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.to_csv())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use XrayLabel::{Normal as N, Pneumonia as P};

    #[test]
    fn test_confusion_scenario() {
        // 6 TP, 1 FP, 1 FN, 2 TN
        let actual = [P, P, P, P, P, P, N, P, N, N];
        let predicted = [P, P, P, P, P, P, P, N, N, N];
        let cm = ConfusionMatrix::from_labels(&actual, &predicted);

        assert_eq!(cm.cells, [[2, 1], [1, 6]]);
        assert_eq!(cm.total(), actual.len());
        assert!((cm.precision(P) - 6.0 / 7.0).abs() < 1e-12);
        assert!((cm.recall(P) - 6.0 / 7.0).abs() < 1e-12);
        assert!((cm.accuracy() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_is_strict() {
        let probs = [0.5, 0.51, 0.49];
        let labels = [N, P, N];
        let metrics = ClassificationMetrics::from_probabilities(&probs, &labels, 0.5, 0.0);
        assert_eq!(metrics.confusion_matrix.cells, [[2, 0], [0, 1]]);
        assert_eq!(metrics.accuracy, 1.0);
    }

    #[test]
    fn test_no_positives_yields_zeros_not_nan() {
        let probs = [0.1, 0.2];
        let labels = [N, N];
        let m = ClassificationMetrics::from_probabilities(&probs, &labels, 0.5, 0.3);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.recall, 0.0);
        assert_eq!(m.f1_score, 0.0);
        assert_eq!(m.auc, 0.5);
    }

    #[test]
    fn test_perfect_and_inverted_auc() {
        let labels = [N, N, P, P];
        assert!((roc_auc(&[0.1, 0.2, 0.8, 0.9], &labels) - 1.0).abs() < 1e-12);
        assert!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &labels).abs() < 1e-12);
    }

    #[test]
    fn test_ties_count_as_half() {
        let labels = [N, P];
        assert!((roc_auc(&[0.5, 0.5], &labels) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_uncorrelated_scores_auc_near_half() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 4000;
        let scores: Vec<f32> = (0..n).map(|_| rng.random::<f32>()).collect();
        let labels: Vec<XrayLabel> = (0..n)
            .map(|_| if rng.random_bool(0.5) { P } else { N })
            .collect();
        let auc = roc_auc(&scores, &labels);
        assert!((0.0..=1.0).contains(&auc));
        assert!((auc - 0.5).abs() < 0.05, "auc {auc}");
    }

    #[test]
    fn test_nan_score_terminates_as_its_own_group() {
        let roc = RocCurve::from_scores(&[f32::NAN, 0.3, 0.7], &[P, N, P]);
        assert_eq!(roc.fpr.len(), 4);
        assert_eq!(*roc.fpr.last().unwrap(), 1.0);
        assert_eq!(*roc.tpr.last().unwrap(), 1.0);
        assert!((0.0..=1.0).contains(&roc.auc));
    }

    #[test]
    fn test_roc_curve_endpoints() {
        let roc = RocCurve::from_scores(&[0.3, 0.7, 0.7, 0.1], &[N, P, N, P]);
        assert_eq!((roc.fpr[0], roc.tpr[0]), (0.0, 0.0));
        assert_eq!((*roc.fpr.last().unwrap(), *roc.tpr.last().unwrap()), (1.0, 1.0));
        // three distinct scores plus the starting point
        assert_eq!(roc.thresholds.len(), 4);
        assert!(roc.thresholds[0].is_infinite());
    }

    #[test]
    fn test_report_lists_both_classes_and_averages() {
        let cm = ConfusionMatrix {
            cells: [[2, 1], [1, 6]],
        };
        let report = classification_report(&cm);
        for needle in ["NORMAL", "PNEUMONIA", "accuracy", "macro avg", "weighted avg"] {
            assert!(report.contains(needle), "missing {needle}");
        }
        assert!(report.contains("0.8571"));
    }

    #[test]
    fn test_history_best_and_csv() {
        let mut history = TrainingHistory::new();
        for (epoch, auc) in [(1, 0.7), (2, 0.8), (3, 0.8)] {
            history.add(EpochRecord {
                phase: TrainingPhase::Initial,
                epoch,
                train_loss: 0.5,
                train_accuracy: 0.7,
                val_loss: 0.4,
                val_accuracy: 0.75,
                val_auc: auc,
                val_precision: 0.7,
                val_recall: 0.8,
                learning_rate: 1e-4,
            });
        }
        assert_eq!(history.best_epoch().unwrap().epoch, 2);

        let csv = history.to_csv();
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.lines().nth(1).unwrap().starts_with("initial,1,"));
    }
}
