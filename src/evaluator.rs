use std::path::Path;

use burn::{
    data::dataloader::batcher::Batcher,
    nn::loss::BinaryCrossEntropyLossConfig,
    prelude::*,
    tensor::activation::sigmoid,
};

use crate::{
    charts,
    data::{XrayBatch, XrayBatcher, XrayDataLoader, XrayLabel},
    metrics::{classification_report, ClassificationMetrics, RocCurve},
    model::PneumoniaModel,
};

/// Row-level model output, aligned with the loader order.
#[derive(Debug, Clone)]
pub struct Predictions {
    pub probabilities: Vec<f32>,
    pub labels: Vec<XrayLabel>,
    /// Mean binary cross-entropy over every sample
    pub loss: f64,
}

/// Run `model` over every batch of `loader`.
///
/// Call with an inference model (`model.valid()` on an autodiff backend) so
/// dropout and batch-norm behave as in inference.
pub fn predict<B: Backend>(
    model: &PneumoniaModel<B>,
    loader: &mut XrayDataLoader,
    device: &B::Device,
) -> anyhow::Result<Predictions> {
    let loss_fn = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(device);

    let mut probabilities = Vec::with_capacity(loader.len());
    let mut labels = Vec::with_capacity(loader.len());
    let mut loss_sum = 0.0;

    let batches = loader.epoch_batches();
    let num_batches = batches.len();
    for (i, indices) in batches.iter().enumerate() {
        let items = loader.load_items(indices)?;
        labels.extend(items.iter().map(|item| item.label));
        let batch: XrayBatch<B> = XrayBatcher.batch(items, device);

        let logits = model.forward(batch.images);
        let [batch_size, _] = logits.dims();
        let logits = logits.reshape([batch_size]);

        let loss: f64 = loss_fn
            .forward(logits.clone(), batch.targets)
            .into_scalar()
            .elem();
        loss_sum += loss * batch_size as f64;

        let probs: Vec<f32> = sigmoid(logits)
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("Failed to read probabilities: {:?}", e))?;
        ensure_finite(&probs, loss, i + 1)?;
        probabilities.extend(probs);

        log::debug!("predict batch {}/{} loss {:.4}", i + 1, num_batches, loss);
    }

    let loss = if labels.is_empty() {
        0.0
    } else {
        loss_sum / labels.len() as f64
    };

    Ok(Predictions {
        probabilities,
        labels,
        loss,
    })
}

/// A diverged model produces NaN or infinite outputs; that ends the run.
fn ensure_finite(probabilities: &[f32], loss: f64, batch: usize) -> anyhow::Result<()> {
    if !loss.is_finite() || probabilities.iter().any(|p| !p.is_finite()) {
        anyhow::bail!("non-finite model output in batch {batch} (loss {loss}), training diverged");
    }
    Ok(())
}

/// Everything computed from one pass over the test set.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub predictions: Predictions,
    pub metrics: ClassificationMetrics,
    pub roc: RocCurve,
    pub threshold: f32,
}

impl Evaluation {
    pub fn from_predictions(predictions: Predictions, threshold: f32) -> Self {
        let metrics = ClassificationMetrics::from_probabilities(
            &predictions.probabilities,
            &predictions.labels,
            threshold,
            predictions.loss,
        );
        let roc = RocCurve::from_scores(&predictions.probabilities, &predictions.labels);
        Self {
            predictions,
            metrics,
            roc,
            threshold,
        }
    }

    /// Text block for `classification_report.txt`.
    pub fn report_section(&self, title: &str) -> String {
        let m = &self.metrics;
        format!(
            "== {title} ==\n\
             threshold: {:.2}\n\
             loss: {:.4}  accuracy: {:.4}  auc: {:.4}  precision: {:.4}  sensitivity: {:.4}\n\n\
             {}\n",
            self.threshold,
            m.loss,
            m.accuracy,
            m.auc,
            m.precision,
            m.recall,
            classification_report(&m.confusion_matrix)
        )
    }

    /// Write `roc_curve{suffix}.svg` and `confusion_matrix{suffix}.svg`.
    pub fn write_charts(&self, output_dir: &Path, suffix: &str, title: &str) -> anyhow::Result<()> {
        charts::write_svg(
            &charts::render_roc_curve(&self.roc, &format!("ROC curve - {title}")),
            &output_dir.join(format!("roc_curve{suffix}.svg")),
        )?;
        charts::write_svg(
            &charts::render_confusion_matrix(
                &self.metrics.confusion_matrix,
                &format!("Confusion matrix - {title}"),
            ),
            &output_dir.join(format!("confusion_matrix{suffix}.svg")),
        )?;
        Ok(())
    }
}

/// Predict over the whole test loader and score the result.
pub fn evaluate<B: Backend>(
    model: &PneumoniaModel<B>,
    loader: &mut XrayDataLoader,
    device: &B::Device,
    threshold: f32,
) -> anyhow::Result<Evaluation> {
    log::info!("Evaluating on {} images", loader.len());
    let predictions = predict(model, loader, device)?;
    Ok(Evaluation::from_predictions(predictions, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;
    use XrayLabel::{Normal as N, Pneumonia as P};

    fn predictions() -> Predictions {
        Predictions {
            probabilities: vec![0.9, 0.8, 0.7, 0.6, 0.95, 0.55, 0.65, 0.3, 0.2, 0.1],
            labels: vec![P, P, P, P, P, P, N, P, N, N],
            loss: 0.4,
        }
    }

    #[test]
    fn test_evaluation_metrics_from_predictions() {
        let eval = Evaluation::from_predictions(predictions(), 0.5);
        let m = &eval.metrics;
        assert_eq!(m.confusion_matrix.cells, [[2, 1], [1, 6]]);
        assert!((m.precision - 6.0 / 7.0).abs() < 1e-12);
        assert!((m.recall - 6.0 / 7.0).abs() < 1e-12);
        assert!((0.0..=1.0).contains(&m.auc));
        assert_eq!(m.confusion_matrix.total(), 10);
    }

    #[test]
    fn test_non_finite_outputs_are_fatal() {
        assert!(ensure_finite(&[0.2, 0.9], 0.3, 1).is_ok());
        let err = ensure_finite(&[0.2, f32::NAN], 0.3, 2).unwrap_err();
        assert!(err.to_string().contains("batch 2"));
        assert!(ensure_finite(&[0.2, 0.9], f64::INFINITY, 1).is_err());
    }

    #[test]
    fn test_report_section_contains_title_and_table() {
        let eval = Evaluation::from_predictions(predictions(), 0.5);
        let text = eval.report_section("Initial model");
        assert!(text.starts_with("== Initial model =="));
        assert!(text.contains("weighted avg"));
    }

    #[test]
    fn test_write_charts_uses_suffix() {
        let dir = tempfile::TempDir::new().unwrap();
        let eval = Evaluation::from_predictions(predictions(), 0.5);
        eval.write_charts(dir.path(), "_finetuned", "fine-tuned").unwrap();
        assert!(dir.path().join("roc_curve_finetuned.svg").exists());
        assert!(dir.path().join("confusion_matrix_finetuned.svg").exists());
    }
}
