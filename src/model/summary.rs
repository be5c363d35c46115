//! Human-readable architecture summary written to `model_architecture.txt`.

use std::fmt::Write as _;
use std::path::Path;

use burn::{module::Module, tensor::backend::Backend};

use super::PneumoniaModel;

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSummary {
    pub name: String,
    pub kind: &'static str,
    /// Output shape without the batch dimension
    pub output_shape: Vec<usize>,
    pub params: usize,
    pub trainable: bool,
}

/// One row per layer, shapes traced for a square `image_size` input.
pub fn layer_summaries<B: Backend>(
    model: &PneumoniaModel<B>,
    image_size: usize,
) -> Vec<LayerSummary> {
    let mut rows = Vec::new();
    let mut side = image_size;

    rows.push(LayerSummary {
        name: "input".to_string(),
        kind: "Input",
        output_shape: vec![3, side, side],
        params: 0,
        trainable: false,
    });

    for (i, block) in model.backbone.blocks.iter().enumerate() {
        let trainable = model.is_block_trainable(i);
        let channels = block.out_channels();
        rows.push(LayerSummary {
            name: block.conv_name(),
            kind: "Conv2d",
            output_shape: vec![channels, side, side],
            params: block.conv.num_params(),
            trainable,
        });
        rows.push(LayerSummary {
            name: block.bn_name(),
            kind: "BatchNorm",
            output_shape: vec![channels, side, side],
            params: block.bn.num_params(),
            trainable,
        });
        rows.push(LayerSummary {
            name: block.relu_name(),
            kind: "Relu",
            output_shape: vec![channels, side, side],
            params: 0,
            trainable,
        });
        if let Some(name) = block.pool_name() {
            side /= 2;
            rows.push(LayerSummary {
                name,
                kind: "MaxPool2d",
                output_shape: vec![channels, side, side],
                params: 0,
                trainable,
            });
        }
    }

    let head = &model.head;
    let features = head.dense.weight.val().dims()[0];
    let units = head.dense.weight.val().dims()[1];
    rows.extend([
        LayerSummary {
            name: "global_avg_pool".to_string(),
            kind: "AdaptiveAvgPool2d",
            output_shape: vec![features],
            params: 0,
            trainable: true,
        },
        LayerSummary {
            name: "dense".to_string(),
            kind: "Linear",
            output_shape: vec![units],
            params: head.dense.num_params(),
            trainable: true,
        },
        LayerSummary {
            name: "dense_relu".to_string(),
            kind: "Relu",
            output_shape: vec![units],
            params: 0,
            trainable: true,
        },
        LayerSummary {
            name: "dropout".to_string(),
            kind: "Dropout",
            output_shape: vec![units],
            params: 0,
            trainable: true,
        },
        LayerSummary {
            name: "output".to_string(),
            kind: "Linear+Sigmoid",
            output_shape: vec![1],
            params: head.output.num_params(),
            trainable: true,
        },
    ]);

    rows
}

pub fn render_summary<B: Backend>(model: &PneumoniaModel<B>, image_size: usize) -> String {
    let rows = layer_summaries(model, image_size);
    let (trainable, frozen) = model.parameter_counts();

    let mut out = String::new();
    let rule = "=".repeat(78);
    let _ = writeln!(out, "Model: PneumoniaModel");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(
        out,
        "{:<20} {:<18} {:<18} {:>12}  {}",
        "Layer", "Type", "Output shape", "Params", "Trainable"
    );
    let _ = writeln!(out, "{}", "-".repeat(78));
    for row in &rows {
        let shape = row
            .output_shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x");
        let _ = writeln!(
            out,
            "{:<20} {:<18} {:<18} {:>12}  {}",
            row.name,
            row.kind,
            shape,
            row.params,
            if row.trainable { "yes" } else { "no" }
        );
    }
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Total params:         {}", trainable + frozen);
    let _ = writeln!(out, "Trainable params:     {trainable}");
    let _ = writeln!(out, "Non-trainable params: {frozen}");
    let _ = writeln!(
        out,
        "Frozen blocks:        {}/{}",
        model.frozen_blocks(),
        model.backbone.len()
    );
    out
}

pub fn write_summary<B: Backend>(
    model: &PneumoniaModel<B>,
    image_size: usize,
    path: &Path,
) -> anyhow::Result<()> {
    std::fs::write(path, render_summary(model, image_size))?;
    log::info!("Model summary written to {}", path.display());
    Ok(())
}
