//! SVG charts for the evaluation and training artifacts.
//!
//! Charts are rendered to strings first so they can be checked without
//! touching the filesystem.

use std::fs;
use std::path::Path;

use crate::data::XrayLabel;
use crate::metrics::{ConfusionMatrix, RocCurve, TrainingHistory, TrainingPhase};

const CHART_WIDTH: f64 = 800.0;
const CHART_HEIGHT: f64 = 500.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 80.0;
const MARGIN_LEFT: f64 = 80.0;

const COLOR_PRIMARY: &str = "#3498db";
const COLOR_SECONDARY: &str = "#2ecc71";
const COLOR_TERTIARY: &str = "#e74c3c";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

#[derive(Debug, Clone)]
pub struct DataSeries {
    pub name: String,
    pub points: Vec<(f64, f64)>,
    pub color: String,
    pub dashed: bool,
}

struct Axes {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

impl Axes {
    fn plot_width() -> f64 {
        CHART_WIDTH - MARGIN_LEFT - MARGIN_RIGHT
    }

    fn plot_height() -> f64 {
        CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM
    }

    fn x(&self, value: f64) -> f64 {
        let span = (self.x_max - self.x_min).max(f64::EPSILON);
        MARGIN_LEFT + (value - self.x_min) / span * Self::plot_width()
    }

    fn y(&self, value: f64) -> f64 {
        let span = (self.y_max - self.y_min).max(f64::EPSILON);
        MARGIN_TOP + Self::plot_height() - (value - self.y_min) / span * Self::plot_height()
    }
}

fn svg_open(svg: &mut String, title: &str) {
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
        CHART_WIDTH, CHART_HEIGHT, CHART_WIDTH, CHART_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        CHART_WIDTH, CHART_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        CHART_WIDTH / 2.0,
        COLOR_TEXT,
        escape_xml(title)
    ));
}

/// Line chart with a grid, labelled axes and a legend.
pub fn render_line_chart(
    title: &str,
    x_label: &str,
    y_label: &str,
    series: &[DataSeries],
    x_range: (f64, f64),
    y_range: (f64, f64),
) -> String {
    let axes = Axes {
        x_min: x_range.0,
        x_max: x_range.1,
        y_min: y_range.0,
        y_max: y_range.1,
    };
    let plot_width = Axes::plot_width();
    let plot_height = Axes::plot_height();

    let mut svg = String::new();
    svg_open(&mut svg, title);

    for i in 0..=5 {
        let fraction = i as f64 / 5.0;
        let value = axes.y_min + fraction * (axes.y_max - axes.y_min);
        let y = axes.y(value);
        svg.push_str(&format!(
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT,
            y,
            MARGIN_LEFT + plot_width,
            y,
            COLOR_GRID
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}">{:.2}</text>"#,
            MARGIN_LEFT - 10.0,
            y + 4.0,
            COLOR_TEXT,
            value
        ));

        let x_value = axes.x_min + fraction * (axes.x_max - axes.x_min);
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="11" fill="{}">{:.2}</text>"#,
            axes.x(x_value),
            MARGIN_TOP + plot_height + 20.0,
            COLOR_TEXT,
            x_value
        ));
    }

    svg.push_str(&format!(
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT,
        MARGIN_TOP + plot_height,
        MARGIN_LEFT + plot_width,
        MARGIN_TOP + plot_height,
        COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT,
        MARGIN_TOP,
        MARGIN_LEFT,
        MARGIN_TOP + plot_height,
        COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">{}</text>"#,
        MARGIN_LEFT + plot_width / 2.0,
        CHART_HEIGHT - 20.0,
        COLOR_TEXT,
        escape_xml(x_label)
    ));
    svg.push_str(&format!(
        r#"<text x="20" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 20 {})">{}</text>"#,
        CHART_HEIGHT / 2.0,
        COLOR_TEXT,
        CHART_HEIGHT / 2.0,
        escape_xml(y_label)
    ));

    for s in series.iter().filter(|s| !s.points.is_empty()) {
        let path = s
            .points
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| {
                let cmd = if i == 0 { "M" } else { "L" };
                format!("{} {:.2} {:.2}", cmd, axes.x(x), axes.y(y))
            })
            .collect::<Vec<_>>()
            .join(" ");
        let dash = if s.dashed {
            r#" stroke-dasharray="6 4""#
        } else {
            ""
        };
        svg.push_str(&format!(
            r#"<path d="{}" fill="none" stroke="{}" stroke-width="2"{}/>"#,
            path, s.color, dash
        ));
    }

    let mut legend_y = MARGIN_TOP + 10.0;
    for s in series {
        svg.push_str(&format!(
            r#"<rect x="{}" y="{}" width="15" height="15" fill="{}"/>"#,
            CHART_WIDTH - MARGIN_RIGHT - 200.0,
            legend_y,
            s.color
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            CHART_WIDTH - MARGIN_RIGHT - 180.0,
            legend_y + 12.0,
            COLOR_TEXT,
            escape_xml(&s.name)
        ));
        legend_y += 25.0;
    }

    svg.push_str("</svg>");
    svg
}

pub fn render_roc_curve(roc: &RocCurve, title: &str) -> String {
    let series = [
        DataSeries {
            name: format!("ROC (AUC = {:.4})", roc.auc),
            points: roc.fpr.iter().copied().zip(roc.tpr.iter().copied()).collect(),
            color: COLOR_PRIMARY.to_string(),
            dashed: false,
        },
        DataSeries {
            name: "Chance".to_string(),
            points: vec![(0.0, 0.0), (1.0, 1.0)],
            color: COLOR_TERTIARY.to_string(),
            dashed: true,
        },
    ];
    render_line_chart(
        title,
        "False positive rate",
        "True positive rate",
        &series,
        (0.0, 1.0),
        (0.0, 1.0),
    )
}

/// 2x2 grid shaded by count, every cell annotated with its value.
pub fn render_confusion_matrix(cm: &ConfusionMatrix, title: &str) -> String {
    let max = cm.cells.iter().flatten().copied().max().unwrap_or(0);
    let cell = 150.0;
    let left = (CHART_WIDTH - 2.0 * cell) / 2.0;
    let top = MARGIN_TOP + 40.0;

    let mut svg = String::new();
    svg_open(&mut svg, title);

    for actual in XrayLabel::ALL {
        let row = actual.to_index();
        for predicted in XrayLabel::ALL {
            let col = predicted.to_index();
            let count = cm.cells[row][col];
            let intensity = if max > 0 {
                count as f64 / max as f64
            } else {
                0.0
            };
            // white to the primary blue
            let shade = |c: f64| (255.0 - intensity * (255.0 - c)).round() as u8;
            let fill = format!("#{:02x}{:02x}{:02x}", shade(52.0), shade(152.0), shade(219.0));
            let text_color = if intensity > 0.5 { "white" } else { COLOR_TEXT };
            let x = left + col as f64 * cell;
            let y = top + row as f64 * cell;

            svg.push_str(&format!(
                r#"<rect x="{}" y="{}" width="{}" height="{}" fill="{}" stroke="{}" stroke-width="1"/>"#,
                x, y, cell, cell, fill, COLOR_AXIS
            ));
            svg.push_str(&format!(
                r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="24" font-weight="bold" fill="{}">{}</text>"#,
                x + cell / 2.0,
                y + cell / 2.0 + 8.0,
                text_color,
                count
            ));
        }

        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="13" fill="{}">{}</text>"#,
            left - 10.0,
            top + row as f64 * cell + cell / 2.0 + 5.0,
            COLOR_TEXT,
            actual
        ));
    }

    for predicted in XrayLabel::ALL {
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="13" fill="{}">{}</text>"#,
            left + predicted.to_index() as f64 * cell + cell / 2.0,
            top - 10.0,
            COLOR_TEXT,
            predicted
        ));
    }

    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">Predicted</text>"#,
        CHART_WIDTH / 2.0,
        top + 2.0 * cell + 30.0,
        COLOR_TEXT
    ));
    svg.push_str(&format!(
        r#"<text x="30" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 30 {})">Actual</text>"#,
        top + cell,
        COLOR_TEXT,
        top + cell
    ));

    svg.push_str("</svg>");
    svg
}

/// Loss and validation AUC over every epoch of both phases.
pub fn render_history(history: &TrainingHistory) -> String {
    let mut train_loss = Vec::new();
    let mut val_loss = Vec::new();
    let mut val_auc = Vec::new();
    let mut fine_tune_start = None;

    for (i, r) in history.records().iter().enumerate() {
        let x = (i + 1) as f64;
        if r.phase == TrainingPhase::FineTune && fine_tune_start.is_none() {
            fine_tune_start = Some(x);
        }
        train_loss.push((x, r.train_loss));
        val_loss.push((x, r.val_loss));
        val_auc.push((x, r.val_auc));
    }

    let y_max = train_loss
        .iter()
        .chain(&val_loss)
        .map(|&(_, y)| y)
        .filter(|y| y.is_finite())
        .fold(1.0f64, f64::max);
    let x_max = (history.len() as f64).max(2.0);

    let mut series = vec![
        DataSeries {
            name: "train loss".to_string(),
            points: train_loss,
            color: COLOR_PRIMARY.to_string(),
            dashed: false,
        },
        DataSeries {
            name: "val loss".to_string(),
            points: val_loss,
            color: COLOR_TERTIARY.to_string(),
            dashed: false,
        },
        DataSeries {
            name: "val AUC".to_string(),
            points: val_auc,
            color: COLOR_SECONDARY.to_string(),
            dashed: false,
        },
    ];
    if let Some(x) = fine_tune_start {
        series.push(DataSeries {
            name: "fine-tuning starts".to_string(),
            points: vec![(x, 0.0), (x, y_max)],
            color: COLOR_AXIS.to_string(),
            dashed: true,
        });
    }

    render_line_chart(
        "Training history",
        "Epoch",
        "Value",
        &series,
        (1.0, x_max),
        (0.0, y_max),
    )
}

pub fn write_svg(svg: &str, path: &Path) -> std::io::Result<()> {
    fs::write(path, svg)?;
    log::info!("Chart written to {}", path.display());
    Ok(())
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
