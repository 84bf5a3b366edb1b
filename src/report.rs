//! Final report of an evaluation run.

use log::info;
use polars::prelude::*;
use serde::Serialize;

use crate::aggregate::EvalMetric;
use crate::confusion::ConfusionMatrix;
use crate::error::Result;
use crate::export::format_significant;
use crate::types::Speed;

const NAME_WIDTH: usize = 20;
const COLUMN_WIDTH: usize = 11;

/// Table header; mask runs add four mask columns.
pub fn header(with_masks: bool) -> String {
    let columns: &[&str] = if with_masks {
        &[
            "Images", "Labels", "Box:{P", "R", "mAP@.5", "mAP@.5:.95}", "Mask:{P", "R", "mAP@.5",
            "mAP@.5:.95}",
        ]
    } else {
        &["Images", "Labels", "P", "R", "mAP@.5", "mAP@.5:.95"]
    };
    let mut line = format!("{:>NAME_WIDTH$}", "Class");
    for column in columns {
        line.push_str(&format!("{:>COLUMN_WIDTH$}", column));
    }
    line
}

/// One table row: name, image count, label count and 3-digit metric values.
pub fn format_row(name: &str, images: usize, labels: usize, values: &[f64]) -> String {
    let mut line = format!("{:>NAME_WIDTH$}{:>COLUMN_WIDTH$}{:>COLUMN_WIDTH$}", name, images, labels);
    for &value in values {
        line.push_str(&format!("{:>COLUMN_WIDTH$}", format_significant(value, 3)));
    }
    line
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    /// `[mp, mr, map50, map]`, followed by the mask equivalents in mask runs.
    pub mean_results: Vec<f64>,
    /// Accumulated loss per batch; empty when no loss function was supplied.
    pub losses: Vec<f64>,
    /// Dense per-class mAP@0.5:0.95 of length `nc`.
    pub maps: Vec<f64>,
    pub speed: Speed,
    pub metric: EvalMetric,
    /// Ground-truth count per class; all zero when nothing matched.
    pub targets_per_class: Vec<usize>,
    /// Images scanned.
    pub seen: usize,
    pub confusion_matrix: Option<ConfusionMatrix>,
}

impl EvalReport {
    pub fn num_targets(&self) -> usize {
        self.targets_per_class.iter().sum()
    }

    /// The `all` row.
    pub fn summary_row(&self) -> String {
        format_row("all", self.seen, self.num_targets(), &self.mean_results)
    }

    /// One row per class in the metric table.
    pub fn class_rows(&self, names: &[String]) -> Vec<String> {
        self.metric
            .ap_class_index()
            .iter()
            .enumerate()
            .filter_map(|(i, &class_id)| {
                let values = self.metric.class_result(i)?;
                let labels = self.targets_per_class.get(class_id).copied().unwrap_or(0);
                Some(format_row(&class_name(names, class_id), self.seen, labels, &values))
            })
            .collect()
    }

    /// `Speed: ...ms pre-process, ...ms inference, ...ms NMS per image`.
    pub fn speed_line(&self) -> String {
        let (pre, inference, nms) = self.speed.as_tuple();
        format!(
            "Speed: {:.1}ms pre-process, {:.1}ms inference, {:.1}ms NMS per image",
            pre, inference, nms
        )
    }

    /// Log the table at info level. Class rows need `verbose` and more than one class.
    pub fn log(&self, names: &[String], verbose: bool) {
        info!("{}", header(self.metric.has_masks()));
        info!("{}", self.summary_row());
        if verbose && self.maps.len() > 1 {
            for row in self.class_rows(names) {
                info!("{}", row);
            }
        }
        info!("{}", self.speed_line());
    }

    /// Per-class results as a DataFrame.
    pub fn class_table(&self, names: &[String]) -> Result<DataFrame> {
        let classes = self.metric.ap_class_index();
        let rows: Vec<Vec<f64>> = (0..classes.len())
            .filter_map(|i| self.metric.class_result(i))
            .collect();
        let column = |k: usize| -> Vec<f64> { rows.iter().map(|r| r[k]).collect() };

        let mut columns: Vec<Column> = vec![
            Series::new(
                "class".into(),
                classes.iter().map(|&c| class_name(names, c)).collect::<Vec<_>>(),
            )
            .into(),
            Series::new(
                "labels".into(),
                classes
                    .iter()
                    .map(|&c| self.targets_per_class.get(c).copied().unwrap_or(0) as u64)
                    .collect::<Vec<_>>(),
            )
            .into(),
        ];
        let mut names_for_values = vec!["box_p", "box_r", "box_map50", "box_map"];
        if self.metric.has_masks() {
            names_for_values.extend(["mask_p", "mask_r", "mask_map50", "mask_map"]);
        }
        for (k, name) in names_for_values.into_iter().enumerate() {
            columns.push(Series::new(name.into(), column(k)).into());
        }

        Ok(DataFrame::new(columns)?)
    }
}

fn class_name(names: &[String], class_id: usize) -> String {
    names
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| class_id.to_string())
}
