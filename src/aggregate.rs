//! Metric aggregation over the concatenated statistics of a run.
//!
//! [`ap_per_class`] turns correctness rows into per-class precision, recall, F1
//! and AP; [`Metric`] wraps the result with the summary accessors used by the
//! report; [`EvalMetric`] pairs box and mask metrics when masks are evaluated.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};
use crate::metrics::ap::{calculate_ap, calculate_map};
use crate::metrics::f1_score::{argmax, calculate_f1_score};
use crate::metrics::precision_recall::{calculate_precision_recall_curve, interp};
use crate::stats::StatArrays;
use crate::types::CorrectnessMatrix;

/// Number of confidence points the P/R curves are resampled on.
pub const CURVE_POINTS: usize = 1000;

/// Per-class results, one entry per class that has ground truth (ascending id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassStats {
    /// Precision at the selected operating point.
    pub precision: Vec<f64>,
    /// Recall at the selected operating point.
    pub recall: Vec<f64>,
    /// F1 at the selected operating point.
    pub f1: Vec<f64>,
    /// `ap[c][t]`: AP of class `c` at IoU threshold `t`.
    pub ap: Vec<Vec<f64>>,
    pub classes: Vec<usize>,
}

/// Compute per-class precision, recall, F1 and AP.
///
/// Predictions are sorted by confidence (descending). For every class with
/// ground truth, cumulative TP/FP give the precision/recall curve per threshold
/// column and AP integrates its envelope. Precision and recall at IoU index 0
/// are resampled on [`CURVE_POINTS`] confidence values; the reported point is
/// the one maximizing the class-mean F1.
///
/// # Arguments
///
/// * `correct` - correctness rows for every prediction
/// * `confidences` - prediction confidences
/// * `predicted_classes` - prediction class ids
/// * `target_classes` - class id of every ground-truth object
pub fn ap_per_class(
    correct: &CorrectnessMatrix,
    confidences: &[f64],
    predicted_classes: &[usize],
    target_classes: &[usize],
) -> Result<ClassStats> {
    let n = correct.rows();
    if confidences.len() != n || predicted_classes.len() != n {
        return Err(EvalError::ShapeMismatch(format!(
            "{} correctness rows, {} confidences, {} classes",
            n,
            confidences.len(),
            predicted_classes.len()
        )));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        confidences[b]
            .partial_cmp(&confidences[a])
            .unwrap_or(Ordering::Equal)
    });

    let mut targets: BTreeMap<usize, usize> = BTreeMap::new();
    for &c in target_classes {
        *targets.entry(c).or_insert(0) += 1;
    }

    let px: Vec<f64> = (0..CURVE_POINTS)
        .map(|i| i as f64 / (CURVE_POINTS - 1) as f64)
        .collect();
    let num_thresholds = correct.cols();

    let mut p_curves = Vec::with_capacity(targets.len());
    let mut r_curves = Vec::with_capacity(targets.len());
    let mut ap = Vec::with_capacity(targets.len());
    let mut classes = Vec::with_capacity(targets.len());

    for (&class_id, &num_labels) in &targets {
        classes.push(class_id);

        let selected: Vec<usize> = order
            .iter()
            .copied()
            .filter(|&i| predicted_classes[i] == class_id)
            .collect();
        if selected.is_empty() || num_labels == 0 {
            p_curves.push(vec![0.0; CURVE_POINTS]);
            r_curves.push(vec![0.0; CURVE_POINTS]);
            ap.push(vec![0.0; num_thresholds]);
            continue;
        }

        let curve = calculate_precision_recall_curve(&correct.select_rows(&selected), num_labels);
        // ascending sample points for interpolation
        let neg_conf: Vec<f64> = selected.iter().map(|&i| -confidences[i]).collect();

        if num_thresholds > 0 {
            p_curves.push(
                px.iter()
                    .map(|&x| interp(-x, &neg_conf, &curve.precision[0], 1.0))
                    .collect(),
            );
            r_curves.push(
                px.iter()
                    .map(|&x| interp(-x, &neg_conf, &curve.recall[0], 0.0))
                    .collect(),
            );
        } else {
            p_curves.push(vec![0.0; CURVE_POINTS]);
            r_curves.push(vec![0.0; CURVE_POINTS]);
        }

        ap.push(
            curve
                .precision
                .iter()
                .zip(&curve.recall)
                .map(|(p, r)| calculate_ap(p, r))
                .collect(),
        );
    }

    if classes.is_empty() {
        return Ok(ClassStats::default());
    }

    let f1_curves: Vec<Vec<f64>> = p_curves
        .iter()
        .zip(&r_curves)
        .map(|(p, r)| {
            p.iter()
                .zip(r)
                .map(|(&p, &r)| calculate_f1_score(p, r))
                .collect()
        })
        .collect();

    let mean_f1: Vec<f64> = (0..CURVE_POINTS)
        .map(|k| f1_curves.iter().map(|c| c[k]).sum::<f64>() / f1_curves.len() as f64)
        .collect();
    let best = argmax(&mean_f1);

    Ok(ClassStats {
        precision: p_curves.iter().map(|c| c[best]).collect(),
        recall: r_curves.iter().map(|c| c[best]).collect(),
        f1: f1_curves.iter().map(|c| c[best]).collect(),
        ap,
        classes,
    })
}

/// Summary metric for one output kind (boxes or masks).
///
/// Built once from [`ClassStats`] and read-only afterwards. The default value
/// (no classes) reports zero for every mean.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub p: Vec<f64>,
    pub r: Vec<f64>,
    pub f1: Vec<f64>,
    /// `all_ap[c][t]`, one row per class in `ap_class_index`.
    pub all_ap: Vec<Vec<f64>>,
    pub ap_class_index: Vec<usize>,
}

impl From<ClassStats> for Metric {
    fn from(stats: ClassStats) -> Self {
        Self {
            p: stats.precision,
            r: stats.recall,
            f1: stats.f1,
            all_ap: stats.ap,
            ap_class_index: stats.classes,
        }
    }
}

impl Metric {
    /// AP@0.5 per class.
    pub fn ap50(&self) -> Vec<f64> {
        self.all_ap
            .iter()
            .map(|row| row.first().copied().unwrap_or(0.0))
            .collect()
    }

    /// AP@0.5:0.95 per class.
    pub fn ap(&self) -> Vec<f64> {
        self.all_ap.iter().map(|row| calculate_map(row)).collect()
    }

    /// Mean precision over classes.
    pub fn mp(&self) -> f64 {
        calculate_map(&self.p)
    }

    /// Mean recall over classes.
    pub fn mr(&self) -> f64 {
        calculate_map(&self.r)
    }

    /// Mean AP@0.5 over classes.
    pub fn map50(&self) -> f64 {
        calculate_map(&self.ap50())
    }

    /// Mean AP@0.5:0.95 over classes.
    pub fn map(&self) -> f64 {
        calculate_map(&self.ap())
    }

    /// `[mp, mr, map50, map]`.
    pub fn mean_results(&self) -> [f64; 4] {
        [self.mp(), self.mr(), self.map50(), self.map()]
    }

    /// `[p, r, ap50, ap]` for the `i`-th class of `ap_class_index`.
    pub fn class_result(&self, i: usize) -> Option<[f64; 4]> {
        let row = self.all_ap.get(i)?;
        Some([
            *self.p.get(i)?,
            *self.r.get(i)?,
            row.first().copied().unwrap_or(0.0),
            calculate_map(row),
        ])
    }

    /// Dense AP@0.5:0.95 of length `nc`, defaulting to the overall mAP.
    pub fn get_maps(&self, nc: usize) -> Vec<f64> {
        let mut maps = vec![self.map(); nc];
        for (i, ap) in self.ap().into_iter().enumerate() {
            let class_id = self.ap_class_index[i];
            match maps.get_mut(class_id) {
                Some(slot) => *slot = ap,
                None => warn!("class id {} outside the {} configured classes", class_id, nc),
            }
        }
        maps
    }
}

/// Box metric alone, or box and mask metrics together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalMetric {
    Boxes(Metric),
    BoxesAndMasks { boxes: Metric, masks: Metric },
}

impl EvalMetric {
    /// Zero-valued metric of the requested arity.
    pub fn empty(with_masks: bool) -> Self {
        if with_masks {
            Self::BoxesAndMasks {
                boxes: Metric::default(),
                masks: Metric::default(),
            }
        } else {
            Self::Boxes(Metric::default())
        }
    }

    pub fn has_masks(&self) -> bool {
        matches!(self, Self::BoxesAndMasks { .. })
    }

    pub fn boxes(&self) -> &Metric {
        match self {
            Self::Boxes(boxes) | Self::BoxesAndMasks { boxes, .. } => boxes,
        }
    }

    pub fn masks(&self) -> Option<&Metric> {
        match self {
            Self::Boxes(_) => None,
            Self::BoxesAndMasks { masks, .. } => Some(masks),
        }
    }

    /// Classes in the per-class table; boxes and masks share them.
    pub fn ap_class_index(&self) -> &[usize] {
        &self.boxes().ap_class_index
    }

    /// Box mean results followed by mask mean results.
    pub fn mean_results(&self) -> Vec<f64> {
        let mut out = self.boxes().mean_results().to_vec();
        if let Some(masks) = self.masks() {
            out.extend(masks.mean_results());
        }
        out
    }

    /// Box class result followed by mask class result.
    pub fn class_result(&self, i: usize) -> Option<Vec<f64>> {
        let mut out = self.boxes().class_result(i)?.to_vec();
        if let Some(masks) = self.masks() {
            out.extend(masks.class_result(i)?);
        }
        Some(out)
    }

    /// Dense per-class maps; box and mask arrays are summed element-wise.
    pub fn get_maps(&self, nc: usize) -> Vec<f64> {
        let mut maps = self.boxes().get_maps(nc);
        if let Some(masks) = self.masks() {
            for (slot, m) in maps.iter_mut().zip(masks.get_maps(nc)) {
                *slot += m;
            }
        }
        maps
    }
}

/// Aggregate concatenated statistics into the run metric.
///
/// Without a single true positive (boxes or masks) the metric stays at its
/// zero default.
pub fn aggregate(arrays: &StatArrays, with_masks: bool) -> Result<EvalMetric> {
    if !arrays.has_true_positive() {
        return Ok(EvalMetric::empty(with_masks));
    }

    let boxes = Metric::from(ap_per_class(
        &arrays.correct,
        &arrays.confidences,
        &arrays.predicted_classes,
        &arrays.target_classes,
    )?);
    if !with_masks {
        return Ok(EvalMetric::Boxes(boxes));
    }

    let mask_correct = arrays.mask_correct.as_ref().ok_or_else(|| {
        EvalError::MaskMismatch("mask evaluation without mask statistics".to_string())
    })?;
    let masks = Metric::from(ap_per_class(
        mask_correct,
        &arrays.confidences,
        &arrays.predicted_classes,
        &arrays.target_classes,
    )?);
    Ok(EvalMetric::BoxesAndMasks { boxes, masks })
}
