//! Class confusion matrix for diagnostics.
//!
//! Counts are indexed `[predicted][true]` over `nc + 1` classes, the last
//! index being background. The matrix does not feed into AP or mAP.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::matching::{candidate_pairs, greedy_assign, BoxOverlap, OverlapSource};
use crate::types::{Detection, GroundTruthLabel};

/// Default minimum confidence for detections counted in the matrix.
pub const DEFAULT_CONF: f64 = 0.25;
/// Default IoU above which a detection and a label are paired.
pub const DEFAULT_IOU: f64 = 0.45;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    nc: usize,
    conf: f64,
    iou_thres: f64,
    matrix: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(nc: usize) -> Self {
        Self::with_thresholds(nc, DEFAULT_CONF, DEFAULT_IOU)
    }

    pub fn with_thresholds(nc: usize, conf: f64, iou_thres: f64) -> Self {
        Self {
            nc,
            conf,
            iou_thres,
            matrix: vec![vec![0; nc + 1]; nc + 1],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.nc
    }

    /// Raw counts, `[predicted][true]`.
    pub fn matrix(&self) -> &[Vec<u64>] {
        &self.matrix
    }

    pub fn get(&self, predicted: usize, truth: usize) -> u64 {
        self.matrix
            .get(predicted)
            .and_then(|row| row.get(truth))
            .copied()
            .unwrap_or(0)
    }

    /// Update with one image's detections and labels (same pixel space).
    ///
    /// Pairing is class-agnostic with IoU strictly above the threshold and uses
    /// the same greedy assignment as the matcher. A label paired exactly once
    /// counts at `[detected class][label class]`, otherwise as missed
    /// background. Unpaired detections count as background false positives
    /// when the image produced at least one pair.
    pub fn process_batch(&mut self, detections: &[Detection], labels: &[GroundTruthLabel]) {
        let detections: Vec<Detection> = detections
            .iter()
            .copied()
            .filter(|d| d.confidence > self.conf)
            .collect();

        let iou = match (BoxOverlap {
            labels,
            detections: &detections,
        })
        .overlap_matrix()
        {
            Ok(iou) => iou,
            Err(e) => {
                warn!("confusion matrix skipped an image: {}", e);
                return;
            }
        };
        let threshold = self.iou_thres;
        let matches = greedy_assign(candidate_pairs(&iou, |_, _, v| v > threshold));
        let any_match = !matches.is_empty();

        for (i, label) in labels.iter().enumerate() {
            let mut paired = matches.iter().filter(|m| m.label == i);
            match (paired.next(), paired.next()) {
                (Some(m), None) => self.increment(detections[m.detection].class_id, label.class_id),
                _ => self.increment(self.nc, label.class_id),
            }
        }

        if any_match {
            for (i, det) in detections.iter().enumerate() {
                if !matches.iter().any(|m| m.detection == i) {
                    self.increment(det.class_id, self.nc);
                }
            }
        }
    }

    fn increment(&mut self, predicted: usize, truth: usize) {
        match self.matrix.get_mut(predicted).and_then(|row| row.get_mut(truth)) {
            Some(count) => *count += 1,
            None => warn!(
                "class pair ({}, {}) outside the {} configured classes",
                predicted, truth, self.nc
            ),
        }
    }

    /// Per-class true positives and false positives, background excluded.
    pub fn tp_fp(&self) -> (Vec<u64>, Vec<u64>) {
        let tp: Vec<u64> = (0..self.nc).map(|c| self.matrix[c][c]).collect();
        let fp = (0..self.nc)
            .map(|c| self.matrix[c].iter().sum::<u64>() - tp[c])
            .collect();
        (tp, fp)
    }

    /// Column-normalized matrix (each true class sums to 1), for plotting.
    pub fn normalized(&self) -> Vec<Vec<f64>> {
        let totals: Vec<u64> = (0..=self.nc)
            .map(|t| self.matrix.iter().map(|row| row[t]).sum())
            .collect();
        self.matrix
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&totals)
                    .map(|(&v, &total)| v as f64 / (total as f64 + 1e-9))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn gt(class_id: usize, x: f64) -> GroundTruthLabel {
        GroundTruthLabel::new(class_id, BoundingBox::new(x, 0.0, x + 10.0, 10.0))
    }

    fn det(class_id: usize, conf: f64, x: f64) -> Detection {
        Detection::new(BoundingBox::new(x, 0.0, x + 10.0, 10.0), conf, class_id)
    }

    #[test]
    fn test_correct_and_confused() {
        let mut cm = ConfusionMatrix::new(3);
        cm.process_batch(&[det(0, 0.9, 0.0), det(2, 0.9, 50.0)], &[gt(0, 0.0), gt(1, 50.0)]);
        assert_eq!(cm.get(0, 0), 1);
        assert_eq!(cm.get(2, 1), 1);
        let (tp, fp) = cm.tp_fp();
        assert_eq!(tp, vec![1, 0, 0]);
        assert_eq!(fp, vec![0, 0, 1]);
    }

    #[test]
    fn test_missed_label_and_background_detection() {
        let mut cm = ConfusionMatrix::new(2);
        cm.process_batch(
            &[det(0, 0.9, 0.0), det(1, 0.9, 100.0)],
            &[gt(0, 0.0), gt(1, 50.0)],
        );
        assert_eq!(cm.get(0, 0), 1);
        assert_eq!(cm.get(2, 1), 1); // missed
        assert_eq!(cm.get(1, 2), 1); // background false positive
    }

    #[test]
    fn test_low_confidence_ignored() {
        let mut cm = ConfusionMatrix::new(1);
        cm.process_batch(&[det(0, 0.1, 0.0)], &[gt(0, 0.0)]);
        assert_eq!(cm.get(1, 0), 1);
        assert_eq!(cm.get(0, 0), 0);
    }

    #[test]
    fn test_no_pairs_leaves_detections_uncounted() {
        let mut cm = ConfusionMatrix::new(1);
        cm.process_batch(&[det(0, 0.9, 100.0)], &[gt(0, 0.0)]);
        assert_eq!(cm.get(1, 0), 1);
        assert_eq!(cm.get(0, 1), 0);
    }

    #[test]
    fn test_every_label_counted_once() {
        let mut cm = ConfusionMatrix::new(2);
        let labels = vec![gt(0, 0.0), gt(1, 20.0), gt(0, 40.0)];
        cm.process_batch(&[det(0, 0.9, 0.0), det(0, 0.8, 1.0), det(1, 0.9, 41.0)], &labels);
        let counted: u64 = (0..3).map(|t| (0..3).map(|p| cm.get(p, t)).sum::<u64>()).take(2).sum();
        assert_eq!(counted, labels.len() as u64);
    }
}
