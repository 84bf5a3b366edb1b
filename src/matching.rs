//! Detection matching utilities for evaluating predictions against ground truth.
//!
//! Both the box and the mask matcher build a `labels x detections` overlap
//! matrix and hand it to the same greedy one-to-one assignment. The assignment
//! keeps the highest-IoU pair per detection first, then the highest-IoU pair
//! per label among the survivors, so every detection and every label is used
//! at most once.

use std::cmp::Ordering;
use std::collections::HashSet;

use log::warn;

use crate::error::{EvalError, Result};
use crate::mask::{process_mask, process_mask_upsample, Mask};
use crate::metrics::iou::{box_iou_matrix, mask_iou_matrix};
use crate::threshold::IouThresholds;
use crate::types::{BoundingBox, CorrectnessMatrix, Detection, GroundTruthLabel, ImagePredictions};

/// A label/detection pair that survived the greedy assignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedPair {
    pub label: usize,
    pub detection: usize,
    pub iou: f64,
}

/// Anything that can produce a `labels x detections` IoU matrix.
pub trait OverlapSource {
    /// Number of detections (columns).
    fn num_detections(&self) -> usize;

    /// IoU matrix with one row per label and one column per detection.
    fn overlap_matrix(&self) -> Result<Vec<Vec<f64>>>;
}

/// Box IoU between ground-truth labels and detections.
#[derive(Debug, Clone, Copy)]
pub struct BoxOverlap<'a> {
    pub labels: &'a [GroundTruthLabel],
    pub detections: &'a [Detection],
}

impl OverlapSource for BoxOverlap<'_> {
    fn num_detections(&self) -> usize {
        self.detections.len()
    }

    fn overlap_matrix(&self) -> Result<Vec<Vec<f64>>> {
        let label_boxes: Vec<BoundingBox> = self.labels.iter().map(|l| l.bbox).collect();
        let det_boxes: Vec<BoundingBox> = self.detections.iter().map(|d| d.bbox).collect();
        Ok(box_iou_matrix(&label_boxes, &det_boxes))
    }
}

/// Mask IoU between ground-truth masks and predicted masks of equal resolution.
#[derive(Debug, Clone, Copy)]
pub struct MaskOverlap<'a> {
    pub ground_truth: &'a [Mask],
    pub predictions: &'a [Mask],
}

impl OverlapSource for MaskOverlap<'_> {
    fn num_detections(&self) -> usize {
        self.predictions.len()
    }

    fn overlap_matrix(&self) -> Result<Vec<Vec<f64>>> {
        mask_iou_matrix(self.ground_truth, self.predictions)
    }
}

/// Collect `(label, detection, iou)` triples accepted by `accept`, label-major.
pub fn candidate_pairs<F>(iou: &[Vec<f64>], accept: F) -> Vec<MatchedPair>
where
    F: Fn(usize, usize, f64) -> bool,
{
    let mut pairs = Vec::new();
    for (label, row) in iou.iter().enumerate() {
        for (detection, &value) in row.iter().enumerate() {
            if accept(label, detection, value) {
                pairs.push(MatchedPair {
                    label,
                    detection,
                    iou: value,
                });
            }
        }
    }
    pairs
}

/// Greedy one-to-one assignment over candidate pairs.
///
/// Candidates are stably sorted by IoU (descending); the first pair seen for
/// each detection is kept, then the first remaining pair for each label.
/// Equal IoUs keep their candidate order.
///
/// # Example
///
/// ```
/// use det_eval::matching::{greedy_assign, MatchedPair};
///
/// let candidates = vec![
///     MatchedPair { label: 0, detection: 0, iou: 0.6 },
///     MatchedPair { label: 0, detection: 1, iou: 0.9 },
/// ];
/// let matches = greedy_assign(candidates);
/// assert_eq!(matches.len(), 1);
/// assert_eq!(matches[0].detection, 1);
/// ```
pub fn greedy_assign(mut candidates: Vec<MatchedPair>) -> Vec<MatchedPair> {
    candidates.sort_by(|a, b| b.iou.partial_cmp(&a.iou).unwrap_or(Ordering::Equal));

    let mut seen_detections = HashSet::new();
    candidates.retain(|m| seen_detections.insert(m.detection));

    let mut seen_labels = HashSet::new();
    candidates.retain(|m| seen_labels.insert(m.label));

    candidates
}

/// Build the correctness matrix for any overlap source.
///
/// A detection is correct at threshold `t` when it was assigned to a label of
/// the same class with IoU >= `thresholds[t]`. Only pairs reaching the first
/// threshold are considered for assignment.
pub fn match_predictions<O: OverlapSource>(
    overlap: &O,
    label_classes: &[usize],
    detection_classes: &[usize],
    thresholds: &IouThresholds,
) -> Result<CorrectnessMatrix> {
    let n = overlap.num_detections();
    if detection_classes.len() != n {
        return Err(EvalError::ShapeMismatch(format!(
            "{} detection classes for {} detections",
            detection_classes.len(),
            n
        )));
    }
    let mut correct = CorrectnessMatrix::zeros(n, thresholds.len());
    if n == 0 || label_classes.is_empty() {
        return Ok(correct);
    }

    let iou = overlap.overlap_matrix()?;
    if iou.len() != label_classes.len() || iou.iter().any(|row| row.len() != n) {
        return Err(EvalError::ShapeMismatch(format!(
            "overlap matrix does not cover {} labels x {} detections",
            label_classes.len(),
            n
        )));
    }

    let gate = thresholds.min();
    let candidates = candidate_pairs(&iou, |label, detection, value| {
        value >= gate && label_classes[label] == detection_classes[detection]
    });

    for pair in greedy_assign(candidates) {
        for (t, &threshold) in thresholds.iter().enumerate() {
            correct.set(pair.detection, t, pair.iou >= threshold);
        }
    }

    Ok(correct)
}

/// Box matcher: correctness of `detections` against `labels`.
///
/// # Example
///
/// ```
/// use det_eval::matching::match_boxes;
/// use det_eval::threshold::IouThresholds;
/// use det_eval::types::{BoundingBox, Detection, GroundTruthLabel};
///
/// let labels = vec![GroundTruthLabel::new(0, BoundingBox::new(0.0, 0.0, 10.0, 10.0))];
/// let detections = vec![Detection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9, 0)];
/// let thresholds = IouThresholds::new(vec![0.5, 0.55]).unwrap();
///
/// let correct = match_boxes(&detections, &labels, &thresholds);
/// assert_eq!(correct.row(0), &[true, true]);
/// ```
pub fn match_boxes(
    detections: &[Detection],
    labels: &[GroundTruthLabel],
    thresholds: &IouThresholds,
) -> CorrectnessMatrix {
    let overlap = BoxOverlap { labels, detections };
    let label_classes: Vec<usize> = labels.iter().map(|l| l.class_id).collect();
    let detection_classes: Vec<usize> = detections.iter().map(|d| d.class_id).collect();
    match match_predictions(&overlap, &label_classes, &detection_classes, thresholds) {
        Ok(correct) => correct,
        Err(e) => {
            warn!("box matching failed, detections recorded as incorrect: {}", e);
            CorrectnessMatrix::zeros(detections.len(), thresholds.len())
        }
    }
}

/// How predicted and ground-truth masks are brought to a common resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskMatchOptions {
    /// Upsample predicted masks to ground-truth input resolution; otherwise keep
    /// them at prototype resolution and resize ground truth down to match.
    pub upsample: bool,
    /// Ratio between the input resolution and the stored ground-truth mask resolution.
    pub downsample_ratio: usize,
}

impl Default for MaskMatchOptions {
    fn default() -> Self {
        Self {
            upsample: true,
            downsample_ratio: 1,
        }
    }
}

/// Mask matcher output: the correctness matrix and the predicted masks, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskMatch {
    pub correct: CorrectnessMatrix,
    pub masks: Option<Vec<Mask>>,
}

/// Mask matcher: correctness of predicted instance masks against ground-truth masks.
///
/// `ground_truth_masks` holds one mask per label. Prototype output and
/// ground-truth masks must be both present or both absent; with neither the
/// result is an empty matrix and no masks.
pub fn match_masks(
    predictions: &ImagePredictions,
    labels: &[GroundTruthLabel],
    ground_truth_masks: Option<&[Mask]>,
    thresholds: &IouThresholds,
    options: &MaskMatchOptions,
) -> Result<MaskMatch> {
    let (prototypes, gt_masks) = match (predictions.prototypes.as_ref(), ground_truth_masks) {
        (None, None) => {
            return Ok(MaskMatch {
                correct: CorrectnessMatrix::zeros(0, thresholds.len()),
                masks: None,
            })
        }
        (Some(p), Some(g)) => (p, g),
        (p, g) => {
            return Err(EvalError::MaskMismatch(format!(
                "prototype output present: {}, ground-truth masks present: {}",
                p.is_some(),
                g.is_some()
            )))
        }
    };

    let coefficients = predictions.mask_coefficients.as_deref().ok_or_else(|| {
        EvalError::MaskMismatch("prototype output without mask coefficients".to_string())
    })?;
    if gt_masks.len() != labels.len() {
        return Err(EvalError::ShapeMismatch(format!(
            "{} ground-truth masks for {} labels",
            gt_masks.len(),
            labels.len()
        )));
    }
    let first = gt_masks.first().ok_or_else(|| {
        EvalError::ShapeMismatch("mask matching needs at least one ground-truth mask".to_string())
    })?;

    let ratio = options.downsample_ratio.max(1);
    let gt_shape = (first.height() * ratio, first.width() * ratio);
    let boxes: Vec<BoundingBox> = predictions.detections.iter().map(|d| d.bbox).collect();
    let pred_masks = if options.upsample {
        process_mask_upsample(prototypes, coefficients, &boxes, gt_shape)?
    } else {
        process_mask(prototypes, coefficients, &boxes, gt_shape)?
    };

    let target_shape = pred_masks.first().map(Mask::shape).unwrap_or(gt_shape);
    let resized_gt: Vec<Mask> = gt_masks
        .iter()
        .map(|m| m.resize_bilinear(target_shape.0, target_shape.1))
        .collect();

    let overlap = MaskOverlap {
        ground_truth: &resized_gt,
        predictions: &pred_masks,
    };
    let label_classes: Vec<usize> = labels.iter().map(|l| l.class_id).collect();
    let detection_classes: Vec<usize> = predictions.detections.iter().map(|d| d.class_id).collect();
    let correct = match_predictions(&overlap, &label_classes, &detection_classes, thresholds)?;

    Ok(MaskMatch {
        correct,
        masks: Some(pred_masks),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Prototypes;

    fn label(class_id: usize, x1: f64, y1: f64, x2: f64, y2: f64) -> GroundTruthLabel {
        GroundTruthLabel::new(class_id, BoundingBox::new(x1, y1, x2, y2))
    }

    fn det(class_id: usize, conf: f64, x1: f64, y1: f64, x2: f64, y2: f64) -> Detection {
        Detection::new(BoundingBox::new(x1, y1, x2, y2), conf, class_id)
    }

    #[test]
    fn test_perfect_match() {
        let labels = vec![label(0, 0.0, 0.0, 10.0, 10.0)];
        let detections = vec![det(0, 0.9, 0.0, 0.0, 10.0, 10.0)];
        let correct = match_boxes(&detections, &labels, &IouThresholds::coco());
        assert_eq!(correct.rows(), 1);
        assert!(correct.row(0).iter().all(|&v| v));
    }

    #[test]
    fn test_wrong_class_never_matches() {
        let labels = vec![label(0, 0.0, 0.0, 10.0, 10.0)];
        let detections = vec![det(1, 0.9, 0.0, 0.0, 10.0, 10.0)];
        let correct = match_boxes(&detections, &labels, &IouThresholds::coco());
        assert!(!correct.any());
    }

    #[test]
    fn test_partial_iou_sets_lower_thresholds_only() {
        // IoU = 80 / 100 = 0.8
        let labels = vec![label(0, 0.0, 0.0, 10.0, 10.0)];
        let detections = vec![det(0, 0.9, 0.0, 0.0, 10.0, 8.0)];
        let correct = match_boxes(&detections, &labels, &IouThresholds::coco());
        let row = correct.row(0);
        assert_eq!(row.iter().filter(|&&v| v).count(), 7); // 0.50 ..= 0.80
        assert!(row[6] && !row[7]);
    }

    #[test]
    fn test_iou_priority_over_confidence() {
        let labels = vec![label(0, 0.0, 0.0, 10.0, 10.0)];
        let detections = vec![
            det(0, 0.95, 0.0, 0.0, 10.0, 6.0), // IoU 0.6, higher confidence
            det(0, 0.50, 0.0, 0.0, 10.0, 9.0), // IoU 0.9
        ];
        let correct = match_boxes(&detections, &labels, &IouThresholds::coco());
        assert!(!correct.row(0)[0]);
        assert!(correct.row(1)[0]);
    }

    #[test]
    fn test_one_detection_claims_best_label() {
        let labels = vec![label(0, 0.0, 0.0, 10.0, 7.0), label(0, 0.0, 0.0, 10.0, 10.0)];
        let detections = vec![det(0, 0.9, 0.0, 0.0, 10.0, 10.0)];
        let candidates = candidate_pairs(
            &BoxOverlap {
                labels: &labels,
                detections: &detections,
            }
            .overlap_matrix()
            .unwrap(),
            |_, _, iou| iou >= 0.5,
        );
        let matches = greedy_assign(candidates);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].label, 1);
    }

    #[test]
    fn test_ties_keep_candidate_order() {
        let candidates = vec![
            MatchedPair { label: 0, detection: 0, iou: 0.7 },
            MatchedPair { label: 0, detection: 1, iou: 0.7 },
            MatchedPair { label: 1, detection: 1, iou: 0.7 },
        ];
        let matches = greedy_assign(candidates);
        assert_eq!(
            matches,
            vec![
                MatchedPair { label: 0, detection: 0, iou: 0.7 },
                MatchedPair { label: 1, detection: 1, iou: 0.7 },
            ]
        );
    }

    #[test]
    fn test_empty_inputs() {
        let labels = vec![label(0, 0.0, 0.0, 10.0, 10.0)];
        let detections = vec![det(0, 0.9, 0.0, 0.0, 10.0, 10.0)];
        let iouv = IouThresholds::coco();

        let none = match_boxes(&[], &labels, &iouv);
        assert_eq!((none.rows(), none.cols()), (0, 10));

        let unlabeled = match_boxes(&detections, &[], &iouv);
        assert_eq!(unlabeled.rows(), 1);
        assert!(!unlabeled.any());
    }

    fn square_prototypes() -> Prototypes {
        // one channel, strongly positive everywhere: the crop decides the mask
        Prototypes::new(1, 8, 8, vec![10.0; 64]).unwrap()
    }

    #[test]
    fn test_mask_presence_mismatch() {
        let labels = vec![label(0, 0.0, 0.0, 4.0, 4.0)];
        let predictions = ImagePredictions::with_masks(
            vec![det(0, 0.9, 0.0, 0.0, 4.0, 4.0)],
            vec![vec![1.0]],
            square_prototypes(),
        );
        let result = match_masks(
            &predictions,
            &labels,
            None,
            &IouThresholds::coco(),
            &MaskMatchOptions::default(),
        );
        assert!(matches!(result, Err(EvalError::MaskMismatch(_))));
    }

    #[test]
    fn test_mask_both_absent_is_empty() {
        let predictions = ImagePredictions::boxes(vec![det(0, 0.9, 0.0, 0.0, 4.0, 4.0)]);
        let result = match_masks(
            &predictions,
            &[label(0, 0.0, 0.0, 4.0, 4.0)],
            None,
            &IouThresholds::coco(),
            &MaskMatchOptions::default(),
        )
        .unwrap();
        assert_eq!(result.correct.rows(), 0);
        assert!(result.masks.is_none());
    }

    #[test]
    fn test_mask_match_both_resolutions() {
        let labels = vec![label(0, 0.0, 0.0, 4.0, 4.0)];
        let gt = vec![Mask::from_rect(8, 8, &BoundingBox::new(0.0, 0.0, 4.0, 4.0))];
        let predictions = ImagePredictions::with_masks(
            vec![det(0, 0.9, 0.0, 0.0, 4.0, 4.0)],
            vec![vec![1.0]],
            square_prototypes(),
        );

        for upsample in [true, false] {
            let options = MaskMatchOptions {
                upsample,
                downsample_ratio: 1,
            };
            let result = match_masks(
                &predictions,
                &labels,
                Some(&gt),
                &IouThresholds::coco(),
                &options,
            )
            .unwrap();
            assert!(result.correct.row(0).iter().all(|&v| v), "upsample={}", upsample);
            assert_eq!(result.masks.unwrap().len(), 1);
        }
    }

    #[test]
    fn test_match_predictions_rejects_class_length_mismatch() {
        let labels = vec![label(0, 0.0, 0.0, 10.0, 10.0)];
        let detections = vec![det(0, 0.9, 0.0, 0.0, 10.0, 10.0)];
        let overlap = BoxOverlap {
            labels: &labels,
            detections: &detections,
        };
        let result = match_predictions(&overlap, &[0], &[0, 0], &IouThresholds::coco());
        assert!(matches!(result, Err(EvalError::ShapeMismatch(_))));
    }

    #[test]
    fn test_mask_match_scales_downsampled_ground_truth() {
        // 16x16 input, ground truth stored at half resolution, 8x8 prototypes
        let labels = vec![label(0, 0.0, 0.0, 8.0, 8.0)];
        let gt = vec![Mask::from_rect(8, 8, &BoundingBox::new(0.0, 0.0, 4.0, 4.0))];
        let predictions = ImagePredictions::with_masks(
            vec![det(0, 0.9, 0.0, 0.0, 8.0, 8.0)],
            vec![vec![1.0]],
            square_prototypes(),
        );
        let thresholds = IouThresholds::new(vec![0.5]).unwrap();

        for (upsample, mask_shape) in [(true, (16, 16)), (false, (8, 8))] {
            let scaled = MaskMatchOptions {
                upsample,
                downsample_ratio: 2,
            };
            let result = match_masks(&predictions, &labels, Some(&gt), &thresholds, &scaled).unwrap();
            assert!(result.correct.get(0, 0), "upsample={}", upsample);
            assert_eq!(result.masks.unwrap()[0].shape(), mask_shape);

            // read as full resolution, the predicted mask covers four times the object
            let unscaled = MaskMatchOptions {
                upsample,
                downsample_ratio: 1,
            };
            let result = match_masks(&predictions, &labels, Some(&gt), &thresholds, &unscaled).unwrap();
            assert!(!result.correct.get(0, 0), "upsample={}", upsample);
        }
    }
}
