//! Per-image statistics recording.
//!
//! Each evaluated image produces at most one [`StatRecord`]. Records are appended
//! to a [`StatsBuffer`] during the scan and concatenated once into global
//! [`StatArrays`] before aggregation.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};
use crate::mask::Mask;
use crate::matching::{match_boxes, match_masks, MaskMatchOptions};
use crate::threshold::IouThresholds;
use crate::types::{CorrectnessMatrix, Detection, GroundTruthLabel, ImagePredictions};

/// Matching results for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    /// Box correctness, one row per detection.
    pub correct: CorrectnessMatrix,
    /// Mask correctness, same shape as `correct`, when masks are evaluated.
    pub mask_correct: Option<CorrectnessMatrix>,
    pub confidences: Vec<f64>,
    pub predicted_classes: Vec<usize>,
    pub target_classes: Vec<usize>,
}

impl StatRecord {
    /// Build a record, checking that the per-detection columns line up.
    pub fn new(
        correct: CorrectnessMatrix,
        mask_correct: Option<CorrectnessMatrix>,
        confidences: Vec<f64>,
        predicted_classes: Vec<usize>,
        target_classes: Vec<usize>,
    ) -> Result<Self> {
        let n = correct.rows();
        if confidences.len() != n || predicted_classes.len() != n {
            return Err(EvalError::ShapeMismatch(format!(
                "{} correctness rows, {} confidences, {} classes",
                n,
                confidences.len(),
                predicted_classes.len()
            )));
        }
        if let Some(mask) = &mask_correct {
            if mask.rows() != n || mask.cols() != correct.cols() {
                return Err(EvalError::ShapeMismatch(format!(
                    "mask correctness {}x{} does not match box correctness {}x{}",
                    mask.rows(),
                    mask.cols(),
                    n,
                    correct.cols()
                )));
            }
        }
        Ok(Self {
            correct,
            mask_correct,
            confidences,
            predicted_classes,
            target_classes,
        })
    }

    /// Record for an image with labels but no detections.
    pub fn unmatched_targets(target_classes: Vec<usize>, num_thresholds: usize, with_masks: bool) -> Self {
        Self {
            correct: CorrectnessMatrix::zeros(0, num_thresholds),
            mask_correct: with_masks.then(|| CorrectnessMatrix::zeros(0, num_thresholds)),
            confidences: Vec::new(),
            predicted_classes: Vec::new(),
            target_classes,
        }
    }

    pub fn num_detections(&self) -> usize {
        self.correct.rows()
    }

    pub fn has_true_positive(&self) -> bool {
        self.correct.any() || self.mask_correct.as_ref().map_or(false, CorrectnessMatrix::any)
    }
}

/// Options shared by every call to [`record_image`] within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderOptions {
    pub thresholds: IouThresholds,
    pub single_cls: bool,
    pub with_masks: bool,
    pub mask: MaskMatchOptions,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            thresholds: IouThresholds::coco(),
            single_cls: false,
            with_masks: false,
            mask: MaskMatchOptions::default(),
        }
    }
}

/// Outcome of recording one image.
#[derive(Debug, Clone, Default)]
pub struct ImageOutcome {
    /// `None` when the image had neither labels nor detections.
    pub record: Option<StatRecord>,
    /// Predicted masks, available when masks were matched.
    pub masks: Option<Vec<Mask>>,
}

/// Match one image's predictions against its labels.
///
/// Labels are expected in model-input pixel coordinates. `ground_truth_masks`
/// holds one mask per label when masks are evaluated.
///
/// Returns `MaskMismatch` if mask evaluation is on and exactly one of prototype
/// output and ground-truth masks is present. Any other shape problem is logged
/// and recorded as an all-false match for the image.
pub fn record_image(
    predictions: &ImagePredictions,
    labels: &[GroundTruthLabel],
    ground_truth_masks: Option<&[Mask]>,
    options: &RecorderOptions,
) -> Result<ImageOutcome> {
    let num_thresholds = options.thresholds.len();

    if options.with_masks && predictions.prototypes.is_some() != ground_truth_masks.is_some() {
        return Err(EvalError::MaskMismatch(format!(
            "prototype output present: {}, ground-truth masks present: {}",
            predictions.prototypes.is_some(),
            ground_truth_masks.is_some()
        )));
    }

    let (detections, labels) = if options.single_cls {
        (
            predictions
                .detections
                .iter()
                .map(|d| Detection { class_id: 0, ..*d })
                .collect::<Vec<_>>(),
            labels
                .iter()
                .map(|l| GroundTruthLabel { class_id: 0, ..*l })
                .collect::<Vec<_>>(),
        )
    } else {
        (predictions.detections.clone(), labels.to_vec())
    };

    let target_classes: Vec<usize> = labels.iter().map(|l| l.class_id).collect();

    if detections.is_empty() {
        if labels.is_empty() {
            return Ok(ImageOutcome::default());
        }
        return Ok(ImageOutcome {
            record: Some(StatRecord::unmatched_targets(
                target_classes,
                num_thresholds,
                options.with_masks,
            )),
            masks: None,
        });
    }

    let correct = if labels.is_empty() {
        CorrectnessMatrix::zeros(detections.len(), num_thresholds)
    } else {
        match_boxes(&detections, &labels, &options.thresholds)
    };

    let mut masks = None;
    let mask_correct = if !options.with_masks {
        None
    } else if labels.is_empty() {
        Some(CorrectnessMatrix::zeros(detections.len(), num_thresholds))
    } else {
        let view = ImagePredictions {
            detections: detections.clone(),
            mask_coefficients: predictions.mask_coefficients.clone(),
            prototypes: predictions.prototypes.clone(),
        };
        match match_masks(
            &view,
            &labels,
            ground_truth_masks,
            &options.thresholds,
            &options.mask,
        ) {
            Ok(result) => {
                masks = result.masks;
                Some(result.correct)
            }
            Err(EvalError::ShapeMismatch(message)) => {
                warn!("mask matching skipped for image: {}", message);
                Some(CorrectnessMatrix::zeros(detections.len(), num_thresholds))
            }
            Err(e) => return Err(e),
        }
    };

    let record = StatRecord::new(
        correct,
        mask_correct,
        detections.iter().map(|d| d.confidence).collect(),
        detections.iter().map(|d| d.class_id).collect(),
        target_classes,
    )?;

    Ok(ImageOutcome {
        record: Some(record),
        masks,
    })
}

/// Global arrays built from every record of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatArrays {
    pub correct: CorrectnessMatrix,
    pub mask_correct: Option<CorrectnessMatrix>,
    pub confidences: Vec<f64>,
    pub predicted_classes: Vec<usize>,
    pub target_classes: Vec<usize>,
}

impl StatArrays {
    /// True if any detection is correct at any threshold, for boxes or masks.
    pub fn has_true_positive(&self) -> bool {
        self.correct.any() || self.mask_correct.as_ref().map_or(false, CorrectnessMatrix::any)
    }

    /// Ground-truth count per class id, length `nc`; ids >= `nc` are ignored.
    pub fn targets_per_class(&self, nc: usize) -> Vec<usize> {
        let mut counts = vec![0; nc];
        for &c in &self.target_classes {
            if let Some(slot) = counts.get_mut(c) {
                *slot += 1;
            }
        }
        counts
    }
}

/// Append-only record buffer owned by a single scan.
#[derive(Debug, Clone, Default)]
pub struct StatsBuffer {
    num_thresholds: usize,
    with_masks: bool,
    records: Vec<StatRecord>,
}

impl StatsBuffer {
    pub fn new(num_thresholds: usize, with_masks: bool) -> Self {
        Self {
            num_thresholds,
            with_masks,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: StatRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[StatRecord] {
        &self.records
    }

    pub fn has_true_positive(&self) -> bool {
        self.records.iter().any(StatRecord::has_true_positive)
    }

    /// Concatenate every record, consuming the buffer.
    pub fn concatenate(self) -> Result<StatArrays> {
        let correct = CorrectnessMatrix::concat(self.records.iter().map(|r| &r.correct), self.num_thresholds)?;

        let mask_correct = if self.with_masks {
            let mut masks = Vec::with_capacity(self.records.len());
            for record in &self.records {
                let m = record.mask_correct.as_ref().ok_or_else(|| {
                    EvalError::MaskMismatch("record without mask correctness in a mask run".to_string())
                })?;
                masks.push(m);
            }
            Some(CorrectnessMatrix::concat(masks, self.num_thresholds)?)
        } else {
            None
        };

        let mut arrays = StatArrays {
            correct,
            mask_correct,
            ..StatArrays::default()
        };
        for record in self.records {
            arrays.confidences.extend(record.confidences);
            arrays.predicted_classes.extend(record.predicted_classes);
            arrays.target_classes.extend(record.target_classes);
        }
        Ok(arrays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Prototypes;
    use crate::types::BoundingBox;

    fn gt(class_id: usize) -> GroundTruthLabel {
        GroundTruthLabel::new(class_id, BoundingBox::new(0.0, 0.0, 10.0, 10.0))
    }

    fn det(class_id: usize, conf: f64) -> Detection {
        Detection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), conf, class_id)
    }

    #[test]
    fn test_nothing_recorded_for_empty_image() {
        let outcome =
            record_image(&ImagePredictions::default(), &[], None, &RecorderOptions::default()).unwrap();
        assert!(outcome.record.is_none());
    }

    #[test]
    fn test_labels_without_detections() {
        let outcome = record_image(
            &ImagePredictions::default(),
            &[gt(2), gt(3)],
            None,
            &RecorderOptions::default(),
        )
        .unwrap();
        let record = outcome.record.unwrap();
        assert_eq!(record.num_detections(), 0);
        assert_eq!(record.correct.cols(), 10);
        assert_eq!(record.target_classes, vec![2, 3]);
    }

    #[test]
    fn test_detections_without_labels_are_false_positives() {
        let outcome = record_image(
            &ImagePredictions::boxes(vec![det(0, 0.8)]),
            &[],
            None,
            &RecorderOptions::default(),
        )
        .unwrap();
        let record = outcome.record.unwrap();
        assert_eq!(record.num_detections(), 1);
        assert!(!record.has_true_positive());
        assert!(record.target_classes.is_empty());
    }

    #[test]
    fn test_single_cls_coerces_both_sides() {
        let options = RecorderOptions {
            single_cls: true,
            ..RecorderOptions::default()
        };
        let outcome = record_image(&ImagePredictions::boxes(vec![det(4, 0.8)]), &[gt(7)], None, &options).unwrap();
        let record = outcome.record.unwrap();
        assert!(record.correct.row(0).iter().all(|&v| v));
        assert_eq!(record.predicted_classes, vec![0]);
        assert_eq!(record.target_classes, vec![0]);
    }

    #[test]
    fn test_mask_presence_mismatch_is_fatal() {
        let options = RecorderOptions {
            with_masks: true,
            ..RecorderOptions::default()
        };
        let gt_masks = vec![Mask::zeros(4, 4)];
        let result = record_image(
            &ImagePredictions::boxes(vec![det(0, 0.8)]),
            &[gt(0)],
            Some(&gt_masks),
            &options,
        );
        assert!(matches!(result, Err(EvalError::MaskMismatch(_))));
    }

    #[test]
    fn test_mask_shape_mismatch_records_all_false() {
        let options = RecorderOptions {
            with_masks: true,
            ..RecorderOptions::default()
        };
        let prototypes = Prototypes::new(2, 4, 4, vec![1.0; 32]).unwrap();
        // three coefficients for a two-channel prototype
        let predictions = ImagePredictions::with_masks(vec![det(0, 0.8)], vec![vec![1.0, 1.0, 1.0]], prototypes);
        let gt_masks = vec![Mask::from_rect(10, 10, &BoundingBox::new(0.0, 0.0, 10.0, 10.0))];

        let record = record_image(&predictions, &[gt(0)], Some(&gt_masks), &options)
            .unwrap()
            .record
            .unwrap();
        assert!(record.correct.any());
        assert!(!record.mask_correct.unwrap().any());
    }

    #[test]
    fn test_buffer_concatenate() {
        let mut buffer = StatsBuffer::new(10, false);
        let options = RecorderOptions::default();
        for (preds, labels) in [
            (vec![det(0, 0.9)], vec![gt(0)]),
            (vec![], vec![gt(1)]),
            (vec![det(1, 0.3), det(2, 0.2)], vec![]),
        ] {
            let outcome = record_image(&ImagePredictions::boxes(preds), &labels, None, &options).unwrap();
            if let Some(record) = outcome.record {
                buffer.push(record);
            }
        }
        assert_eq!(buffer.len(), 3);
        assert!(buffer.has_true_positive());

        let arrays = buffer.concatenate().unwrap();
        assert_eq!(arrays.correct.rows(), 3);
        assert_eq!(arrays.confidences, vec![0.9, 0.3, 0.2]);
        assert_eq!(arrays.predicted_classes, vec![0, 1, 2]);
        assert_eq!(arrays.target_classes, vec![0, 1]);
        assert_eq!(arrays.targets_per_class(3), vec![1, 1, 0]);
        assert!(arrays.mask_correct.is_none());
    }
}
