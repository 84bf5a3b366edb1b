/// Non-Maximum Suppression (`NMS`) for detections.
///
/// The evaluator treats NMS as part of the inference provider; this reference
/// implementation is what the replay provider uses.

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};
use crate::metrics::iou::box_iou;
use crate::types::Detection;

/// Parameters passed to an inference provider's NMS stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NmsParams {
    /// Detections at or below this confidence are dropped.
    pub conf_thres: f64,
    /// Overlap above which the lower-scoring box is suppressed.
    pub iou_thres: f64,
    /// Suppress across classes.
    pub agnostic: bool,
    /// Maximum detections kept per image.
    pub max_det: usize,
}

impl Default for NmsParams {
    fn default() -> Self {
        Self {
            conf_thres: 0.001,
            iou_thres: 0.6,
            agnostic: false,
            max_det: 300,
        }
    }
}

/// Apply Non-Maximum Suppression to a set of detections
///
/// # Arguments
///
/// * `detections` - Candidate detections of one image
/// * `params` - Confidence gate, `IoU` threshold, class handling and cap
///
/// # Returns
///
/// Boolean mask indicating which detections to keep. At most `max_det` entries
/// are kept, highest scores first.
///
/// # Errors
///
/// Returns error if `iou_thres` or `conf_thres` is not in range [0.0, 1.0]
///
/// # Examples
///
/// ```
/// # use det_eval::nms::{non_maximum_suppression, NmsParams};
/// # use det_eval::types::{BoundingBox, Detection};
/// let detections = vec![
///     Detection::new(BoundingBox::new(10.0, 10.0, 50.0, 50.0), 0.9, 0),
///     Detection::new(BoundingBox::new(15.0, 15.0, 55.0, 55.0), 0.8, 0),
///     Detection::new(BoundingBox::new(100.0, 100.0, 150.0, 150.0), 0.95, 0),
/// ];
///
/// let params = NmsParams { iou_thres: 0.5, ..NmsParams::default() };
/// let keep_mask = non_maximum_suppression(&detections, &params).unwrap();
/// assert_eq!(keep_mask, vec![true, false, true]);
/// ```
pub fn non_maximum_suppression(detections: &[Detection], params: &NmsParams) -> Result<Vec<bool>> {
    for (name, value) in [("IoU", params.iou_thres), ("confidence", params.conf_thres)] {
        if !(0.0..=1.0).contains(&value) {
            return Err(EvalError::InvalidThreshold(format!(
                "{name} threshold must be between 0 and 1, got {value}"
            )));
        }
    }

    let n = detections.len();
    let mut keep_mask: Vec<bool> = detections
        .iter()
        .map(|d| d.confidence > params.conf_thres)
        .collect();
    if n == 0 {
        return Ok(keep_mask);
    }

    // Sort indices by score (descending)
    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .partial_cmp(&detections[a].confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept = 0;
    for (i, &idx_i) in indices.iter().enumerate() {
        if !keep_mask[idx_i] {
            continue;
        }
        if kept == params.max_det {
            keep_mask[idx_i] = false;
            continue;
        }
        kept += 1;

        for &idx_j in &indices[(i + 1)..] {
            if !keep_mask[idx_j] {
                continue;
            }
            if !params.agnostic && detections[idx_i].class_id != detections[idx_j].class_id {
                continue;
            }
            if box_iou(&detections[idx_i].bbox, &detections[idx_j].bbox) > params.iou_thres {
                keep_mask[idx_j] = false;
            }
        }
    }

    Ok(keep_mask)
}

/// Kept detections, highest confidence first.
pub fn apply_nms(detections: &[Detection], params: &NmsParams) -> Result<Vec<Detection>> {
    let keep_mask = non_maximum_suppression(detections, params)?;
    let mut kept: Vec<Detection> = detections
        .iter()
        .zip(keep_mask)
        .filter_map(|(d, keep)| keep.then_some(*d))
        .collect();
    kept.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(kept)
}
