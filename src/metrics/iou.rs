//! Intersection over Union (IoU) for boxes and masks.

use rayon::prelude::*;

use crate::error::{EvalError, Result};
use crate::mask::Mask;
use crate::types::BoundingBox;

/// Calculate the Intersection over Union (IoU) between two corner-form boxes.
///
/// Returns a value between 0.0 (no overlap) and 1.0 (perfect overlap).
///
/// # Example
///
/// ```
/// use det_eval::metrics::iou::box_iou;
/// use det_eval::types::BoundingBox;
///
/// let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
/// let b = BoundingBox::new(5.0, 5.0, 15.0, 15.0);
/// let iou = box_iou(&a, &b);
/// assert!(iou > 0.0 && iou < 1.0);
/// ```
pub fn box_iou(a: &BoundingBox, b: &BoundingBox) -> f64 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = inter_w * inter_h;

    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

/// IoU matrix where `result[i][j]` is the IoU between `rows[i]` and `cols[j]`.
///
/// # Example
///
/// ```
/// use det_eval::metrics::iou::box_iou_matrix;
/// use det_eval::types::BoundingBox;
///
/// let labels = vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)];
/// let detections = vec![
///     BoundingBox::new(0.0, 0.0, 10.0, 10.0),
///     BoundingBox::new(50.0, 50.0, 60.0, 60.0),
/// ];
/// let iou = box_iou_matrix(&labels, &detections);
/// assert_eq!(iou.len(), 1);
/// assert_eq!(iou[0].len(), 2);
/// ```
pub fn box_iou_matrix(rows: &[BoundingBox], cols: &[BoundingBox]) -> Vec<Vec<f64>> {
    rows.iter()
        .map(|a| cols.iter().map(|b| box_iou(a, b)).collect())
        .collect()
}

/// Mask IoU matrix (`ground_truth x predictions`) over flattened pixels.
///
/// Pixel values act as weights, so fractional ground-truth masks produced by
/// resizing contribute proportionally.
pub fn mask_iou_matrix(ground_truth: &[Mask], predictions: &[Mask]) -> Result<Vec<Vec<f64>>> {
    let shape = ground_truth
        .first()
        .or_else(|| predictions.first())
        .map(Mask::shape);
    if let Some(shape) = shape {
        if let Some(bad) = ground_truth
            .iter()
            .chain(predictions.iter())
            .find(|m| m.shape() != shape)
        {
            return Err(EvalError::ShapeMismatch(format!(
                "mask IoU needs equal resolutions, got {:?} and {:?}",
                shape,
                bad.shape()
            )));
        }
    }

    let pred_areas: Vec<f64> = predictions.iter().map(Mask::area).collect();

    Ok(ground_truth
        .par_iter()
        .map(|gt| {
            let gt_area = gt.area();
            predictions
                .iter()
                .zip(&pred_areas)
                .map(|(pred, &pred_area)| {
                    let intersection: f64 = gt
                        .pixels()
                        .iter()
                        .zip(pred.pixels())
                        .map(|(&g, &p)| f64::from(g) * f64::from(p))
                        .sum();
                    let union = gt_area + pred_area - intersection;
                    if union <= 0.0 {
                        0.0
                    } else {
                        intersection / union
                    }
                })
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((box_iou(&a, &a) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_no_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(box_iou(&a, &b), 0.0);
    }

    #[test]
    fn test_partial_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 5.0, 15.0, 15.0);

        // Intersection: 5x5 = 25
        // Union: 100 + 100 - 25 = 175
        assert!((box_iou(&a, &b) - 25.0 / 175.0).abs() < 1e-10);
    }

    #[test]
    fn test_zero_area_boxes() {
        let a = BoundingBox::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(box_iou(&a, &a), 0.0);
    }

    #[test]
    fn test_mask_iou() {
        let a = Mask::from_rect(4, 4, &BoundingBox::new(0.0, 0.0, 2.0, 4.0));
        let b = Mask::from_rect(4, 4, &BoundingBox::new(0.0, 0.0, 4.0, 4.0));
        let iou = mask_iou_matrix(&[a.clone()], &[a, b]).unwrap();
        assert!((iou[0][0] - 1.0).abs() < 1e-10);
        assert!((iou[0][1] - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_mask_iou_shape_mismatch() {
        let a = Mask::zeros(4, 4);
        let b = Mask::zeros(2, 2);
        assert!(mask_iou_matrix(&[a], &[b]).is_err());
    }

    #[test]
    fn test_mask_iou_empty_masks() {
        let a = Mask::zeros(2, 2);
        let iou = mask_iou_matrix(&[a.clone()], &[a]).unwrap();
        assert_eq!(iou[0][0], 0.0);
    }
}
