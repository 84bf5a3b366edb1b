//! Average Precision (AP) and mean Average Precision (mAP) calculation.

use crate::metrics::precision_recall::{interpolate_precision, RECALL_SAMPLES};

/// Calculate Average Precision (AP) from a precision-recall curve.
///
/// The precision envelope, bracketed by the `(0, 1)` and `(1, 0)` sentinels,
/// is sampled at 101 recall levels and integrated with the trapezoid rule
/// over [0, 1].
///
/// # Arguments
///
/// * `precisions` - Precision values, one per detection in confidence order
/// * `recalls` - Recall values (non-decreasing)
///
/// # Returns
///
/// Returns the Average Precision value (0.0 to 1.0).
///
/// # Example
///
/// ```
/// use det_eval::metrics::ap::calculate_ap;
///
/// let precisions = vec![1.0, 1.0, 0.67, 0.75, 0.6];
/// let recalls = vec![0.25, 0.5, 0.5, 0.75, 0.75];
/// let ap = calculate_ap(&precisions, &recalls);
/// assert!(ap >= 0.0 && ap <= 1.0);
/// ```
pub fn calculate_ap(precisions: &[f64], recalls: &[f64]) -> f64 {
    if precisions.is_empty() || recalls.is_empty() {
        return 0.0;
    }

    let interpolated = interpolate_precision(precisions, recalls);
    let step = 1.0 / (RECALL_SAMPLES - 1) as f64;

    interpolated
        .windows(2)
        .map(|w| (w[0] + w[1]) * 0.5 * step)
        .sum()
}

/// Arithmetic mean of AP values, 0.0 when empty.
///
/// # Example
///
/// ```
/// use det_eval::metrics::ap::calculate_map;
///
/// let class_aps = vec![0.8, 0.9, 0.75, 0.85];
/// let map = calculate_map(&class_aps);
/// assert!((map - 0.825).abs() < 1e-10);
/// ```
pub fn calculate_map(class_aps: &[f64]) -> f64 {
    if class_aps.is_empty() {
        return 0.0;
    }

    class_aps.iter().sum::<f64>() / class_aps.len() as f64
}
