//! F1 score and operating-point selection.

use crate::metrics::precision_recall::EPS;

/// Calculate F1 score from precision and recall.
///
/// F1 score is the harmonic mean of precision and recall:
/// F1 = 2 × (Precision × Recall) / (Precision + Recall)
///
/// A small epsilon in the denominator keeps the value at 0.0 when both
/// precision and recall are 0.
///
/// # Example
///
/// ```
/// use det_eval::metrics::f1_score::calculate_f1_score;
///
/// let f1 = calculate_f1_score(0.8, 0.6);
/// assert!((f1 - 0.6857).abs() < 0.001);
/// ```
pub fn calculate_f1_score(precision: f64, recall: f64) -> f64 {
    2.0 * (precision * recall) / (precision + recall + EPS)
}

/// Index of the first maximum of `values`; 0 for an empty slice.
///
/// Used to pick the reporting operating point on a class-mean F1 curve.
///
/// # Example
///
/// ```
/// use det_eval::metrics::f1_score::argmax;
///
/// assert_eq!(argmax(&[0.2, 0.9, 0.9, 0.1]), 1);
/// ```
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}
