//! Precision/recall curves and the resampling helpers used by the aggregator.

use crate::types::CorrectnessMatrix;

/// Number of recall samples used for AP integration (0.00, 0.01, ..., 1.00).
pub const RECALL_SAMPLES: usize = 101;

/// Keeps recall finite for classes whose ground-truth count is zero.
pub const EPS: f64 = 1e-16;

/// Cumulative precision and recall for one class, one column per IoU threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecisionRecallCurve {
    /// `precision[t][k]` after the first `k + 1` detections at threshold `t`.
    pub precision: Vec<Vec<f64>>,
    /// `recall[t][k]` after the first `k + 1` detections at threshold `t`.
    pub recall: Vec<Vec<f64>>,
}

/// Calculate precision/recall curves from confidence-sorted correctness rows.
///
/// # Arguments
///
/// * `correct` - one row per detection of a single class, sorted by confidence (descending)
/// * `num_ground_truth` - number of ground-truth objects of that class
pub fn calculate_precision_recall_curve(
    correct: &CorrectnessMatrix,
    num_ground_truth: usize,
) -> PrecisionRecallCurve {
    let mut precision = Vec::with_capacity(correct.cols());
    let mut recall = Vec::with_capacity(correct.cols());

    for t in 0..correct.cols() {
        let mut tp = 0usize;
        let mut p = Vec::with_capacity(correct.rows());
        let mut r = Vec::with_capacity(correct.rows());
        for k in 0..correct.rows() {
            if correct.get(k, t) {
                tp += 1;
            }
            let seen = k + 1;
            p.push(tp as f64 / seen as f64);
            r.push(tp as f64 / (num_ground_truth as f64 + EPS));
        }
        precision.push(p);
        recall.push(r);
    }

    PrecisionRecallCurve { precision, recall }
}

/// Interpolate precision values for standard recall levels.
///
/// The curve is bracketed by sentinels, `(0, 1)` in front and `(1, 0)` at the
/// end, and precision is made non-increasing from high recall to low recall (a
/// running maximum from the tail). Each of the 101 recall levels is then read
/// off the envelope by linear interpolation.
///
/// `recall` must be non-decreasing, which holds for cumulative curves.
pub fn interpolate_precision(precision: &[f64], recall: &[f64]) -> Vec<f64> {
    let n = precision.len().min(recall.len());

    let mut mrec = Vec::with_capacity(n + 2);
    mrec.push(0.0);
    mrec.extend_from_slice(&recall[..n]);
    mrec.push(1.0);

    let mut envelope = Vec::with_capacity(n + 2);
    envelope.push(1.0);
    envelope.extend_from_slice(&precision[..n]);
    envelope.push(0.0);
    for i in (0..envelope.len() - 1).rev() {
        envelope[i] = envelope[i].max(envelope[i + 1]);
    }

    (0..RECALL_SAMPLES)
        .map(|i| {
            let level = i as f64 / (RECALL_SAMPLES - 1) as f64;
            sample_envelope(level, &mrec, &envelope)
        })
        .collect()
}

/// Reads the envelope at `level`; `mrec` ends with the `1.0` sentinel.
///
/// On a repeated recall value the last curve point wins, but the end sentinel
/// never does, so a curve that reaches recall 1.0 keeps its precision there.
fn sample_envelope(level: f64, mrec: &[f64], envelope: &[f64]) -> f64 {
    let last = mrec.len() - 1;
    let k = mrec[..last].partition_point(|&r| r <= level).max(1) - 1;
    if mrec[k] == level {
        return envelope[k];
    }
    let span = mrec[k + 1] - mrec[k];
    if span <= 0.0 {
        return envelope[k + 1];
    }
    envelope[k] + (envelope[k + 1] - envelope[k]) * (level - mrec[k]) / span
}

/// One-dimensional linear interpolation over ascending sample points.
///
/// Below the first point `left` is returned; above the last point the last
/// value is held. With repeated sample points the right-most one wins.
pub fn interp(x: f64, xp: &[f64], fp: &[f64], left: f64) -> f64 {
    let n = xp.len().min(fp.len());
    if n == 0 || x < xp[0] {
        return left;
    }
    let j = xp[..n].partition_point(|&v| v <= x) - 1;
    if j + 1 >= n {
        return fp[n - 1];
    }
    let span = xp[j + 1] - xp[j];
    if span <= 0.0 {
        return fp[j];
    }
    fp[j] + (fp[j + 1] - fp[j]) * (x - xp[j]) / span
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_recall_curve() {
        let correct = CorrectnessMatrix::from_rows(
            vec![
                vec![true, true],
                vec![true, false],
                vec![false, false],
                vec![true, false],
            ],
            2,
        )
        .unwrap();
        let curve = calculate_precision_recall_curve(&correct, 4);

        assert!((curve.precision[0][0] - 1.0).abs() < 1e-10);
        assert!((curve.precision[0][2] - 2.0 / 3.0).abs() < 1e-10);
        assert!((curve.recall[0][3] - 0.75).abs() < 1e-10);
        assert!((curve.recall[1][3] - 0.25).abs() < 1e-10);
    }

    #[test]
    fn test_interpolate_precision_envelope() {
        let precision = vec![1.0, 0.5, 0.67, 0.5];
        let recall = vec![0.25, 0.25, 0.5, 0.5];

        let interpolated = interpolate_precision(&precision, &recall);
        assert_eq!(interpolated.len(), RECALL_SAMPLES);
        assert_eq!(interpolated[0], 1.0);
        assert_eq!(interpolated[24], 1.0);
        // the last point at a repeated recall value wins
        assert!((interpolated[25] - 0.67).abs() < 1e-12);
        assert!((interpolated[26] - 0.67).abs() < 1e-12);
        assert!((interpolated[50] - 0.5).abs() < 1e-12);
        // past the last curve point the envelope falls linearly to the end sentinel
        assert!((interpolated[75] - 0.25).abs() < 1e-12);
        assert_eq!(interpolated[100], 0.0);
    }

    #[test]
    fn test_interpolate_precision_full_recall_keeps_last_level() {
        let interpolated = interpolate_precision(&[1.0, 1.0], &[0.5, 1.0]);
        assert!(interpolated.iter().all(|&p| p == 1.0));
    }

    #[test]
    fn test_interpolate_precision_no_recall() {
        let interpolated = interpolate_precision(&[0.0, 0.0], &[0.0, 0.0]);
        assert!(interpolated.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn test_interpolate_precision_empty_curve() {
        let interpolated = interpolate_precision(&[], &[]);
        assert_eq!(interpolated[0], 1.0);
        assert!((interpolated[50] - 0.5).abs() < 1e-12);
        assert_eq!(interpolated[100], 0.0);
    }

    #[test]
    fn test_interp() {
        let xp = [-0.9, -0.5];
        let fp = [1.0, 0.5];
        assert_eq!(interp(-1.0, &xp, &fp, 0.0), 0.0);
        assert_eq!(interp(-0.9, &xp, &fp, 0.0), 1.0);
        assert!((interp(-0.7, &xp, &fp, 0.0) - 0.75).abs() < 1e-10);
        assert_eq!(interp(0.0, &xp, &fp, 0.0), 0.5);
    }

    #[test]
    fn test_interp_repeated_points_take_rightmost() {
        let xp = [-0.9, -0.9, -0.9];
        let fp = [1.0, 0.5, 0.33];
        assert_eq!(interp(-0.9, &xp, &fp, 0.0), 0.33);
        assert_eq!(interp(-0.1, &xp, &fp, 0.0), 0.33);
    }
}
