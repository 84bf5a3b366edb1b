//! IoU threshold vectors and threshold validation.

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};

/// Ordered IoU thresholds used to build correctness matrices.
///
/// Thresholds are ascending and lie in [0.0, 1.0]; the first one is the
/// minimum overlap any match must reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct IouThresholds(Vec<f64>);

impl IouThresholds {
    /// Build a threshold vector, rejecting empty, unordered or out-of-range input.
    pub fn new(thresholds: Vec<f64>) -> Result<Self> {
        if thresholds.is_empty() {
            return Err(EvalError::InvalidThreshold(
                "IoU threshold vector must not be empty".to_string(),
            ));
        }
        for &t in &thresholds {
            validate_threshold(t)?;
        }
        if thresholds.windows(2).any(|w| w[1] < w[0]) {
            return Err(EvalError::InvalidThreshold(format!(
                "IoU thresholds must be ascending, got {:?}",
                thresholds
            )));
        }
        Ok(Self(thresholds))
    }

    /// The COCO vector: 10 thresholds from 0.50 to 0.95 in steps of 0.05.
    pub fn coco() -> Self {
        Self((0..10).map(|i| 0.5 + 0.05 * i as f64).collect())
    }

    /// Minimum IoU gate (index 0).
    pub fn min(&self) -> f64 {
        self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.0.iter()
    }
}

impl Default for IouThresholds {
    fn default() -> Self {
        Self::coco()
    }
}

impl TryFrom<Vec<f64>> for IouThresholds {
    type Error = EvalError;

    fn try_from(value: Vec<f64>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<IouThresholds> for Vec<f64> {
    fn from(value: IouThresholds) -> Self {
        value.0
    }
}

/// Validate that a threshold is in the valid range [0.0, 1.0].
pub fn validate_threshold(threshold: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(EvalError::InvalidThreshold(format!(
            "Threshold must be between 0.0 and 1.0, got {}",
            threshold
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_thresholds() {
        let iouv = IouThresholds::coco();
        assert_eq!(iouv.len(), 10);
        assert!((iouv.min() - 0.5).abs() < 1e-12);
        assert!((iouv.as_slice()[9] - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_thresholds_must_be_ascending() {
        assert!(IouThresholds::new(vec![0.5, 0.55]).is_ok());
        assert!(IouThresholds::new(vec![0.75, 0.5]).is_err());
        assert!(IouThresholds::new(vec![]).is_err());
        assert!(IouThresholds::new(vec![0.5, 1.2]).is_err());
    }

    #[test]
    fn test_thresholds_deserialize_validates() {
        let ok: IouThresholds = serde_json::from_str("[0.5, 0.75]").unwrap();
        assert_eq!(ok.len(), 2);
        assert!(serde_json::from_str::<IouThresholds>("[0.9, 0.5]").is_err());
    }
}
