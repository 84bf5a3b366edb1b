//! Run configuration.
//!
//! [`EvalConfig`] is immutable once a run starts. It can be built in code,
//! deserialized from TOML (missing keys take their defaults) and is checked by
//! [`EvalConfig::validate`] before use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};
use crate::export::coco80_to_coco91_class;
use crate::nms::NmsParams;
use crate::threshold::{validate_threshold, IouThresholds};

const DEFAULT_CONF_THRES: f64 = 0.001;
const DEFAULT_IOU_THRES: f64 = 0.6;
const COCO_IOU_THRES: f64 = 0.65;
const DEFAULT_MAX_DET: usize = 300;
const DEFAULT_MAX_PLOT_BATCHES: usize = 3;
const COCO_VAL_SUFFIX: &str = "coco/val2017.txt";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Minimum confidence passed to NMS.
    pub conf_thres: f64,
    /// NMS IoU threshold (raised to 0.65 on COCO).
    pub iou_thres: f64,
    /// IoU thresholds for the correctness matrix.
    pub iou_thresholds: IouThresholds,
    pub max_det: usize,
    /// Treat the dataset as a single class.
    pub single_cls: bool,
    /// Log per-class rows in the report.
    pub verbose: bool,
    /// Confusion matrix and visualization jobs.
    pub plots: bool,
    /// Evaluate instance masks alongside boxes.
    pub mask: bool,
    pub mask_downsample_ratio: usize,
    /// Upsample predicted masks to ground-truth resolution; follows `plots` when unset.
    pub upsample_masks: Option<bool>,
    /// Number of classes; defaults to the length of `names`.
    pub nc: Option<usize>,
    pub names: Vec<String>,
    /// Validation image list, used to detect COCO.
    pub val_path: Option<PathBuf>,
    pub save_dir: Option<PathBuf>,
    pub save_txt: bool,
    pub save_conf: bool,
    pub save_json: bool,
    pub max_plot_batches: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            conf_thres: DEFAULT_CONF_THRES,
            iou_thres: DEFAULT_IOU_THRES,
            iou_thresholds: IouThresholds::coco(),
            max_det: DEFAULT_MAX_DET,
            single_cls: false,
            verbose: false,
            plots: true,
            mask: false,
            mask_downsample_ratio: 1,
            upsample_masks: None,
            nc: None,
            names: Vec::new(),
            val_path: None,
            save_dir: None,
            save_txt: false,
            save_conf: false,
            save_json: false,
            max_plot_batches: DEFAULT_MAX_PLOT_BATCHES,
        }
    }
}

impl EvalConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.conf_thres)?;
        validate_threshold(self.iou_thres)?;
        if self.mask_downsample_ratio == 0 {
            return Err(EvalError::InvalidConfig(
                "mask_downsample_ratio must be at least 1".to_string(),
            ));
        }
        if self.max_det == 0 {
            return Err(EvalError::InvalidConfig("max_det must be at least 1".to_string()));
        }
        if let Some(nc) = self.nc {
            if !self.names.is_empty() && self.names.len() != nc {
                return Err(EvalError::InvalidConfig(format!(
                    "{} class names for nc = {}",
                    self.names.len(),
                    nc
                )));
            }
        }
        if !self.single_cls && self.num_classes() == 0 {
            return Err(EvalError::InvalidConfig(
                "set nc or names (or single_cls)".to_string(),
            ));
        }
        if (self.save_txt || self.save_json) && self.save_dir.is_none() {
            return Err(EvalError::InvalidConfig(
                "save_txt and save_json need a save_dir".to_string(),
            ));
        }
        Ok(())
    }

    /// Class count used for the confusion matrix and dense maps.
    pub fn num_classes(&self) -> usize {
        if self.single_cls {
            1
        } else {
            self.nc.unwrap_or(self.names.len())
        }
    }

    /// True when the validation list is the COCO val2017 split.
    pub fn is_coco(&self) -> bool {
        self.val_path
            .as_ref()
            .map_or(false, |p| p.to_string_lossy().ends_with(COCO_VAL_SUFFIX))
    }

    pub fn upsample_masks(&self) -> bool {
        self.upsample_masks.unwrap_or(self.plots)
    }

    pub fn nms_params(&self) -> NmsParams {
        NmsParams {
            conf_thres: self.conf_thres,
            iou_thres: if self.is_coco() { COCO_IOU_THRES } else { self.iou_thres },
            agnostic: self.single_cls,
            max_det: self.max_det,
        }
    }

    /// Category id written to COCO JSON for a class index.
    pub fn category_id(&self, class_id: usize) -> usize {
        if self.is_coco() {
            coco80_to_coco91_class()
                .get(class_id)
                .copied()
                .unwrap_or(class_id)
        } else {
            class_id
        }
    }

    pub fn class_name(&self, class_id: usize) -> String {
        self.names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }
}
