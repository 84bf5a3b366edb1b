//! # det-eval
//!
//! Detection-quality evaluation for object detectors and instance segmenters.
//!
//! Predictions are matched to ground truth across a vector of IoU thresholds
//! (COCO default: 0.50 to 0.95), and the per-detection correctness is
//! aggregated into:
//! - **Precision** and **Recall** at the max-F1 operating point
//! - **mAP@0.5** and **mAP@0.5:0.95** per class and overall
//! - a **confusion matrix** with a background class
//!
//! ## Features
//!
//! - Greedy one-to-one matching for boxes and instance masks
//! - Per-class AP with a monotone precision envelope and 101-point integration
//! - A single-pass [`Evaluator`] driving any [`InferenceProvider`]
//! - YOLO text label/prediction loading and offline replay
//! - Label text and COCO JSON export
//!
//! ## Quick Start
//!
//! ```rust
//! use det_eval::matching::match_boxes;
//! use det_eval::threshold::IouThresholds;
//! use det_eval::types::{BoundingBox, Detection, GroundTruthLabel};
//!
//! let detections = vec![Detection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9, 0)];
//! let labels = vec![GroundTruthLabel::new(0, BoundingBox::new(0.0, 0.0, 10.0, 9.0))];
//!
//! let correct = match_boxes(&detections, &labels, &IouThresholds::coco());
//! assert!(correct.get(0, 0)); // IoU 0.9 passes 0.50
//! assert!(!correct.get(0, 9)); // but not 0.95
//! ```
//!
//! ## File format
//!
//! One text file per image, one object per line, normalized coordinates:
//!
//! ```text
//! # labels/000000000139.txt
//! 0 0.512 0.433 0.120 0.310
//! # predictions/000000000139.txt
//! 0 0.510 0.430 0.118 0.305 0.91
//! ```

pub mod error;
pub mod types;
pub mod mask;
pub mod threshold;
pub mod metrics;
pub mod matching;
pub mod nms;
pub mod stats;
pub mod aggregate;
pub mod confusion;
pub mod config;
pub mod export;
pub mod plotting;
pub mod report;
pub mod evaluator;
pub mod loader;
pub mod replay;

// Re-export commonly used types and functions
pub use aggregate::{ap_per_class, EvalMetric, Metric};
pub use config::EvalConfig;
pub use confusion::ConfusionMatrix;
pub use error::{EvalError, Result};
pub use evaluator::{Batch, Evaluator, InferenceProvider, LossFunction};
pub use matching::{match_boxes, match_masks};
pub use report::EvalReport;
pub use stats::{record_image, StatsBuffer};
pub use threshold::IouThresholds;
pub use types::{BoundingBox, CorrectnessMatrix, Detection, GroundTruthLabel, Speed};
