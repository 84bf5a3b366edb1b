//! Metrics calculation modules.

pub mod iou;
pub mod ap;
pub mod precision_recall;
pub mod f1_score;

pub use iou::{box_iou, box_iou_matrix, mask_iou_matrix};
pub use ap::{calculate_ap, calculate_map};
pub use precision_recall::{calculate_precision_recall_curve, PrecisionRecallCurve};
pub use f1_score::calculate_f1_score;
