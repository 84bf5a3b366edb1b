//! Core data types shared by the matcher, the stat recorder and the aggregator.

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};
use crate::mask::Prototypes;

/// Axis-aligned bounding box in corner form (x1, y1, x2, y2).
///
/// Coordinates are pixels in model-input space unless stated otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    /// Create a new bounding box from its corners.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build a box from its top-left corner, width and height.
    pub fn from_xywh(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    /// Build a box from its centre, width and height.
    pub fn from_center(x_center: f64, y_center: f64, width: f64, height: f64) -> Self {
        Self::new(
            x_center - width / 2.0,
            y_center - height / 2.0,
            x_center + width / 2.0,
            y_center + height / 2.0,
        )
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Area of the box; zero for degenerate or inverted boxes.
    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Top-left xywh form.
    pub fn to_xywh(&self) -> [f64; 4] {
        [self.x1, self.y1, self.width(), self.height()]
    }

    /// Centre xywh form.
    pub fn to_center_xywh(&self) -> [f64; 4] {
        [
            (self.x1 + self.x2) / 2.0,
            (self.y1 + self.y2) / 2.0,
            self.width(),
            self.height(),
        ]
    }

    /// Check that all coordinates are finite and the box has positive extent.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite())
            && self.width() > 0.0
            && self.height() > 0.0
    }

    /// Clamp the box to an image of the given size.
    pub fn clip(&self, width: f64, height: f64) -> Self {
        Self::new(
            self.x1.clamp(0.0, width),
            self.y1.clamp(0.0, height),
            self.x2.clamp(0.0, width),
            self.y2.clamp(0.0, height),
        )
    }
}

/// A single prediction after non-max suppression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub class_id: usize,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f64, class_id: usize) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
        }
    }
}

/// A ground-truth object in model-input pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthLabel {
    pub class_id: usize,
    pub bbox: BoundingBox,
}

impl GroundTruthLabel {
    pub fn new(class_id: usize, bbox: BoundingBox) -> Self {
        Self { class_id, bbox }
    }
}

/// A label row as yielded by the dataset: `(image, class, xc, yc, w, h)`,
/// box normalized to [0, 1] relative to the batch input size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRow {
    pub image_index: usize,
    pub class_id: usize,
    pub x_center: f64,
    pub y_center: f64,
    pub width: f64,
    pub height: f64,
}

impl LabelRow {
    pub fn new(
        image_index: usize,
        class_id: usize,
        x_center: f64,
        y_center: f64,
        width: f64,
        height: f64,
    ) -> Self {
        Self {
            image_index,
            class_id,
            x_center,
            y_center,
            width,
            height,
        }
    }

    /// Scale the normalized row to pixels and convert to corner form.
    pub fn to_ground_truth(&self, input_width: f64, input_height: f64) -> GroundTruthLabel {
        GroundTruthLabel::new(
            self.class_id,
            BoundingBox::from_center(
                self.x_center * input_width,
                self.y_center * input_height,
                self.width * input_width,
                self.height * input_height,
            ),
        )
    }

    /// Reject rows with non-finite or negative geometry.
    pub fn validate(&self) -> Result<()> {
        let geometry = [self.x_center, self.y_center, self.width, self.height];
        if geometry.iter().any(|v| !v.is_finite()) {
            return Err(EvalError::InvalidLabel(format!(
                "non-finite coordinates in label for image {}",
                self.image_index
            )));
        }
        if self.width < 0.0 || self.height < 0.0 {
            return Err(EvalError::InvalidLabel(format!(
                "negative dimensions in label for image {}",
                self.image_index
            )));
        }
        Ok(())
    }
}

/// Original image geometry, used to undo letterboxing when exporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageShape {
    /// Original (height, width) in pixels.
    pub original: (u32, u32),
    /// `((gain_h, gain_w), (pad_w, pad_h))` applied by the loader, if known.
    pub ratio_pad: Option<((f64, f64), (f64, f64))>,
}

impl ImageShape {
    pub fn new(height: u32, width: u32) -> Self {
        Self {
            original: (height, width),
            ratio_pad: None,
        }
    }

    /// Map a box from model-input space back to the original image.
    ///
    /// Without a recorded `ratio_pad` the letterbox is recomputed from the
    /// input size the same way the loader builds it.
    pub fn scale_to_original(&self, bbox: &BoundingBox, input_size: (u32, u32)) -> BoundingBox {
        let (h0, w0) = (f64::from(self.original.0), f64::from(self.original.1));
        let (gain, pad) = match self.ratio_pad {
            Some(((gain, _), pad)) => (gain, pad),
            None => {
                let (ih, iw) = (f64::from(input_size.0), f64::from(input_size.1));
                let gain = (ih / h0).min(iw / w0);
                (gain, ((iw - w0 * gain) / 2.0, (ih - h0 * gain) / 2.0))
            }
        };
        if gain <= 0.0 {
            return bbox.clip(w0, h0);
        }
        BoundingBox::new(
            (bbox.x1 - pad.0) / gain,
            (bbox.y1 - pad.1) / gain,
            (bbox.x2 - pad.0) / gain,
            (bbox.y2 - pad.1) / gain,
        )
        .clip(w0, h0)
    }
}

/// Output of inference + NMS for one image.
#[derive(Debug, Clone, Default)]
pub struct ImagePredictions {
    pub detections: Vec<Detection>,
    /// Mask coefficients, one vector per detection, when a mask head is present.
    pub mask_coefficients: Option<Vec<Vec<f32>>>,
    /// Mask prototypes for this image, when a mask head is present.
    pub prototypes: Option<Prototypes>,
}

impl ImagePredictions {
    /// Box-only predictions.
    pub fn boxes(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            mask_coefficients: None,
            prototypes: None,
        }
    }

    /// Predictions carrying a mask head output.
    pub fn with_masks(
        detections: Vec<Detection>,
        coefficients: Vec<Vec<f32>>,
        prototypes: Prototypes,
    ) -> Self {
        Self {
            detections,
            mask_coefficients: Some(coefficients),
            prototypes: Some(prototypes),
        }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Boolean matrix with one row per detection and one column per IoU threshold.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CorrectnessMatrix {
    rows: usize,
    cols: usize,
    data: Vec<bool>,
}

impl CorrectnessMatrix {
    /// All-false matrix of the given shape.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![false; rows * cols],
        }
    }

    /// Build from row vectors; every row must have `cols` entries.
    pub fn from_rows(rows: Vec<Vec<bool>>, cols: usize) -> Result<Self> {
        let n = rows.len();
        let mut data = Vec::with_capacity(n * cols);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != cols {
                return Err(EvalError::ShapeMismatch(format!(
                    "row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend(row);
        }
        Ok(Self {
            rows: n,
            cols,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: bool) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[bool] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// True if any detection is correct at any threshold.
    pub fn any(&self) -> bool {
        self.data.iter().any(|&v| v)
    }

    /// Number of correct detections at threshold column `col`.
    pub fn count_column(&self, col: usize) -> usize {
        (0..self.rows).filter(|&r| self.get(r, col)).count()
    }

    /// Stack matrices vertically. All inputs must share the column count.
    pub fn concat<'a, I>(matrices: I, cols: usize) -> Result<Self>
    where
        I: IntoIterator<Item = &'a CorrectnessMatrix>,
    {
        let mut out = Self::zeros(0, cols);
        for m in matrices {
            if m.cols != cols && m.rows > 0 {
                return Err(EvalError::ShapeMismatch(format!(
                    "cannot stack a matrix with {} columns onto {}",
                    m.cols, cols
                )));
            }
            out.data.extend_from_slice(&m.data);
            out.rows += m.rows;
        }
        Ok(out)
    }

    /// Rows selected by `indices`, in that order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Self {
            rows: indices.len(),
            cols: self.cols,
            data,
        }
    }
}

/// Per-image milliseconds for the three timed stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Speed {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub nms_ms: f64,
}

impl Speed {
    pub fn as_tuple(&self) -> (f64, f64, f64) {
        (self.preprocess_ms, self.inference_ms, self.nms_ms)
    }
}
