//! Instance masks: reconstruction from prototype outputs, cropping and resizing.
//!
//! A segmentation head emits a small stack of prototype masks per image plus one
//! coefficient vector per detection. A detection's mask is the sigmoid of the
//! coefficient-weighted sum of prototypes, cropped to the detection box and
//! binarized at 0.5.
//!
//! Masks are stored row-major as `f32`. Predicted masks are binary; ground-truth
//! masks may become fractional after bilinear resizing, which the mask IoU
//! handles as soft pixel weights.

use crate::error::{EvalError, Result};
use crate::types::BoundingBox;

/// Pixels strictly above this value are foreground.
pub const MASK_THRESHOLD: f32 = 0.5;

/// A single-channel mask of `height x width` pixels, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl Mask {
    pub fn new(height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != height * width {
            return Err(EvalError::ShapeMismatch(format!(
                "mask of {}x{} needs {} pixels, got {}",
                height,
                width,
                height * width,
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            data: vec![0.0; height * width],
        }
    }

    /// Build a binary mask from a rectangle of foreground pixels (`[x1, x2) x [y1, y2)`).
    pub fn from_rect(height: usize, width: usize, bbox: &BoundingBox) -> Self {
        let mut mask = Self {
            height,
            width,
            data: vec![1.0; height * width],
        };
        mask.crop(bbox);
        mask
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn get(&self, y: usize, x: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Flattened pixel values.
    pub fn pixels(&self) -> &[f32] {
        &self.data
    }

    /// Sum of pixel values (the foreground count for binary masks).
    pub fn area(&self) -> f64 {
        self.data.iter().map(|&v| f64::from(v)).sum()
    }

    /// Zero every pixel whose column is outside `[x1, x2)` or row outside `[y1, y2)`.
    pub fn crop(&mut self, bbox: &BoundingBox) {
        for y in 0..self.height {
            let row_inside = (y as f64) >= bbox.y1 && (y as f64) < bbox.y2;
            for x in 0..self.width {
                let inside = row_inside && (x as f64) >= bbox.x1 && (x as f64) < bbox.x2;
                if !inside {
                    self.data[y * self.width + x] = 0.0;
                }
            }
        }
    }

    /// Binarize in place: 1.0 above [`MASK_THRESHOLD`], 0.0 otherwise.
    pub fn binarize(&mut self) {
        for v in &mut self.data {
            *v = if *v > MASK_THRESHOLD { 1.0 } else { 0.0 };
        }
    }

    /// Bilinear resize using half-pixel centres (no corner alignment).
    pub fn resize_bilinear(&self, height: usize, width: usize) -> Mask {
        if (height, width) == self.shape() {
            return self.clone();
        }
        if self.height == 0 || self.width == 0 {
            return Mask::zeros(height, width);
        }

        let scale_y = self.height as f64 / height as f64;
        let scale_x = self.width as f64 / width as f64;
        let xs: Vec<(usize, usize, f32)> = (0..width)
            .map(|x| source_index(x, scale_x, self.width))
            .collect();

        let mut data = Vec::with_capacity(height * width);
        for y in 0..height {
            let (y0, y1, ly) = source_index(y, scale_y, self.height);
            for &(x0, x1, lx) in &xs {
                let top = self.get(y0, x0) * (1.0 - lx) + self.get(y0, x1) * lx;
                let bottom = self.get(y1, x0) * (1.0 - lx) + self.get(y1, x1) * lx;
                data.push(top * (1.0 - ly) + bottom * ly);
            }
        }
        Mask {
            height,
            width,
            data,
        }
    }
}

fn source_index(dst: usize, scale: f64, len: usize) -> (usize, usize, f32) {
    let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
    let i0 = (src.floor() as usize).min(len - 1);
    let i1 = (i0 + 1).min(len - 1);
    (i0, i1, (src - i0 as f64) as f32)
}

/// Prototype masks emitted by a segmentation head for one image, `(channels, height, width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prototypes {
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl Prototypes {
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != channels * height * width {
            return Err(EvalError::ShapeMismatch(format!(
                "prototypes of {}x{}x{} need {} values, got {}",
                channels,
                height,
                width,
                channels * height * width,
                data.len()
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Soft mask `sigmoid(coefficients · prototypes)` at prototype resolution.
    pub fn assemble(&self, coefficients: &[f32]) -> Result<Mask> {
        if coefficients.len() != self.channels {
            return Err(EvalError::ShapeMismatch(format!(
                "{} mask coefficients for {} prototype channels",
                coefficients.len(),
                self.channels
            )));
        }
        let plane = self.height * self.width;
        let mut data = vec![0.0f32; plane];
        for (c, &weight) in coefficients.iter().enumerate() {
            let channel = &self.data[c * plane..(c + 1) * plane];
            for (out, &v) in data.iter_mut().zip(channel) {
                *out += weight * v;
            }
        }
        for v in &mut data {
            *v = 1.0 / (1.0 + (-*v).exp());
        }
        Mask::new(self.height, self.width, data)
    }
}

/// Masks at prototype resolution, cropped to boxes given in input space of size `shape`.
pub fn process_mask(
    prototypes: &Prototypes,
    coefficients: &[Vec<f32>],
    boxes: &[BoundingBox],
    shape: (usize, usize),
) -> Result<Vec<Mask>> {
    check_lengths(coefficients, boxes)?;
    let (mh, mw) = prototypes.shape();
    let (ih, iw) = shape;
    let sx = mw as f64 / iw.max(1) as f64;
    let sy = mh as f64 / ih.max(1) as f64;

    coefficients
        .iter()
        .zip(boxes)
        .map(|(coeffs, bbox)| {
            let mut mask = prototypes.assemble(coeffs)?;
            let scaled = BoundingBox::new(bbox.x1 * sx, bbox.y1 * sy, bbox.x2 * sx, bbox.y2 * sy);
            mask.crop(&scaled);
            mask.binarize();
            Ok(mask)
        })
        .collect()
}

/// Masks upsampled to `shape` before cropping, for full-resolution output.
pub fn process_mask_upsample(
    prototypes: &Prototypes,
    coefficients: &[Vec<f32>],
    boxes: &[BoundingBox],
    shape: (usize, usize),
) -> Result<Vec<Mask>> {
    check_lengths(coefficients, boxes)?;
    coefficients
        .iter()
        .zip(boxes)
        .map(|(coeffs, bbox)| {
            let mut mask = prototypes.assemble(coeffs)?.resize_bilinear(shape.0, shape.1);
            mask.crop(bbox);
            mask.binarize();
            Ok(mask)
        })
        .collect()
}

fn check_lengths(coefficients: &[Vec<f32>], boxes: &[BoundingBox]) -> Result<()> {
    if coefficients.len() != boxes.len() {
        return Err(EvalError::ShapeMismatch(format!(
            "{} coefficient vectors for {} boxes",
            coefficients.len(),
            boxes.len()
        )));
    }
    Ok(())
}
