//! Persisted outputs: per-image label text files and COCO JSON records.
//!
//! Boxes are mapped back to the original image (letterbox undone) before
//! they are written.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Detection, ImageShape};

const COCO80_TO_COCO91: [usize; 80] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 27, 28,
    31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 46, 47, 48, 49, 50, 51, 52, 53, 54, 55,
    56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 67, 70, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 84,
    85, 86, 87, 88, 89, 90,
];

/// Category ids of the 91-id COCO paper numbering, indexed by 80-class id.
pub fn coco80_to_coco91_class() -> &'static [usize] {
    &COCO80_TO_COCO91
}

/// COCO image id: the file stem as a number when it is numeric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageId {
    Numeric(u64),
    Name(String),
}

impl ImageId {
    pub fn from_path(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !stem.is_empty() && stem.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(id) = stem.parse() {
                return ImageId::Numeric(id);
            }
        }
        ImageId::Name(stem)
    }
}

/// One detection in COCO results format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRecord {
    pub image_id: ImageId,
    pub category_id: usize,
    /// `[x, y, width, height]`, top-left corner, original image pixels.
    pub bbox: [f64; 4],
    pub score: f64,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// COCO records for one image.
///
/// `category_id` maps class indices to dataset category ids.
pub fn json_records<F>(
    detections: &[Detection],
    path: &Path,
    shape: &ImageShape,
    input_size: (u32, u32),
    category_id: F,
) -> Vec<JsonRecord>
where
    F: Fn(usize) -> usize,
{
    let image_id = ImageId::from_path(path);
    detections
        .iter()
        .map(|d| {
            let native = shape.scale_to_original(&d.bbox, input_size);
            let [x, y, w, h] = native.to_xywh();
            JsonRecord {
                image_id: image_id.clone(),
                category_id: category_id(d.class_id),
                bbox: [round_to(x, 3), round_to(y, 3), round_to(w, 3), round_to(h, 3)],
                score: round_to(d.confidence, 5),
            }
        })
        .collect()
}

/// Write all records as one JSON array.
pub fn write_json(records: &[JsonRecord], path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, records)?;
    writer.flush()?;
    Ok(())
}

/// Format like C's `%g`: six significant digits, trailing zeros removed.
pub fn format_g(value: f64) -> String {
    format_significant(value, 6)
}

/// Format like C's `%.{digits}g`.
pub fn format_significant(value: f64, digits: usize) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{}", if value == 0.0 { 0.0 } else { value });
    }
    let digits = digits.max(1) as i32;
    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= digits {
        let s = format!("{:.*e}", (digits - 1) as usize, value);
        return match s.split_once('e') {
            Some((mantissa, exp)) => format!("{}e{}", trim_zeros(mantissa), exp),
            None => s,
        };
    }
    let decimals = (digits - 1 - exponent).max(0) as usize;
    trim_zeros(&format!("{:.*}", decimals, value)).to_string()
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Lines `class xc yc w h [conf]`, normalized by the original image size.
pub fn txt_lines(
    detections: &[Detection],
    shape: &ImageShape,
    input_size: (u32, u32),
    save_conf: bool,
) -> Vec<String> {
    let (h0, w0) = (f64::from(shape.original.0), f64::from(shape.original.1));
    detections
        .iter()
        .map(|d| {
            let native = shape.scale_to_original(&d.bbox, input_size);
            let [xc, yc, w, h] = native.to_center_xywh();
            let mut fields = vec![
                d.class_id.to_string(),
                format_g(xc / w0),
                format_g(yc / h0),
                format_g(w / w0),
                format_g(h / h0),
            ];
            if save_conf {
                fields.push(format_g(d.confidence));
            }
            fields.join(" ")
        })
        .collect()
}

/// Append one image's detections to its label file.
pub fn save_one_txt(
    detections: &[Detection],
    shape: &ImageShape,
    input_size: (u32, u32),
    save_conf: bool,
    path: &Path,
) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in txt_lines(detections, shape, input_size, save_conf) {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}
