//! Loading utilities for YOLO-format label and prediction files.
//!
//! One text file per image, one object per line, coordinates normalized to
//! [0, 1]:
//!
//! - labels: `class xc yc w h`, or `class x1 y1 x2 y2 ...` for polygon segments
//!   (reduced to their bounding box)
//! - predictions: `class xc yc w h conf`
//!
//! A missing label file means the image has no objects.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EvalError, Result};
use crate::evaluator::Batch;
use crate::types::{BoundingBox, Detection, ImageShape, LabelRow};

/// A normalized object read from a label file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedLabel {
    pub class_id: usize,
    /// `[xc, yc, w, h]`.
    pub xywh: [f64; 4],
}

fn parse_error(path: &Path, line: usize, message: impl Into<String>) -> EvalError {
    EvalError::Parse {
        path: path.to_path_buf(),
        line,
        message: message.into(),
    }
}

fn parse_fields(path: &Path, line_no: usize, line: &str) -> Result<(usize, Vec<f64>)> {
    let mut parts = line.split_whitespace();
    let class_field = parts
        .next()
        .ok_or_else(|| parse_error(path, line_no, "empty line"))?;
    // class ids may be written as floats ("0.0") by some exporters
    let class_value: f64 = class_field
        .parse()
        .map_err(|_| parse_error(path, line_no, format!("invalid class id {:?}", class_field)))?;
    if class_value < 0.0 || class_value.fract() != 0.0 {
        return Err(parse_error(path, line_no, format!("invalid class id {:?}", class_field)));
    }

    let values = parts
        .map(|v| {
            v.parse::<f64>()
                .ok()
                .filter(|x| x.is_finite())
                .ok_or_else(|| parse_error(path, line_no, format!("invalid number {:?}", v)))
        })
        .collect::<Result<Vec<f64>>>()?;
    Ok((class_value as usize, values))
}

/// Parse one label line. `line_no` is 1-based and only used for errors.
pub fn parse_label_line(path: &Path, line_no: usize, line: &str) -> Result<NormalizedLabel> {
    let (class_id, values) = parse_fields(path, line_no, line)?;
    let xywh = match values.len() {
        4 => [values[0], values[1], values[2], values[3]],
        n if n > 4 && n % 2 == 0 => segment_to_xywh(&values),
        n => {
            return Err(parse_error(
                path,
                line_no,
                format!("expected 4 box values or an even polygon, got {} values", n),
            ))
        }
    };
    if xywh[2] < 0.0 || xywh[3] < 0.0 {
        return Err(parse_error(path, line_no, "negative box size"));
    }
    Ok(NormalizedLabel { class_id, xywh })
}

fn segment_to_xywh(points: &[f64]) -> [f64; 4] {
    let xs = points.iter().step_by(2);
    let ys = points.iter().skip(1).step_by(2);
    let (x1, x2) = xs.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let (y1, y2) = ys.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &y| (lo.min(y), hi.max(y)));
    [(x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1]
}

/// Parse one prediction line into a detection in `input_size` pixels.
pub fn parse_prediction_line(
    path: &Path,
    line_no: usize,
    line: &str,
    input_size: (u32, u32),
) -> Result<Detection> {
    let (class_id, values) = parse_fields(path, line_no, line)?;
    if values.len() != 5 {
        return Err(parse_error(
            path,
            line_no,
            format!("expected `class xc yc w h conf`, got {} values", values.len() + 1),
        ));
    }
    let confidence = values[4];
    if !(0.0..=1.0).contains(&confidence) {
        return Err(parse_error(path, line_no, format!("confidence {} outside [0, 1]", confidence)));
    }
    let (h, w) = (f64::from(input_size.0), f64::from(input_size.1));
    let bbox = BoundingBox::from_center(values[0] * w, values[1] * h, values[2] * w, values[3] * h);
    Ok(Detection::new(bbox, confidence, class_id))
}

fn read_lines(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn non_empty_lines(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty())
}

/// Read a label file; a missing file yields no labels.
pub fn read_labels(path: &Path) -> Result<Vec<NormalizedLabel>> {
    match read_lines(path)? {
        Some(content) => non_empty_lines(&content)
            .map(|(n, line)| parse_label_line(path, n, line))
            .collect(),
        None => Ok(Vec::new()),
    }
}

/// Read a prediction file; a missing file yields no detections.
pub fn read_predictions(path: &Path, input_size: (u32, u32)) -> Result<Vec<Detection>> {
    match read_lines(path)? {
        Some(content) => non_empty_lines(&content)
            .map(|(n, line)| parse_prediction_line(path, n, line, input_size))
            .collect(),
        None => Ok(Vec::new()),
    }
}

/// One image known to the dataset, identified by its file stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub stem: String,
    pub label_path: Option<PathBuf>,
    pub prediction_path: Option<PathBuf>,
}

impl ImageEntry {
    /// Path used for exports (only the stem matters).
    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("{}.jpg", self.stem))
    }
}

fn txt_stems(dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut stems = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |e| e == "txt") {
            if let Some(stem) = path.file_stem() {
                stems.insert(stem.to_string_lossy().into_owned(), path);
            }
        }
    }
    Ok(stems)
}

/// Label and prediction directories paired by file stem.
///
/// Images are the union of both directories in stem order. Batches carry
/// the entries themselves as their "images".
#[derive(Debug, Clone)]
pub struct FileDataset {
    entries: Vec<ImageEntry>,
    batch_size: usize,
    input_size: (u32, u32),
}

impl FileDataset {
    pub fn open(labels_dir: &Path, predictions_dir: &Path, batch_size: usize, imgsz: u32) -> Result<Self> {
        if batch_size == 0 {
            return Err(EvalError::InvalidConfig("batch size must be at least 1".to_string()));
        }
        for dir in [labels_dir, predictions_dir] {
            if !dir.is_dir() {
                return Err(EvalError::Dataset(format!("{} is not a directory", dir.display())));
            }
        }
        let mut labels = txt_stems(labels_dir)?;
        let mut predictions = txt_stems(predictions_dir)?;
        let mut stems: Vec<String> = labels.keys().chain(predictions.keys()).cloned().collect();
        stems.sort();
        stems.dedup();

        let entries = stems
            .into_iter()
            .map(|stem| ImageEntry {
                label_path: labels.remove(&stem),
                prediction_path: predictions.remove(&stem),
                stem,
            })
            .collect();
        Ok(Self::from_entries(entries, batch_size, imgsz))
    }

    pub fn from_entries(entries: Vec<ImageEntry>, batch_size: usize, imgsz: u32) -> Self {
        Self {
            entries,
            batch_size: batch_size.max(1),
            input_size: (imgsz, imgsz),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn load_batch(&self, chunk: &[ImageEntry]) -> Result<Batch<Vec<ImageEntry>>> {
        let mut labels = Vec::new();
        for (image_index, entry) in chunk.iter().enumerate() {
            if let Some(path) = &entry.label_path {
                for label in read_labels(path)? {
                    let [xc, yc, w, h] = label.xywh;
                    labels.push(LabelRow::new(image_index, label.class_id, xc, yc, w, h));
                }
            }
        }
        let (h, w) = self.input_size;
        Ok(Batch {
            images: Arc::new(chunk.to_vec()),
            input_size: self.input_size,
            labels,
            paths: chunk.iter().map(ImageEntry::path).collect(),
            shapes: vec![ImageShape::new(h, w); chunk.len()],
            masks: None,
        })
    }
}

/// Lazily reads label files, one batch per `next`.
#[derive(Debug)]
pub struct FileBatches {
    dataset: FileDataset,
    position: usize,
}

impl Iterator for FileBatches {
    type Item = Result<Batch<Vec<ImageEntry>>>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.dataset.entries.len();
        if self.position >= total {
            return None;
        }
        let end = (self.position + self.dataset.batch_size).min(total);
        let batch = self.dataset.load_batch(&self.dataset.entries[self.position..end]);
        self.position = end;
        Some(batch)
    }
}

impl IntoIterator for FileDataset {
    type Item = Result<Batch<Vec<ImageEntry>>>;
    type IntoIter = FileBatches;

    fn into_iter(self) -> FileBatches {
        FileBatches {
            dataset: self,
            position: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_label_line() {
        let label = parse_label_line(Path::new("a.txt"), 1, "3 0.5 0.5 0.2 0.4").unwrap();
        assert_eq!(label.class_id, 3);
        assert_eq!(label.xywh, [0.5, 0.5, 0.2, 0.4]);
    }

    #[test]
    fn test_parse_segment_label() {
        let label = parse_label_line(Path::new("a.txt"), 1, "1 0.1 0.2 0.5 0.2 0.5 0.6 0.1 0.6").unwrap();
        assert_eq!(label.class_id, 1);
        assert!((label.xywh[0] - 0.3).abs() < 1e-12);
        assert!((label.xywh[1] - 0.4).abs() < 1e-12);
        assert!((label.xywh[2] - 0.4).abs() < 1e-12);
        assert!((label.xywh[3] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_parse_errors_name_the_line() {
        let err = parse_label_line(Path::new("img.txt"), 7, "0 0.5 abc 0.1 0.1").unwrap_err();
        assert!(err.to_string().contains("img.txt:7"));

        assert!(parse_label_line(Path::new("a.txt"), 1, "-1 0.5 0.5 0.1 0.1").is_err());
        assert!(parse_label_line(Path::new("a.txt"), 1, "0 0.5 0.5 0.1").is_err());
        assert!(parse_prediction_line(Path::new("a.txt"), 1, "0 0.5 0.5 0.1 0.1", (640, 640)).is_err());
        assert!(parse_prediction_line(Path::new("a.txt"), 1, "0 0.5 0.5 0.1 0.1 1.5", (640, 640)).is_err());
    }

    #[test]
    fn test_parse_prediction_line_to_pixels() {
        let det = parse_prediction_line(Path::new("a.txt"), 1, "2 0.5 0.5 0.25 0.5 0.8", (100, 200)).unwrap();
        assert_eq!(det.class_id, 2);
        assert_eq!(det.confidence, 0.8);
        assert_eq!(det.bbox, BoundingBox::new(75.0, 25.0, 125.0, 75.0));
    }

    #[test]
    fn test_missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_labels(&dir.path().join("nope.txt")).unwrap().is_empty());
        assert!(read_predictions(&dir.path().join("nope.txt"), (10, 10)).unwrap().is_empty());
    }

    #[test]
    fn test_file_dataset_pairs_by_stem() {
        let root = tempfile::tempdir().unwrap();
        let labels = root.path().join("labels");
        let preds = root.path().join("preds");
        fs::create_dir_all(&labels).unwrap();
        fs::create_dir_all(&preds).unwrap();

        let mut f = fs::File::create(labels.join("1.txt")).unwrap();
        writeln!(f, "0 0.5 0.5 0.2 0.2").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "1 0.2 0.2 0.1 0.1").unwrap();
        fs::write(labels.join("2.txt"), "").unwrap();
        fs::write(preds.join("3.txt"), "0 0.5 0.5 0.2 0.2 0.9\n").unwrap();

        let dataset = FileDataset::open(&labels, &preds, 2, 640).unwrap();
        assert_eq!(dataset.len(), 3);

        let batches: Vec<_> = dataset.into_iter().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0].labels.len(), 2);
        assert_eq!(batches[1].images[0].stem, "3");
        assert!(batches[1].images[0].label_path.is_none());
    }
}
