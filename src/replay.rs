//! Inference provider that replays detections saved as text files.
//!
//! Lets a finished model's predictions be evaluated offline: "preprocess"
//! reads each image's prediction file, "forward" hands the detections on
//! unchanged and NMS runs the reference suppression per image.

use log::debug;

use crate::error::Result;
use crate::evaluator::InferenceProvider;
use crate::loader::{read_predictions, ImageEntry};
use crate::nms::{apply_nms, NmsParams};
use crate::types::{Detection, ImagePredictions};

#[derive(Debug, Clone)]
pub struct ReplayModel {
    input_size: (u32, u32),
    inference_mode: bool,
}

impl ReplayModel {
    /// `input_size` is `(height, width)`, the size prediction files are normalized by.
    pub fn new(input_size: (u32, u32)) -> Self {
        Self {
            input_size,
            inference_mode: false,
        }
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }
}

impl InferenceProvider for ReplayModel {
    type Images = Vec<ImageEntry>;
    type Prepared = Vec<Vec<Detection>>;
    type Raw = Vec<Vec<Detection>>;

    fn preprocess(&mut self, images: &Vec<ImageEntry>) -> Result<Vec<Vec<Detection>>> {
        images
            .iter()
            .map(|entry| match &entry.prediction_path {
                Some(path) => read_predictions(path, self.input_size),
                None => Ok(Vec::new()),
            })
            .collect()
    }

    fn forward(&mut self, input: &Vec<Vec<Detection>>) -> Result<Vec<Vec<Detection>>> {
        Ok(input.clone())
    }

    fn nms(&mut self, raw: &Vec<Vec<Detection>>, params: &NmsParams) -> Result<Vec<ImagePredictions>> {
        raw.iter()
            .map(|detections| {
                let kept = apply_nms(detections, params)?;
                debug!("nms kept {} of {} detections", kept.len(), detections.len());
                Ok(ImagePredictions::boxes(kept))
            })
            .collect()
    }

    fn set_inference_mode(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.inference_mode, enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_replay_reads_and_suppresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(
            &path,
            "0 0.5 0.5 0.2 0.2 0.9\n0 0.5 0.5 0.2 0.2 0.8\n1 0.1 0.1 0.1 0.1 0.0005\n",
        )
        .unwrap();

        let entries = vec![
            ImageEntry {
                stem: "a".to_string(),
                label_path: None,
                prediction_path: Some(path),
            },
            ImageEntry {
                stem: "b".to_string(),
                label_path: Some(PathBuf::from("b.txt")),
                prediction_path: None,
            },
        ];

        let mut model = ReplayModel::new((100, 100));
        let prepared = model.preprocess(&entries).unwrap();
        assert_eq!(prepared[0].len(), 3);
        assert!(prepared[1].is_empty());

        let raw = model.forward(&prepared).unwrap();
        let out = model.nms(&raw, &NmsParams::default()).unwrap();
        assert_eq!(out.len(), 2);
        // duplicate suppressed, low-confidence box gated
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[0].detections[0].confidence, 0.9);
        assert!(out[1].is_empty());
    }

    #[test]
    fn test_inference_mode_toggle() {
        let mut model = ReplayModel::new((640, 640));
        assert!(!model.set_inference_mode(true));
        assert!(model.set_inference_mode(false));
    }
}
