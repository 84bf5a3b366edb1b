//! Error handling tests: invalid configuration, malformed files and
//! collaborator failures.

use std::path::PathBuf;
use std::sync::Arc;

use det_eval::error::{EvalError, Result};
use det_eval::evaluator::{Batch, Evaluator, InferenceProvider, LossFunction};
use det_eval::loader::{parse_label_line, read_labels, read_predictions, FileDataset};
use det_eval::mask::Mask;
use det_eval::nms::NmsParams;
use det_eval::threshold::IouThresholds;
use det_eval::types::{ImagePredictions, ImageShape, LabelRow};
use det_eval::EvalConfig;

/// Provider that fails at a configurable stage.
struct Faulty {
    fail_forward: bool,
    images_out: usize,
}

impl InferenceProvider for Faulty {
    type Images = ();
    type Prepared = ();
    type Raw = ();

    fn preprocess(&mut self, _images: &()) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _input: &()) -> Result<()> {
        if self.fail_forward {
            return Err(EvalError::Inference("device lost".to_string()));
        }
        Ok(())
    }

    fn nms(&mut self, _raw: &(), _params: &NmsParams) -> Result<Vec<ImagePredictions>> {
        Ok(vec![ImagePredictions::default(); self.images_out])
    }
}

struct TwoTermLoss;

impl LossFunction<()> for TwoTermLoss {
    fn compute(&mut self, _raw: &(), _labels: &[LabelRow], _masks: Option<&[Mask]>) -> Result<Vec<f64>> {
        Ok(vec![0.1, 0.2])
    }
}

fn unit_batch() -> Result<Batch<()>> {
    Ok(Batch {
        images: Arc::new(()),
        input_size: (64, 64),
        labels: Vec::new(),
        paths: vec![PathBuf::from("a.jpg")],
        shapes: vec![ImageShape::new(64, 64)],
        masks: None,
    })
}

fn config() -> EvalConfig {
    EvalConfig {
        nc: Some(1),
        plots: false,
        ..EvalConfig::default()
    }
}

#[test]
fn test_invalid_config_rejected() {
    let missing_classes = EvalConfig::default();
    assert!(matches!(Evaluator::new(missing_classes), Err(EvalError::InvalidConfig(_))));

    let bad_conf = EvalConfig {
        conf_thres: 1.5,
        ..config()
    };
    assert!(matches!(Evaluator::new(bad_conf), Err(EvalError::InvalidThreshold(_))));

    let export_without_dir = EvalConfig {
        save_json: true,
        ..config()
    };
    assert!(Evaluator::new(export_without_dir).is_err());

    let name_count = EvalConfig {
        nc: Some(2),
        names: vec!["a".to_string()],
        ..config()
    };
    assert!(Evaluator::new(name_count).is_err());
}

#[test]
fn test_invalid_thresholds() {
    assert!(matches!(IouThresholds::new(vec![]), Err(EvalError::InvalidThreshold(_))));
    assert!(IouThresholds::new(vec![0.9, 0.5]).is_err());
    assert!(IouThresholds::new(vec![-0.1]).is_err());
}

#[test]
fn test_toml_errors() {
    assert!(matches!(EvalConfig::from_toml_str("nc = \"three\""), Err(EvalError::Toml(_))));
    assert!(matches!(
        EvalConfig::from_toml_str("nc = 2\niou_thresholds = [0.9, 0.5]"),
        Err(EvalError::Toml(_))
    ));
    assert!(matches!(
        EvalConfig::from_toml_str("nc = 2\nmask_downsample_ratio = 0"),
        Err(EvalError::InvalidConfig(_))
    ));
    let missing = EvalConfig::load(std::path::Path::new("/nonexistent/det-eval.toml"));
    assert!(matches!(missing, Err(EvalError::Io(_))));
}

#[test]
fn test_inference_failure_aborts_run() {
    let mut model = Faulty {
        fail_forward: true,
        images_out: 1,
    };
    let result = Evaluator::new(config()).unwrap().run(&mut model, vec![unit_batch()], None, None);
    match result {
        Err(EvalError::Inference(message)) => assert!(message.contains("device lost")),
        other => panic!("expected inference error, got {:?}", other.map(|r| r.seen)),
    }
}

#[test]
fn test_nms_output_length_checked() {
    let mut model = Faulty {
        fail_forward: false,
        images_out: 2,
    };
    let result = Evaluator::new(config()).unwrap().run(&mut model, vec![unit_batch()], None, None);
    assert!(matches!(result, Err(EvalError::Inference(_))));
}

#[test]
fn test_dataset_failure_aborts_run() {
    let mut model = Faulty {
        fail_forward: false,
        images_out: 1,
    };
    let dataset = vec![unit_batch(), Err(EvalError::Dataset("corrupt image".to_string()))];
    let result = Evaluator::new(config()).unwrap().run(&mut model, dataset, None, None);
    assert!(matches!(result, Err(EvalError::Dataset(_))));
}

#[test]
fn test_batch_shape_count_checked() {
    let mut model = Faulty {
        fail_forward: false,
        images_out: 1,
    };
    let mut batch = unit_batch().unwrap();
    batch.shapes.clear();
    let result = Evaluator::new(config()).unwrap().run(&mut model, vec![Ok(batch)], None, None);
    assert!(matches!(result, Err(EvalError::Dataset(_))));
}

#[test]
fn test_invalid_label_row_rejected() {
    let mut model = Faulty {
        fail_forward: false,
        images_out: 1,
    };
    let mut batch = unit_batch().unwrap();
    batch.labels.push(LabelRow::new(0, 0, f64::NAN, 0.5, 0.1, 0.1));
    let result = Evaluator::new(config()).unwrap().run(&mut model, vec![Ok(batch)], None, None);
    assert!(matches!(result, Err(EvalError::InvalidLabel(_))));
}

#[test]
fn test_loss_term_count_checked() {
    let mut model = Faulty {
        fail_forward: false,
        images_out: 1,
    };
    let mut loss = TwoTermLoss;
    let result = Evaluator::new(config())
        .unwrap()
        .run(&mut model, vec![unit_batch()], Some(&mut loss), None);
    assert!(matches!(result, Err(EvalError::ShapeMismatch(_))));
}

#[test]
fn test_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let labels = dir.path().join("labels.txt");
    std::fs::write(&labels, "0 0.5 0.5 0.1 0.1\n0 0.5 0.5 nan? 0.1\n").unwrap();
    match read_labels(&labels) {
        Err(EvalError::Parse { line, .. }) => assert_eq!(line, 2),
        other => panic!("expected parse error, got {:?}", other),
    }

    let predictions = dir.path().join("preds.txt");
    std::fs::write(&predictions, "0 0.5 0.5 0.1 0.1\n").unwrap();
    assert!(matches!(
        read_predictions(&predictions, (640, 640)),
        Err(EvalError::Parse { line: 1, .. })
    ));

    assert!(parse_label_line(std::path::Path::new("x.txt"), 1, "0 0.1 0.1 0.2").is_err());
}

#[test]
fn test_dataset_directories_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    assert!(matches!(
        FileDataset::open(dir.path(), &missing, 4, 640),
        Err(EvalError::Dataset(_))
    ));
    assert!(matches!(
        FileDataset::open(dir.path(), dir.path(), 0, 640),
        Err(EvalError::InvalidConfig(_))
    ));
}
