//! Evaluation orchestrator.
//!
//! An [`Evaluator`] walks a dataset once: every batch is preprocessed, run
//! through the model and NMS, and each image is matched against its labels.
//! The collected statistics are aggregated into an [`EvalReport`] at the end.
//!
//! The run moves through [`RunPhase`]s `Idle -> Loading -> Scanning ->
//! Aggregating -> Reported`. [`Evaluator::run`] consumes the evaluator, so a
//! finished run cannot be restarted.

use std::fmt;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::aggregate::aggregate;
use crate::config::EvalConfig;
use crate::confusion::ConfusionMatrix;
use crate::error::{EvalError, Result};
use crate::export::{json_records, save_one_txt, write_json, JsonRecord};
use crate::mask::Mask;
use crate::matching::MaskMatchOptions;
use crate::nms::NmsParams;
use crate::plotting::{PlotBox, PlotJob, PlotKind, PlotScheduler, Visualizer};
use crate::report::{header, EvalReport};
use crate::stats::{record_image, RecorderOptions, StatsBuffer};
use crate::types::{GroundTruthLabel, ImagePredictions, ImageShape, LabelRow, Speed};

/// Model plus NMS, split into the three timed stages.
pub trait InferenceProvider {
    /// Batch of input images as produced by the dataset.
    type Images: Send + Sync + 'static;
    /// Normalized model input.
    type Prepared;
    /// Raw model output, also handed to the loss function.
    type Raw;

    fn preprocess(&mut self, images: &Self::Images) -> Result<Self::Prepared>;

    fn forward(&mut self, input: &Self::Prepared) -> Result<Self::Raw>;

    /// Per-image detections, one entry per image of the batch.
    fn nms(&mut self, raw: &Self::Raw, params: &NmsParams) -> Result<Vec<ImagePredictions>>;

    /// Switch inference-only mode; returns the previous mode.
    fn set_inference_mode(&mut self, enabled: bool) -> bool {
        let _ = enabled;
        false
    }
}

/// Loss signal computed from raw model output. Only accumulated, never optimized.
pub trait LossFunction<R> {
    /// Loss terms (box, obj, cls and, with masks, seg) for one batch.
    fn compute(&mut self, raw: &R, labels: &[LabelRow], masks: Option<&[Mask]>) -> Result<Vec<f64>>;
}

/// One dataset batch.
#[derive(Debug, Clone)]
pub struct Batch<I> {
    pub images: Arc<I>,
    /// Model input `(height, width)` in pixels.
    pub input_size: (u32, u32),
    /// Normalized label rows for every image of the batch.
    pub labels: Vec<LabelRow>,
    pub paths: Vec<PathBuf>,
    pub shapes: Vec<ImageShape>,
    /// One ground-truth mask per label row, when masks are evaluated.
    pub masks: Option<Vec<Mask>>,
}

impl<I> Batch<I> {
    /// Number of images.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Indices of the label rows that belong to image `index`.
    pub fn label_indices(&self, index: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, row)| row.image_index == index)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Keeps a provider in inference mode; the previous mode is restored on drop.
pub struct InferenceModeGuard<'a, M: InferenceProvider + ?Sized> {
    model: &'a mut M,
    previous: bool,
}

impl<'a, M: InferenceProvider + ?Sized> InferenceModeGuard<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        let previous = model.set_inference_mode(true);
        Self { model, previous }
    }
}

impl<M: InferenceProvider + ?Sized> Deref for InferenceModeGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: InferenceProvider + ?Sized> DerefMut for InferenceModeGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: InferenceProvider + ?Sized> Drop for InferenceModeGuard<'_, M> {
    fn drop(&mut self) {
        self.model.set_inference_mode(self.previous);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Loading,
    Scanning,
    Aggregating,
    Reported,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Loading => "loading",
            RunPhase::Scanning => "scanning",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Reported => "reported",
        };
        f.write_str(name)
    }
}

/// Accumulator threaded through the scan loop.
struct ScanState {
    stats: StatsBuffer,
    seen: usize,
    batches: usize,
    /// Preprocess, inference and NMS time.
    dt: [Duration; 3],
    loss: Vec<f64>,
    confusion: Option<ConfusionMatrix>,
    json: Vec<JsonRecord>,
    plots: PlotScheduler,
}

/// Single-use evaluation run.
#[derive(Debug)]
pub struct Evaluator {
    config: EvalConfig,
    phase: RunPhase,
}

impl Evaluator {
    /// Validate `config` and create an idle run.
    pub fn new(config: EvalConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            phase: RunPhase::Idle,
        })
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!("evaluation {} -> {}", self.phase, phase);
        self.phase = phase;
    }

    fn recorder_options(&self) -> RecorderOptions {
        RecorderOptions {
            thresholds: self.config.iou_thresholds.clone(),
            single_cls: self.config.single_cls,
            with_masks: self.config.mask,
            mask: MaskMatchOptions {
                upsample: self.config.upsample_masks(),
                downsample_ratio: self.config.mask_downsample_ratio,
            },
        }
    }

    fn expected_loss_terms(&self) -> usize {
        if self.config.mask {
            4
        } else {
            3
        }
    }

    /// Run the evaluation over `dataset`.
    ///
    /// Inference and dataset errors abort the run, as does a mask presence
    /// mismatch. Visualization jobs are joined before this returns.
    pub fn run<M, D>(
        mut self,
        model: &mut M,
        dataset: D,
        mut loss: Option<&mut dyn LossFunction<M::Raw>>,
        visualizer: Option<Arc<dyn Visualizer<M::Images>>>,
    ) -> Result<EvalReport>
    where
        M: InferenceProvider,
        D: IntoIterator<Item = Result<Batch<M::Images>>>,
    {
        self.enter(RunPhase::Loading);
        let nc = self.config.num_classes();
        let with_masks = self.config.mask;
        let nms_params = self.config.nms_params();
        let options = self.recorder_options();
        let names = Arc::new(self.config.names.clone());

        let save_dir = self.config.save_dir.clone();
        if let Some(dir) = &save_dir {
            fs::create_dir_all(if self.config.save_txt {
                dir.join("labels")
            } else {
                dir.clone()
            })?;
        }
        let plotting_enabled = self.config.plots && save_dir.as_ref().map_or(false, |d| d.exists());

        let mut state = ScanState {
            stats: StatsBuffer::new(self.config.iou_thresholds.len(), with_masks),
            seen: 0,
            batches: 0,
            dt: [Duration::ZERO; 3],
            loss: vec![0.0; self.expected_loss_terms()],
            confusion: self.config.plots.then(|| ConfusionMatrix::new(nc)),
            json: Vec::new(),
            plots: PlotScheduler::new(),
        };

        let mut guard = InferenceModeGuard::new(model);
        self.enter(RunPhase::Scanning);
        info!("{}", header(with_masks));

        for (batch_index, batch) in dataset.into_iter().enumerate() {
            let batch = batch?;
            if batch.shapes.len() != batch.len() {
                return Err(EvalError::Dataset(format!(
                    "batch {} has {} paths but {} shapes",
                    batch_index,
                    batch.len(),
                    batch.shapes.len()
                )));
            }
            state.batches += 1;

            let t0 = Instant::now();
            let prepared = guard.preprocess(batch.images.as_ref())?;
            let t1 = Instant::now();
            let raw = guard.forward(&prepared)?;
            let t2 = Instant::now();
            state.dt[0] += t1 - t0;
            state.dt[1] += t2 - t1;

            if let Some(loss_fn) = loss.as_deref_mut() {
                let terms = loss_fn.compute(&raw, &batch.labels, batch.masks.as_deref())?;
                if terms.len() != state.loss.len() {
                    return Err(EvalError::ShapeMismatch(format!(
                        "loss returned {} terms, expected {}",
                        terms.len(),
                        state.loss.len()
                    )));
                }
                for (total, term) in state.loss.iter_mut().zip(terms) {
                    *total += term;
                }
            }

            let (input_h, input_w) = batch.input_size;
            for row in &batch.labels {
                row.validate()?;
            }

            let t3 = Instant::now();
            let mut predictions = guard.nms(&raw, &nms_params)?;
            state.dt[2] += t3.elapsed();

            if predictions.len() != batch.len() {
                return Err(EvalError::Inference(format!(
                    "NMS returned {} images for a batch of {}",
                    predictions.len(),
                    batch.len()
                )));
            }
            if self.config.single_cls {
                for det in predictions.iter_mut().flat_map(|p| p.detections.iter_mut()) {
                    det.class_id = 0;
                }
            }

            let mut batch_masks: Vec<Mask> = Vec::new();
            for (si, pred) in predictions.iter().enumerate() {
                state.seen += 1;
                let indices = batch.label_indices(si);
                let labels: Vec<GroundTruthLabel> = indices
                    .iter()
                    .map(|&i| batch.labels[i].to_ground_truth(f64::from(input_w), f64::from(input_h)))
                    .collect();
                let gt_masks: Option<Vec<Mask>> = batch
                    .masks
                    .as_ref()
                    .map(|masks| indices.iter().filter_map(|&i| masks.get(i).cloned()).collect());

                let outcome = record_image(pred, &labels, gt_masks.as_deref(), &options)?;
                if let Some(record) = outcome.record {
                    state.stats.push(record);
                }
                if let Some(masks) = outcome.masks {
                    if batch_index < self.config.max_plot_batches {
                        batch_masks.extend(masks);
                    }
                }

                if let Some(cm) = state.confusion.as_mut() {
                    if !labels.is_empty() {
                        let labels = if self.config.single_cls {
                            labels.iter().map(|l| GroundTruthLabel { class_id: 0, ..*l }).collect()
                        } else {
                            labels.clone()
                        };
                        cm.process_batch(&pred.detections, &labels);
                    }
                }

                if let Some(dir) = &save_dir {
                    let path = &batch.paths[si];
                    let shape = &batch.shapes[si];
                    if self.config.save_txt {
                        let stem = path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_else(|| format!("image{}", state.seen));
                        let file = dir.join("labels").join(format!("{}.txt", stem));
                        save_one_txt(&pred.detections, shape, batch.input_size, self.config.save_conf, &file)?;
                    }
                    if self.config.save_json {
                        state.json.extend(json_records(
                            &pred.detections,
                            path,
                            shape,
                            batch.input_size,
                            |c| self.config.category_id(c),
                        ));
                    }
                }
            }

            if plotting_enabled && batch_index < self.config.max_plot_batches {
                if let (Some(visualizer), Some(dir)) = (visualizer.as_ref(), save_dir.as_ref()) {
                    schedule_plots(
                        &mut state.plots,
                        visualizer,
                        dir,
                        batch_index,
                        &batch,
                        &predictions,
                        batch_masks,
                        &names,
                    );
                }
            }
        }
        drop(guard);

        self.enter(RunPhase::Aggregating);
        let panicked = state.plots.finish();
        if panicked > 0 {
            warn!("{} visualization job(s) panicked", panicked);
        }

        if let (Some(cm), Some(dir)) = (state.confusion.as_ref(), save_dir.as_ref()) {
            if plotting_enabled {
                let file = fs::File::create(dir.join("confusion_matrix.json"))?;
                serde_json::to_writer(file, cm)?;
            }
        }

        let arrays = state.stats.concatenate()?;
        let metric = aggregate(&arrays, with_masks)?;
        let targets_per_class = if arrays.has_true_positive() {
            arrays.targets_per_class(nc)
        } else {
            vec![0; nc]
        };

        let speed = per_image_speed(&state.dt, state.seen);
        let losses = if loss.is_some() && state.batches > 0 {
            state.loss.iter().map(|l| l / state.batches as f64).collect()
        } else {
            Vec::new()
        };

        if self.config.save_json {
            if let Some(dir) = &save_dir {
                let file = dir.join("predictions.json");
                info!("saving {} ({} records)", file.display(), state.json.len());
                write_json(&state.json, &file)?;
            }
        }

        let report = EvalReport {
            mean_results: metric.mean_results(),
            losses,
            maps: metric.get_maps(nc),
            speed,
            targets_per_class,
            seen: state.seen,
            metric,
            confusion_matrix: state.confusion,
        };
        report.log(&self.config.names, self.config.verbose);
        if let Some(dir) = &save_dir {
            info!("Results saved to {}", dir.display());
        }

        self.enter(RunPhase::Reported);
        Ok(report)
    }
}

/// Milliseconds per image for each stage; zero when nothing was seen.
pub fn per_image_speed(dt: &[Duration; 3], seen: usize) -> Speed {
    if seen == 0 {
        return Speed::default();
    }
    let per_image = |d: Duration| d.as_secs_f64() / seen as f64 * 1e3;
    Speed {
        preprocess_ms: per_image(dt[0]),
        inference_ms: per_image(dt[1]),
        nms_ms: per_image(dt[2]),
    }
}

#[allow(clippy::too_many_arguments)]
fn schedule_plots<I: Send + Sync + 'static>(
    scheduler: &mut PlotScheduler,
    visualizer: &Arc<dyn Visualizer<I>>,
    save_dir: &std::path::Path,
    batch_index: usize,
    batch: &Batch<I>,
    predictions: &[ImagePredictions],
    masks: Vec<Mask>,
    names: &Arc<Vec<String>>,
) {
    let (input_h, input_w) = batch.input_size;
    let labels: Vec<PlotBox> = batch
        .labels
        .iter()
        .map(|row| {
            let gt = row.to_ground_truth(f64::from(input_w), f64::from(input_h));
            PlotBox {
                image_index: row.image_index,
                class_id: gt.class_id,
                bbox: gt.bbox,
                confidence: None,
            }
        })
        .collect();
    let detections: Vec<PlotBox> = predictions
        .iter()
        .enumerate()
        .flat_map(|(image_index, p)| {
            p.detections.iter().map(move |d| PlotBox {
                image_index,
                class_id: d.class_id,
                bbox: d.bbox,
                confidence: Some(d.confidence),
            })
        })
        .collect();
    let paths = Arc::new(batch.paths.clone());

    let jobs = [
        (PlotKind::Labels, labels, batch.masks.clone()),
        (PlotKind::Predictions, detections, (!masks.is_empty()).then_some(masks)),
    ];
    for (kind, boxes, masks) in jobs {
        let job = PlotJob {
            batch_index,
            kind,
            path: PlotJob::<I>::output_path(save_dir, batch_index, kind),
            images: Arc::clone(&batch.images),
            boxes: Arc::new(boxes),
            masks: masks.map(Arc::new),
            paths: Arc::clone(&paths),
            names: Arc::clone(names),
        };
        scheduler.schedule(Arc::clone(visualizer), job);
    }
}
