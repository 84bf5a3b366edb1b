//! Background visualization jobs.
//!
//! Rendering is delegated to a [`Visualizer`]. Each job runs on its own named
//! thread and owns `Arc` snapshots of what it draws. Failures and panics are
//! logged, never propagated, and [`PlotScheduler::finish`] joins every job.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crate::error::Result;
use crate::mask::Mask;
use crate::types::BoundingBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotKind {
    Labels,
    Predictions,
}

impl PlotKind {
    fn suffix(self) -> &'static str {
        match self {
            PlotKind::Labels => "labels",
            PlotKind::Predictions => "pred",
        }
    }
}

/// A box to draw; `confidence` is `None` for ground truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotBox {
    pub image_index: usize,
    pub class_id: usize,
    pub bbox: BoundingBox,
    pub confidence: Option<f64>,
}

/// Everything one render needs, detached from the running scan.
#[derive(Debug)]
pub struct PlotJob<I> {
    pub batch_index: usize,
    pub kind: PlotKind,
    /// Output file.
    pub path: PathBuf,
    pub images: Arc<I>,
    pub boxes: Arc<Vec<PlotBox>>,
    pub masks: Option<Arc<Vec<Mask>>>,
    pub paths: Arc<Vec<PathBuf>>,
    pub names: Arc<Vec<String>>,
}

impl<I> PlotJob<I> {
    /// Output path `val_batch{i}_{labels|pred}.jpg` under `save_dir`.
    pub fn output_path(save_dir: &Path, batch_index: usize, kind: PlotKind) -> PathBuf {
        save_dir.join(format!("val_batch{}_{}.jpg", batch_index, kind.suffix()))
    }
}

/// Renders plot jobs. Implementations must be shareable across threads.
pub trait Visualizer<I>: Send + Sync {
    fn render(&self, job: PlotJob<I>) -> Result<()>;
}

/// Owns the handles of every scheduled job.
#[derive(Debug, Default)]
pub struct PlotScheduler {
    handles: Vec<(String, JoinHandle<()>)>,
}

impl PlotScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.handles.len()
    }

    /// Start `job` on a background thread.
    pub fn schedule<I, V>(&mut self, visualizer: Arc<V>, job: PlotJob<I>)
    where
        I: Send + Sync + 'static,
        V: Visualizer<I> + ?Sized + 'static,
    {
        let name = format!("plot-batch{}-{}", job.batch_index, job.kind.suffix());
        let thread_name = name.clone();
        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let path = job.path.clone();
            if let Err(err) = visualizer.render(job) {
                warn!("{} failed to render {}: {}", thread_name, path.display(), err);
            }
        });
        match spawned {
            Ok(handle) => self.handles.push((name, handle)),
            Err(err) => warn!("could not start {}: {}", name, err),
        }
    }

    /// Join every job; returns how many panicked.
    pub fn finish(mut self) -> usize {
        self.join_all()
    }

    fn join_all(&mut self) -> usize {
        let mut panicked = 0;
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("{} panicked", name);
                panicked += 1;
            } else {
                debug!("{} done", name);
            }
        }
        panicked
    }
}

impl Drop for PlotScheduler {
    fn drop(&mut self) {
        self.join_all();
    }
}
