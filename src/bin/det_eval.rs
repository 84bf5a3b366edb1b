//! det-eval - score saved YOLO-format predictions against label files

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use det_eval::loader::FileDataset;
use det_eval::replay::ReplayModel;
use det_eval::{EvalConfig, Evaluator};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "det-eval", author, version, about)]
struct Args {
    /// Directory of ground-truth label files (`class xc yc w h`).
    #[arg(long)]
    labels: PathBuf,
    /// Directory of prediction files (`class xc yc w h conf`).
    #[arg(long)]
    predictions: PathBuf,
    /// TOML run configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of classes.
    #[arg(long)]
    nc: Option<usize>,
    /// Class names (comma-separated).
    #[arg(long, value_delimiter = ',')]
    names: Option<Vec<String>>,
    /// Square model input size the files are normalized to.
    #[arg(long, default_value_t = 640)]
    imgsz: u32,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long)]
    single_cls: bool,
    /// Print per-class rows.
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    conf_thres: Option<f64>,
    /// NMS IoU threshold.
    #[arg(long)]
    iou_thres: Option<f64>,
    /// Output directory for labels, JSON and the confusion matrix.
    #[arg(long)]
    save_dir: Option<PathBuf>,
    #[arg(long)]
    save_txt: bool,
    #[arg(long)]
    save_conf: bool,
    #[arg(long)]
    save_json: bool,
    /// Write the full report as JSON to this file.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<EvalConfig> {
    let mut config = match &args.config {
        Some(path) => EvalConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EvalConfig::default(),
    };
    if let Some(nc) = args.nc {
        config.nc = Some(nc);
    }
    if let Some(names) = &args.names {
        config.names = names.clone();
    }
    if let Some(conf) = args.conf_thres {
        config.conf_thres = conf;
    }
    if let Some(iou) = args.iou_thres {
        config.iou_thres = iou;
    }
    if args.save_dir.is_some() {
        config.save_dir = args.save_dir.clone();
    }
    config.single_cls |= args.single_cls;
    config.verbose |= args.verbose;
    config.save_txt |= args.save_txt;
    config.save_conf |= args.save_conf;
    config.save_json |= args.save_json;
    if config.mask {
        return Err(anyhow!("text predictions carry no masks; unset `mask` in the config"));
    }
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;

    let dataset = FileDataset::open(&args.labels, &args.predictions, args.batch_size, args.imgsz)?;
    info!(
        "evaluating {} images from {} against {}",
        dataset.len(),
        args.predictions.display(),
        args.labels.display()
    );

    let mut model = ReplayModel::new(dataset.input_size());
    let report = Evaluator::new(config)?.run(&mut model, dataset, None, None)?;

    if let Some(path) = &args.report {
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow!("failed to create {}: {}", path.display(), e))?;
        serde_json::to_writer_pretty(file, &report)?;
        info!("report written to {}", path.display());
    }
    Ok(())
}
