// Anser command line interface
// Runs object detection over a source and prints the run summary as JSON

use anser_eye::{detect, DetectConfig, LabelFormat};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "anser")]
#[command(about = "Object detection over images, videos, streams and screen captures", long_about = None)]
#[command(version)]
struct Cli {
    /// Base configuration file (TOML); flags below override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Model weights (.onnx)
    #[arg(long)]
    weights: Option<PathBuf>,

    /// File, directory, glob, .txt list, URL, `screen`, .streams list or webcam index
    #[arg(long)]
    source: Option<String>,

    /// Dataset YAML with class names
    #[arg(long)]
    data: Option<PathBuf>,

    /// Inference size: `h w`, or one value for a square
    #[arg(long, visible_aliases = ["img", "img-size"], num_args = 1..=2)]
    imgsz: Option<Vec<u32>>,

    /// Confidence threshold
    #[arg(long)]
    conf_thres: Option<f32>,

    /// NMS IoU threshold
    #[arg(long)]
    iou_thres: Option<f32>,

    /// Maximum detections per image
    #[arg(long)]
    max_det: Option<usize>,

    /// `cpu`, or CUDA device ids such as `0` or `0,1`
    #[arg(long)]
    device: Option<String>,

    /// Show results in a window
    #[arg(long)]
    view_img: bool,

    /// Save results to labels/*.txt
    #[arg(long)]
    save_txt: bool,

    /// Label coordinates: 0 = normalized YOLO, 1 = absolute Pascal VOC corners
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    save_format: Option<u8>,

    /// Save results to predictions.csv
    #[arg(long)]
    save_csv: bool,

    /// Include confidences in text labels
    #[arg(long)]
    save_conf: bool,

    /// Save cropped prediction boxes
    #[arg(long)]
    save_crop: bool,

    /// Do not save annotated images or videos
    #[arg(long)]
    nosave: bool,

    /// Keep only these classes: `--classes 0` or `--classes 0 2 3`
    #[arg(long, num_args = 1..)]
    classes: Option<Vec<usize>>,

    /// Class-agnostic NMS
    #[arg(long)]
    agnostic_nms: bool,

    /// Augmented inference
    #[arg(long)]
    augment: bool,

    /// Visualize features
    #[arg(long)]
    visualize: bool,

    /// Save results under project/name
    #[arg(long)]
    project: Option<PathBuf>,

    #[arg(long)]
    name: Option<String>,

    /// Reuse an existing project/name directory instead of incrementing
    #[arg(long)]
    exist_ok: bool,

    /// Bounding box thickness (pixels)
    #[arg(long)]
    line_thickness: Option<u32>,

    #[arg(long)]
    hide_labels: bool,

    #[arg(long)]
    hide_conf: bool,

    /// FP16 half-precision inference
    #[arg(long)]
    half: bool,

    /// Use OpenCV DNN for ONNX inference
    #[arg(long)]
    dnn: bool,

    /// Video frame-rate stride
    #[arg(long)]
    vid_stride: Option<u32>,

    /// TrueType font for box labels
    #[arg(long)]
    font: Option<PathBuf>,

    #[arg(long, short)]
    verbose: bool,
}

impl Cli {
    /// Overlay the flags that were given onto `base`.
    fn apply(self, mut base: DetectConfig) -> anyhow::Result<DetectConfig> {
        if let Some(weights) = self.weights {
            base.weights = weights;
        }
        if let Some(source) = self.source {
            base.source = source;
        }
        if self.data.is_some() {
            base.data = self.data;
        }
        if let Some(imgsz) = self.imgsz {
            base.imgsz = match imgsz.as_slice() {
                [size] => (*size, *size),
                [h, w] => (*h, *w),
                _ => anyhow::bail!("--imgsz takes one or two values"),
            };
        }
        if let Some(conf) = self.conf_thres {
            base.conf_thres = conf;
        }
        if let Some(iou) = self.iou_thres {
            base.iou_thres = iou;
        }
        if let Some(max_det) = self.max_det {
            base.max_det = max_det;
        }
        if let Some(device) = self.device {
            base.device = device;
        }
        if let Some(format) = self.save_format {
            base.save_format = LabelFormat::try_from(format).map_err(anyhow::Error::msg)?;
        }
        if self.classes.is_some() {
            base.classes = self.classes;
        }
        if let Some(project) = self.project {
            base.project = project;
        }
        if let Some(name) = self.name {
            base.name = name;
        }
        if let Some(thickness) = self.line_thickness {
            base.line_thickness = thickness;
        }
        if let Some(stride) = self.vid_stride {
            base.vid_stride = stride;
        }
        if self.font.is_some() {
            base.font = self.font;
        }

        base.view_img |= self.view_img;
        base.save_txt |= self.save_txt;
        base.save_csv |= self.save_csv;
        base.save_conf |= self.save_conf;
        base.save_crop |= self.save_crop;
        base.nosave |= self.nosave;
        base.agnostic_nms |= self.agnostic_nms;
        base.augment |= self.augment;
        base.visualize |= self.visualize;
        base.exist_ok |= self.exist_ok;
        base.hide_labels |= self.hide_labels;
        base.hide_conf |= self.hide_conf;
        base.half |= self.half;
        base.dnn |= self.dnn;
        Ok(base)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let base = match &cli.config {
        Some(path) => DetectConfig::from_toml_file(path).with_context(|| format!("Failed to load {:?}", path))?,
        None => DetectConfig::default(),
    };
    let config = cli.apply(base)?;
    config.validate().map_err(anyhow::Error::msg)?;
    debug!("Configuration: {:?}", config);

    let summary = detect(config).await.context("Detection run failed")?;
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
