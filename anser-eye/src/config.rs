//! Configuration for anser-eye

use crate::error::{Result, VisionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Coordinate convention for exported text labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LabelFormat {
    /// `class cx cy w h`, normalized to the frame size
    #[default]
    Yolo,
    /// `class x1 y1 x2 y2` in absolute pixels
    PascalVoc,
}

impl TryFrom<u8> for LabelFormat {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(LabelFormat::Yolo),
            1 => Ok(LabelFormat::PascalVoc),
            other => Err(format!("Unknown label format {} (expected 0 or 1)", other)),
        }
    }
}

impl From<LabelFormat> for u8 {
    fn from(format: LabelFormat) -> Self {
        match format {
            LabelFormat::Yolo => 0,
            LabelFormat::PascalVoc => 1,
        }
    }
}

/// Inference device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(Vec<u32>),
}

impl Device {
    /// Parse a device selector: `""`, `"cpu"`, `"0"`, `"0,1"` or `"cuda:0"`.
    pub fn parse(selector: &str) -> Result<Self> {
        let selector = selector.trim().to_lowercase();
        let selector = selector.strip_prefix("cuda:").unwrap_or(&selector);
        if selector.is_empty() || selector == "cpu" {
            return Ok(Device::Cpu);
        }

        let ids = selector
            .split(',')
            .map(|id| id.trim().parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| VisionError::Config(format!("Invalid device selector '{}'", selector)))?;
        Ok(Device::Cuda(ids))
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

/// Detection run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    /// Model weights path
    pub weights: PathBuf,
    /// File, directory, glob, URL, `screen ...` or webcam index
    pub source: String,
    /// Optional dataset YAML providing class names
    pub data: Option<PathBuf>,
    /// Inference size (height, width)
    pub imgsz: (u32, u32),
    pub conf_thres: f32,
    pub iou_thres: f32,
    pub max_det: usize,
    /// `""`/`cpu` or CUDA ids such as `0` or `0,1`
    pub device: String,
    pub view_img: bool,
    pub save_txt: bool,
    pub save_format: LabelFormat,
    pub save_csv: bool,
    pub save_conf: bool,
    pub save_crop: bool,
    pub nosave: bool,
    /// Keep only these class indices
    pub classes: Option<Vec<usize>>,
    pub agnostic_nms: bool,
    pub augment: bool,
    pub visualize: bool,
    pub project: PathBuf,
    pub name: String,
    pub exist_ok: bool,
    pub line_thickness: u32,
    pub hide_labels: bool,
    pub hide_conf: bool,
    pub half: bool,
    /// Run ONNX weights through OpenCV DNN instead of ONNX Runtime
    pub dnn: bool,
    /// Process every Nth video frame
    pub vid_stride: u32,
    /// TrueType font used for box labels
    pub font: Option<PathBuf>,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            weights: PathBuf::from("yolov5s.onnx"),
            source: "data/images".to_string(),
            data: None,
            imgsz: (640, 640),
            conf_thres: 0.25,
            iou_thres: 0.45,
            max_det: 1000,
            device: String::new(),
            view_img: false,
            save_txt: false,
            save_format: LabelFormat::Yolo,
            save_csv: false,
            save_conf: false,
            save_crop: false,
            nosave: false,
            classes: None,
            agnostic_nms: false,
            augment: false,
            visualize: false,
            project: PathBuf::from("runs/detect"),
            name: "exp".to_string(),
            exist_ok: false,
            line_thickness: 3,
            hide_labels: false,
            hide_conf: false,
            half: false,
            dnn: false,
            vid_stride: 1,
            font: None,
        }
    }
}

impl DetectConfig {
    /// Load a configuration file; missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| VisionError::Config(format!("Invalid config file {:?}: {}", path, e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("Source must not be empty".to_string());
        }

        if !(0.0..=1.0).contains(&self.conf_thres) {
            return Err(format!(
                "Invalid confidence threshold {}, valid values are between 0.0 and 1.0",
                self.conf_thres
            ));
        }

        if !(0.0..=1.0).contains(&self.iou_thres) {
            return Err(format!(
                "Invalid IoU threshold {}, valid values are between 0.0 and 1.0",
                self.iou_thres
            ));
        }

        if self.max_det == 0 {
            return Err("max_det must be at least 1".to_string());
        }

        if self.imgsz.0 == 0 || self.imgsz.1 == 0 {
            return Err("Inference size must be non-zero".to_string());
        }

        if self.imgsz.0 > 7680 || self.imgsz.1 > 7680 {
            return Err("Inference size too large (max 7680)".to_string());
        }

        if self.vid_stride == 0 {
            return Err("vid_stride must be at least 1".to_string());
        }

        if self.line_thickness == 0 {
            return Err("line_thickness must be at least 1".to_string());
        }

        if self.name.is_empty() || self.name.contains("..") {
            return Err("Run name must be non-empty and must not contain '..'".to_string());
        }

        Device::parse(&self.device).map_err(|e| e.to_string())?;

        Ok(())
    }

    /// Whether annotated images or videos are written.
    pub fn saves_images(&self) -> bool {
        !self.nosave && !self.source.ends_with(".txt")
    }
}

/// Largest class table accepted from a names map
pub const MAX_CLASSES: usize = 10_000;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClassNames {
    List(Vec<String>),
    Map(BTreeMap<usize, String>),
}

impl ClassNames {
    /// Dense table, filling gaps in an index map with `class{i}`.
    fn into_names(self) -> Result<Vec<String>> {
        match self {
            ClassNames::List(names) => Ok(names),
            ClassNames::Map(map) => {
                let len = map.keys().next_back().map_or(0, |last| last + 1);
                if len > MAX_CLASSES {
                    return Err(VisionError::Config(format!(
                        "Class index {} exceeds the limit of {} classes",
                        len - 1,
                        MAX_CLASSES
                    )));
                }
                Ok((0..len)
                    .map(|i| map.get(&i).cloned().unwrap_or_else(|| format!("class{}", i)))
                    .collect())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DatasetMeta {
    names: ClassNames,
}

/// Parse a class table written as a YAML list (`['goose', 'egg']`) or an
/// index map (`{0: 'goose', 1: 'egg'}`).
pub fn parse_class_names(text: &str) -> Result<Vec<String>> {
    serde_yaml::from_str::<ClassNames>(text)?.into_names()
}

/// Read class names from a dataset YAML (`names` as a list or an index map).
pub fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    let meta: DatasetMeta = serde_yaml::from_str(&text)?;
    meta.names.into_names()
}
