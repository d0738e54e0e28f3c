//! Error types for anser-eye

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Source resolution error: {0}")]
    SourceResolution(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Dataset metadata error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("ONNX Runtime error: {0}")]
    Ort(String),

    #[error("OpenCV error: {0}")]
    OpenCv(String),
}

pub type Result<T> = std::result::Result<T, VisionError>;

#[cfg(feature = "onnx")]
impl From<ort::Error> for VisionError {
    fn from(err: ort::Error) -> Self {
        VisionError::Ort(err.to_string())
    }
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for VisionError {
    fn from(err: opencv::Error) -> Self {
        VisionError::OpenCv(err.message)
    }
}

impl VisionError {
    /// Whether a live stream can be dropped on this error instead of aborting the run.
    pub fn is_frame_decode(&self) -> bool {
        matches!(self, VisionError::FrameDecode(_))
    }
}
