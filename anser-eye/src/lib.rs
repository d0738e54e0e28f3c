//! anser-eye: object detection over images, videos, streams and screen captures
//!
//! A source descriptor is classified and turned into a frame provider. Every
//! batch is letterboxed, run through a detection backend (ONNX Runtime or
//! OpenCV DNN), filtered with non-maximum suppression and handed to a result
//! sink that writes labels, CSV rows, crops and annotated media.
//!
//! ```no_run
//! use anser_eye::{detect, DetectConfig};
//!
//! # async fn run() -> anser_eye::Result<()> {
//! let config = DetectConfig { source: "data/images".into(), ..Default::default() };
//! let summary = detect(config).await?;
//! println!("{}", summary.to_json().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod annotate;
#[cfg(feature = "opencv")]
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frames;
pub mod models;
pub mod paths;
pub mod postprocess;
pub mod preprocess;
pub mod sink;
pub mod source;
pub mod summary;
pub mod video;

pub use config::{DetectConfig, Device, LabelFormat};
pub use detect::{detect, Detector};
pub use error::{Result, VisionError};
pub use frames::{Capture, Frame, FrameBatch, FrameProvider, Mode};
pub use models::{Backend, Invocation, Model, Predictions};
pub use postprocess::Detection;
pub use source::{SourceKind, SourcePlan};
pub use summary::RunSummary;
