//! Frame providers: every source topology yields the same batch shape

pub mod files;
pub mod screen;
pub mod streams;

pub use files::FileSequence;
pub use screen::{FfmpegGrabber, ScreenRegion, Screenshots};
pub use streams::LiveStreams;

use crate::error::{Result, VisionError};
use crate::preprocess::Letterbox;
use crate::source::{self, SourceKind};
use image::RgbImage;
use ndarray::Array4;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Frame rate used when a capture does not report one
pub const FALLBACK_FPS: f64 = 30.0;

/// Properties of an open video or stream capture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl CaptureInfo {
    /// Replace missing or nonsensical frame rates with [`FALLBACK_FPS`].
    pub fn sanitized(self) -> Self {
        let fps = if self.fps.is_finite() && self.fps > 0.0 { self.fps } else { FALLBACK_FPS };
        Self { fps, ..self }
    }
}

/// Kind of media a batch came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Image,
    Video,
    Stream,
    Screen,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Image => "image",
            Mode::Video => "video",
            Mode::Stream => "stream",
            Mode::Screen => "screen",
        };
        f.write_str(name)
    }
}

/// One original-resolution image of a batch
#[derive(Debug, Clone)]
pub struct Frame {
    /// File path or stream identity
    pub path: PathBuf,
    pub image: RgbImage,
    /// 0 for single-source providers
    pub stream: usize,
    /// Position within its video or stream, 0 for still images
    pub frame_index: u64,
    pub capture: Option<CaptureInfo>,
}

impl Frame {
    /// (height, width)
    pub fn shape(&self) -> (u32, u32) {
        (self.image.height(), self.image.width())
    }
}

/// One pull from a provider
#[derive(Debug, Clone)]
pub struct FrameBatch {
    pub frames: Vec<Frame>,
    /// Letterboxed `[B, 3, H, W]` pixels, one row per frame
    pub pixels: Array4<u8>,
    pub mode: Mode,
    pub description: String,
}

/// Pull-based frame source
pub trait FrameProvider: Send {
    /// Next batch, `None` once the source is exhausted.
    fn next_batch(&mut self) -> Option<Result<FrameBatch>>;

    fn batch_size(&self) -> usize;

    fn mode(&self) -> Mode;

    /// Streams that closed since the last call and will deliver no more frames.
    fn take_closed(&mut self) -> Vec<usize> {
        Vec::new()
    }
}

/// Decoded video file
pub trait VideoReader: Send {
    fn info(&self) -> CaptureInfo;

    /// Total frames reported by the container, 0 when unknown
    fn frame_count(&self) -> u64;

    /// Advance one frame without decoding it; `false` at end of file.
    fn grab(&mut self) -> Result<bool>;

    /// Decode the most recently grabbed frame.
    fn retrieve(&mut self) -> Result<Option<RgbImage>>;

    fn read(&mut self) -> Result<Option<RgbImage>> {
        if self.grab()? {
            self.retrieve()
        } else {
            Ok(None)
        }
    }
}

pub trait VideoOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoReader>>;
}

/// Live capture: webcam, RTSP/RTMP/HTTP stream
pub trait StreamReader: Send {
    fn info(&self) -> CaptureInfo;

    /// Next frame, `None` when the stream ended.
    fn read(&mut self) -> Result<Option<RgbImage>>;
}

pub trait StreamOpener: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn StreamReader>>;
}

pub trait ScreenGrabber: Send + Sync {
    fn grab(&self, region: &ScreenRegion) -> Result<RgbImage>;
}

/// Stand-in used when no video decoder is compiled in
pub struct UnsupportedVideo;

impl VideoOpener for UnsupportedVideo {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoReader>> {
        Err(VisionError::SourceResolution(format!(
            "Cannot decode video {:?}: built without the `opencv` feature",
            path
        )))
    }
}

impl StreamOpener for UnsupportedVideo {
    fn open(&self, source: &str) -> Result<Box<dyn StreamReader>> {
        Err(VisionError::SourceResolution(format!(
            "Cannot open stream {}: built without the `opencv` feature",
            source
        )))
    }
}

/// Capture backends used to open providers
#[derive(Clone)]
pub struct Capture {
    pub video: Arc<dyn VideoOpener>,
    pub streams: Arc<dyn StreamOpener>,
    pub screen: Arc<dyn ScreenGrabber>,
}

impl Default for Capture {
    #[cfg(feature = "opencv")]
    fn default() -> Self {
        Self {
            video: Arc::new(crate::capture::CvVideoOpener),
            streams: Arc::new(crate::capture::CvStreamOpener),
            screen: Arc::new(FfmpegGrabber::default()),
        }
    }

    #[cfg(not(feature = "opencv"))]
    fn default() -> Self {
        Self {
            video: Arc::new(UnsupportedVideo),
            streams: Arc::new(UnsupportedVideo),
            screen: Arc::new(FfmpegGrabber::default()),
        }
    }
}

/// Build the provider for an already materialized descriptor.
pub fn open_provider(
    kind: SourceKind,
    descriptor: &str,
    letterbox: Letterbox,
    vid_stride: u32,
    capture: &Capture,
) -> Result<Box<dyn FrameProvider>> {
    Ok(match kind {
        SourceKind::Webcam => {
            let sources = source::stream_sources(descriptor)?;
            Box::new(LiveStreams::open(&sources, letterbox, vid_stride, capture.streams.as_ref())?)
        }
        SourceKind::Screenshot => {
            let region = ScreenRegion::parse(descriptor)?;
            Box::new(Screenshots::new(region, letterbox, capture.screen.clone()))
        }
        SourceKind::Files => {
            let files = source::expand_files(descriptor)?;
            Box::new(FileSequence::new(files, letterbox, vid_stride, capture.video.clone()))
        }
    })
}
