//! Test doubles shared by the pipeline tests

#![allow(dead_code)]

use anser_eye::error::Result;
use anser_eye::frames::{CaptureInfo, StreamOpener, StreamReader, UnsupportedVideo, VideoOpener, VideoReader};
use anser_eye::frames::{Capture, FfmpegGrabber};
use anser_eye::models::{Backend, Invocation, Model, Predictions, DEFAULT_STRIDE};
use anser_eye::preprocess::InputTensor;
use anser_eye::video::{VideoEncoder, VideoWriterFactory};
use anser_eye::{DetectConfig, VisionError};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `(cx, cy, w, h, objectness, class scores...)` in input-canvas pixels
pub type Row = Vec<f32>;

/// Returns the same rows for every batch item
pub struct ScriptedModel {
    pub rows: Vec<Row>,
}

impl Model for ScriptedModel {
    fn forward(&mut self, input: &InputTensor, _augment: bool, _visualize: Option<&Path>) -> Result<Predictions> {
        let batch = input.batch_size();
        let width = self.rows.first().map_or(7, Vec::len);
        let mut out = Predictions::zeros((batch, self.rows.len().max(1), width));
        for b in 0..batch {
            for (r, row) in self.rows.iter().enumerate() {
                for (c, v) in row.iter().enumerate() {
                    out[[b, r, c]] = *v;
                }
            }
        }
        Ok(out)
    }

    fn stride(&self) -> u32 {
        DEFAULT_STRIDE
    }

    fn names(&self) -> &[String] {
        &[]
    }

    fn is_half(&self) -> bool {
        false
    }
}

/// One goose in the top-left quadrant and one egg in the bottom-right of a 64x64 canvas.
pub fn goose_and_egg() -> Vec<Row> {
    vec![
        vec![16.0, 16.0, 12.0, 12.0, 0.9, 0.9, 0.05],
        vec![48.0, 48.0, 12.0, 12.0, 0.9, 0.05, 0.8],
    ]
}

pub fn backend(rows: Vec<Row>) -> Backend {
    Backend::from_model(
        Box::new(ScriptedModel { rows }),
        Invocation::Batched,
        Some(vec!["goose".to_string(), "egg".to_string()]),
    )
}

pub fn config(source: &Path, project: &Path) -> DetectConfig {
    DetectConfig {
        source: source.to_string_lossy().into_owned(),
        project: project.to_path_buf(),
        imgsz: (64, 64),
        ..Default::default()
    }
}

pub fn write_image(path: &Path) {
    RgbImage::from_pixel(64, 64, Rgb([90, 120, 150])).save(path).unwrap();
}

/// Every factory call and frame write, in order
#[derive(Clone, Default)]
pub struct WriterLog(pub Arc<Mutex<Vec<String>>>);

impl WriterLog {
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct RecordingFactory {
    pub log: WriterLog,
}

impl VideoWriterFactory for RecordingFactory {
    fn open(&self, path: &Path, fps: f64, width: u32, height: u32) -> Result<Box<dyn VideoEncoder>> {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.log.0.lock().push(format!("open {} {}x{}@{}", name, width, height, fps));
        Ok(Box::new(RecordingEncoder { name, log: self.log.clone() }))
    }
}

struct RecordingEncoder {
    name: String,
    log: WriterLog,
}

impl VideoEncoder for RecordingEncoder {
    fn write(&mut self, _frame: &RgbImage) -> Result<()> {
        self.log.0.lock().push(format!("write {}", self.name));
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.log.0.lock().push(format!("release {}", self.name));
        Ok(())
    }
}

/// Decodes any path as `frames` solid 64x64 frames
pub struct SyntheticVideo {
    pub frames: u64,
}

impl VideoOpener for SyntheticVideo {
    fn open(&self, _path: &Path) -> Result<Box<dyn VideoReader>> {
        Ok(Box::new(SyntheticReader { total: self.frames, pos: 0 }))
    }
}

struct SyntheticReader {
    total: u64,
    pos: u64,
}

impl VideoReader for SyntheticReader {
    fn info(&self) -> CaptureInfo {
        CaptureInfo { fps: 25.0, width: 64, height: 64 }
    }

    fn frame_count(&self) -> u64 {
        self.total
    }

    fn grab(&mut self) -> Result<bool> {
        if self.pos >= self.total {
            return Ok(false);
        }
        self.pos += 1;
        Ok(true)
    }

    fn retrieve(&mut self) -> Result<Option<RgbImage>> {
        Ok(Some(RgbImage::from_pixel(64, 64, Rgb([self.pos as u8, 0, 0]))))
    }
}

/// Stream `0` ends cleanly after 6 frames; stream `1` fails after 2.
/// Stream `2` reports 15 fps and no frame size but delivers 64x48 frames.
pub struct ScriptedStreams;

impl StreamOpener for ScriptedStreams {
    fn open(&self, source: &str) -> Result<Box<dyn StreamReader>> {
        let square = CaptureInfo { fps: 0.0, width: 64, height: 64 };
        match source {
            "0" => Ok(Box::new(ScriptedStream::new(square, (64, 64), 6, None))),
            "1" => Ok(Box::new(ScriptedStream::new(square, (64, 64), 100, Some(2)))),
            "2" => {
                let unsized_info = CaptureInfo { fps: 15.0, width: 0, height: 0 };
                Ok(Box::new(ScriptedStream::new(unsized_info, (64, 48), 3, None)))
            }
            other => Err(VisionError::SourceResolution(format!("no such stream {}", other))),
        }
    }
}

struct ScriptedStream {
    info: CaptureInfo,
    size: (u32, u32),
    served: u32,
    end_after: u32,
    fail_after: Option<u32>,
}

impl ScriptedStream {
    fn new(info: CaptureInfo, size: (u32, u32), end_after: u32, fail_after: Option<u32>) -> Self {
        Self { info, size, served: 0, end_after, fail_after }
    }
}

impl StreamReader for ScriptedStream {
    fn info(&self) -> CaptureInfo {
        self.info
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        if self.fail_after.is_some_and(|n| self.served >= n) {
            return Err(VisionError::FrameDecode("connection reset".to_string()));
        }
        if self.served >= self.end_after {
            return Ok(None);
        }
        self.served += 1;
        std::thread::sleep(std::time::Duration::from_millis(2));
        Ok(Some(RgbImage::from_pixel(self.size.0, self.size.1, Rgb([10, 10, 10]))))
    }
}

pub fn capture(video: Arc<dyn VideoOpener>, streams: Arc<dyn StreamOpener>) -> Capture {
    Capture { video, streams, screen: Arc::new(FfmpegGrabber::default()) }
}

pub fn image_only_capture() -> Capture {
    capture(Arc::new(UnsupportedVideo), Arc::new(UnsupportedVideo))
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
    files.sort();
    files
}
