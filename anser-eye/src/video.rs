//! Video output: encoders and the per-stream writer registry

use crate::error::{Result, VisionError};
use crate::frames::{CaptureInfo, FALLBACK_FPS};
use image::{imageops, RgbImage};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info, warn};

/// An open video file accepting frames of a fixed size
pub trait VideoEncoder: Send {
    fn write(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush and close the file.
    fn release(&mut self) -> Result<()>;
}

/// Opens encoders for new output files
#[cfg_attr(test, mockall::automock)]
pub trait VideoWriterFactory: Send {
    fn open(&self, path: &Path, fps: f64, width: u32, height: u32) -> Result<Box<dyn VideoEncoder>>;
}

/// Encodes through an `ffmpeg` child process fed raw RGB frames
#[derive(Debug, Clone, Default)]
pub struct FfmpegWriterFactory;

impl VideoWriterFactory for FfmpegWriterFactory {
    fn open(&self, path: &Path, fps: f64, width: u32, height: u32) -> Result<Box<dyn VideoEncoder>> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s")
            .arg(format!("{}x{}", width, height))
            .arg("-r")
            .arg(format!("{}", fps))
            .arg("-i")
            .arg("-")
            .arg("-an")
            .arg("-c:v")
            .arg("mpeg4")
            .arg("-q:v")
            .arg("3")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| VisionError::Io(std::io::Error::new(e.kind(), format!("Failed to start ffmpeg: {}", e))))?;
        let stdin = child.stdin.take();

        Ok(Box::new(FfmpegEncoder {
            path: path.to_path_buf(),
            child,
            stdin,
            width,
            height,
        }))
    }
}

struct FfmpegEncoder {
    path: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl VideoEncoder for FfmpegEncoder {
    fn write(&mut self, frame: &RgbImage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VisionError::Io(std::io::Error::other("Video writer already released")))?;

        if frame.dimensions() == (self.width, self.height) {
            stdin.write_all(frame.as_raw())?;
        } else {
            let resized = imageops::resize(frame, self.width, self.height, imageops::FilterType::Triangle);
            stdin.write_all(resized.as_raw())?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.stdin.take().is_none() {
            return Ok(());
        }
        let status = self.child.wait()?;
        if !status.success() {
            return Err(VisionError::Io(std::io::Error::other(format!(
                "ffmpeg exited with {} while writing {:?}",
                status, self.path
            ))));
        }
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{}", e);
        }
    }
}

struct WriterState {
    /// Output path as requested, before the `.mp4` suffix is forced
    path: PathBuf,
    writer: Option<Box<dyn VideoEncoder>>,
}

/// One open writer per stream, reopened whenever the stream's output path changes
pub struct VideoWriterRegistry {
    factory: Box<dyn VideoWriterFactory>,
    writers: HashMap<usize, WriterState>,
}

impl VideoWriterRegistry {
    pub fn new(factory: Box<dyn VideoWriterFactory>) -> Self {
        Self { factory, writers: HashMap::new() }
    }

    /// Append `frame` to the video for `stream`, switching files when `path` changes.
    pub fn write(&mut self, stream: usize, path: &Path, frame: &RgbImage, capture: Option<CaptureInfo>) -> Result<()> {
        let reopen = self.writers.get(&stream).map_or(true, |state| state.path != path);

        if reopen {
            if let Some(mut old) = self.writers.remove(&stream) {
                if let Some(mut writer) = old.writer.take() {
                    writer.release()?;
                }
            }

            let (fps, width, height) = match capture {
                Some(info) if info.width > 0 && info.height > 0 => (info.fps, info.width, info.height),
                Some(info) => (info.fps, frame.width(), frame.height()),
                None => (FALLBACK_FPS, frame.width(), frame.height()),
            };
            let output = path.with_extension("mp4");
            info!("Writing video {:?} ({}x{} at {:.2} FPS)", output, width, height, fps);
            let writer = self.factory.open(&output, fps, width, height)?;
            self.writers.insert(stream, WriterState { path: path.to_path_buf(), writer: Some(writer) });
        }

        match self.writers.get_mut(&stream).and_then(|state| state.writer.as_mut()) {
            Some(writer) => writer.write(frame),
            None => Err(VisionError::Io(std::io::Error::other(format!("No video writer for stream {}", stream)))),
        }
    }

    /// Close the writer of a stream that will deliver no more frames.
    pub fn release(&mut self, stream: usize) -> Result<()> {
        match self.writers.remove(&stream).and_then(|mut state| state.writer.take()) {
            Some(mut writer) => {
                debug!("Releasing video writer for closed stream {}", stream);
                writer.release()
            }
            None => Ok(()),
        }
    }

    /// Number of writers currently holding a file open.
    pub fn open_count(&self) -> usize {
        self.writers.values().filter(|state| state.writer.is_some()).count()
    }

    /// Close every writer. Errors are logged; the first one is returned.
    pub fn release_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for (stream, state) in self.writers.iter_mut() {
            if let Some(mut writer) = state.writer.take() {
                debug!("Releasing video writer for stream {}", stream);
                if let Err(e) = writer.release() {
                    warn!("Failed to release video writer for stream {}: {}", stream, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for VideoWriterRegistry {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}
