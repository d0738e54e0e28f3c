//! Finite sequence of image and video files

use super::{Frame, FrameBatch, FrameProvider, Mode, VideoOpener, VideoReader};
use crate::error::{Result, VisionError};
use crate::preprocess::Letterbox;
use crate::source::is_video_path;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

struct OpenVideo {
    reader: Box<dyn VideoReader>,
    frame: u64,
    frames: u64,
}

/// Images first, then videos, one frame per batch
pub struct FileSequence {
    files: Vec<PathBuf>,
    count: usize,
    letterbox: Letterbox,
    vid_stride: u32,
    opener: Arc<dyn VideoOpener>,
    video: Option<OpenVideo>,
    mode: Mode,
}

impl FileSequence {
    pub fn new(files: Vec<PathBuf>, letterbox: Letterbox, vid_stride: u32, opener: Arc<dyn VideoOpener>) -> Self {
        let mode = match files.first() {
            Some(first) if is_video_path(first) => Mode::Video,
            _ => Mode::Image,
        };
        Self {
            files,
            count: 0,
            letterbox,
            vid_stride: vid_stride.max(1),
            opener,
            video: None,
            mode,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn batch(&self, frame: Frame, mode: Mode, description: String) -> FrameBatch {
        let pixels = self.letterbox.batch(&[&frame.image]);
        FrameBatch { frames: vec![frame], pixels, mode, description }
    }

    fn next_image(&mut self) -> Result<FrameBatch> {
        let path = self.files[self.count].clone();
        self.count += 1;

        let image = image::open(&path)
            .map_err(|e| VisionError::FrameDecode(format!("Image not found or unreadable {:?}: {}", path, e)))?
            .to_rgb8();
        let description = format!("image {}/{} {}: ", self.count, self.files.len(), path.display());
        let frame = Frame { path, image, stream: 0, frame_index: 0, capture: None };
        Ok(self.batch(frame, Mode::Image, description))
    }

    /// Next strided frame of the current or following videos; `None` when all are done.
    fn next_video_frame(&mut self) -> Result<Option<FrameBatch>> {
        loop {
            if self.video.is_none() {
                if self.count >= self.files.len() {
                    return Ok(None);
                }
                let path = &self.files[self.count];
                let reader = self.opener.open(path)?;
                let frames = reader.frame_count() / self.vid_stride as u64;
                debug!("Opened video {:?} ({} frames at stride {})", path, frames, self.vid_stride);
                self.video = Some(OpenVideo { reader, frame: 0, frames });
            }

            let Some(video) = self.video.as_mut() else { continue };
            for _ in 1..self.vid_stride {
                if !video.reader.grab()? {
                    break;
                }
            }

            match video.reader.read()? {
                Some(image) => {
                    video.frame += 1;
                    let info = video.reader.info().sanitized();
                    let path = self.files[self.count].clone();
                    let description = format!(
                        "video {}/{} (frame {}/{}) {}: ",
                        self.count + 1,
                        self.files.len(),
                        video.frame,
                        video.frames,
                        path.display()
                    );
                    let frame = Frame {
                        path,
                        image,
                        stream: 0,
                        frame_index: video.frame,
                        capture: Some(info),
                    };
                    return Ok(Some(self.batch(frame, Mode::Video, description)));
                }
                None => {
                    self.video = None;
                    self.count += 1;
                }
            }
        }
    }

    fn step(&mut self) -> Result<Option<FrameBatch>> {
        if self.video.is_none() {
            if self.count >= self.files.len() {
                return Ok(None);
            }
            if !is_video_path(&self.files[self.count]) {
                self.mode = Mode::Image;
                return self.next_image().map(Some);
            }
        }
        self.mode = Mode::Video;
        self.next_video_frame()
    }
}

impl FrameProvider for FileSequence {
    fn next_batch(&mut self) -> Option<Result<FrameBatch>> {
        self.step().transpose()
    }

    fn batch_size(&self) -> usize {
        1
    }

    fn mode(&self) -> Mode {
        self.mode
    }
}
