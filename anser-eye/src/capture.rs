//! OpenCV-backed video decoding, stream capture, video encoding and display windows

use crate::error::{Result, VisionError};
use crate::frames::{CaptureInfo, StreamOpener, StreamReader, VideoOpener, VideoReader};
use crate::sink::FrameDisplay;
use crate::video::{VideoEncoder, VideoWriterFactory};
use image::{ImageBuffer, RgbImage};
use opencv::{
    core::{Mat, Size},
    highgui, imgproc,
    prelude::*,
    videoio::{VideoCapture, VideoWriter, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH},
};
use std::path::Path;
use tracing::info;

/// BGR `Mat` to RGB image.
pub fn mat_to_rgb(mat: &Mat) -> Result<RgbImage> {
    let (rows, cols) = (mat.rows(), mat.cols());
    let mut rgb = Mat::default();
    imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let data = rgb.data_bytes()?;
    ImageBuffer::from_raw(cols as u32, rows as u32, data.to_vec())
        .ok_or_else(|| VisionError::FrameDecode("Failed to create image buffer from frame".to_string()))
}

/// RGB image to BGR `Mat`.
pub fn rgb_to_mat(image: &RgbImage) -> Result<Mat> {
    let mat = Mat::from_slice(image.as_raw())?;
    let reshaped = mat.reshape(3, image.height() as i32)?;
    let mut bgr = Mat::default();
    imgproc::cvt_color(&reshaped, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr)
}

fn capture_info(capture: &VideoCapture) -> CaptureInfo {
    CaptureInfo {
        fps: capture.get(CAP_PROP_FPS).unwrap_or(0.0),
        width: capture.get(CAP_PROP_FRAME_WIDTH).unwrap_or(0.0).max(0.0) as u32,
        height: capture.get(CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0).max(0.0) as u32,
    }
    .sanitized()
}

fn read_frame(capture: &mut VideoCapture, retrieve_only: bool) -> Result<Option<RgbImage>> {
    let mut frame = Mat::default();
    let ok = if retrieve_only {
        capture.retrieve(&mut frame, 0)?
    } else {
        capture.read(&mut frame)?
    };
    if !ok || frame.empty() {
        return Ok(None);
    }
    mat_to_rgb(&frame).map(Some)
}

/// Video files through `cv::VideoCapture`
pub struct CvVideoOpener;

impl VideoOpener for CvVideoOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoReader>> {
        let capture = VideoCapture::from_file(&path.to_string_lossy(), CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(VisionError::SourceResolution(format!("Failed to open video {:?}", path)));
        }
        Ok(Box::new(CvVideo { capture }))
    }
}

struct CvVideo {
    capture: VideoCapture,
}

impl VideoReader for CvVideo {
    fn info(&self) -> CaptureInfo {
        capture_info(&self.capture)
    }

    fn frame_count(&self) -> u64 {
        self.capture.get(CAP_PROP_FRAME_COUNT).unwrap_or(0.0).max(0.0) as u64
    }

    fn grab(&mut self) -> Result<bool> {
        Ok(self.capture.grab()?)
    }

    fn retrieve(&mut self) -> Result<Option<RgbImage>> {
        read_frame(&mut self.capture, true)
    }
}

/// Webcams (numeric index) and network streams
pub struct CvStreamOpener;

impl StreamOpener for CvStreamOpener {
    fn open(&self, source: &str) -> Result<Box<dyn StreamReader>> {
        let capture = match source.parse::<i32>() {
            Ok(index) => VideoCapture::new(index, CAP_ANY)?,
            Err(_) => VideoCapture::from_file(source, CAP_ANY)?,
        };
        if !capture.is_opened()? {
            return Err(VisionError::SourceResolution(format!("Failed to open {}", source)));
        }
        Ok(Box::new(CvStream { capture }))
    }
}

struct CvStream {
    capture: VideoCapture,
}

impl StreamReader for CvStream {
    fn info(&self) -> CaptureInfo {
        capture_info(&self.capture)
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        match read_frame(&mut self.capture, false) {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(VisionError::FrameDecode("Stream returned an empty frame".to_string())),
            Err(e) => Err(VisionError::FrameDecode(e.to_string())),
        }
    }
}

/// `cv::VideoWriter` with the mp4v codec
pub struct CvWriterFactory;

impl VideoWriterFactory for CvWriterFactory {
    fn open(&self, path: &Path, fps: f64, width: u32, height: u32) -> Result<Box<dyn VideoEncoder>> {
        let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
        let writer = VideoWriter::new(
            &path.to_string_lossy(),
            fourcc,
            fps,
            Size::new(width as i32, height as i32),
            true,
        )?;
        if !writer.is_opened()? {
            return Err(VisionError::OpenCv(format!("Failed to create video writer for {:?}", path)));
        }
        Ok(Box::new(CvWriter { writer, size: (width, height) }))
    }
}

struct CvWriter {
    writer: VideoWriter,
    size: (u32, u32),
}

impl VideoEncoder for CvWriter {
    fn write(&mut self, frame: &RgbImage) -> Result<()> {
        let mut mat = rgb_to_mat(frame)?;
        if frame.dimensions() != self.size {
            let mut resized = Mat::default();
            imgproc::resize(
                &mat,
                &mut resized,
                Size::new(self.size.0 as i32, self.size.1 as i32),
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )?;
            mat = resized;
        }
        self.writer.write(&mat)?;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        Ok(self.writer.release()?)
    }
}

/// `cv::imshow` windows
pub struct CvDisplay;

impl FrameDisplay for CvDisplay {
    fn create_window(&mut self, name: &str, width: u32, height: u32) -> Result<()> {
        highgui::named_window(name, highgui::WINDOW_NORMAL | highgui::WINDOW_KEEPRATIO)?;
        highgui::resize_window(name, width as i32, height as i32)?;
        info!("Opened display window {}", name);
        Ok(())
    }

    fn show(&mut self, name: &str, frame: &RgbImage) -> Result<()> {
        highgui::imshow(name, &rgb_to_mat(frame)?)?;
        highgui::wait_key(1)?;
        Ok(())
    }
}
