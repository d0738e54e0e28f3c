//! Screen capture provider

use super::{Frame, FrameBatch, FrameProvider, Mode, ScreenGrabber};
use crate::error::{Result, VisionError};
use crate::preprocess::Letterbox;
use image::RgbImage;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Region of a screen to capture; missing geometry means the whole screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenRegion {
    pub screen: u32,
    pub left: Option<u32>,
    pub top: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ScreenRegion {
    /// Parse `screen`, `screen N`, `screen L T W H` or `screen N L T W H`.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let params: Vec<&str> = descriptor.split_whitespace().skip(1).collect();
        let numbers = params
            .iter()
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| VisionError::SourceResolution(format!("Invalid screen descriptor '{}'", descriptor)))?;

        let region = |screen: u32, geometry: &[u32]| ScreenRegion {
            screen,
            left: Some(geometry[0]),
            top: Some(geometry[1]),
            width: Some(geometry[2]),
            height: Some(geometry[3]),
        };

        match numbers.as_slice() {
            [] => Ok(ScreenRegion::default()),
            [screen] => Ok(ScreenRegion { screen: *screen, ..Default::default() }),
            [l, t, w, h] => Ok(region(0, &[*l, *t, *w, *h])),
            [screen, l, t, w, h] => Ok(region(*screen, &[*l, *t, *w, *h])),
            _ => Err(VisionError::SourceResolution(format!(
                "Invalid screen descriptor '{}': expected 'screen [index] [left top width height]'",
                descriptor
            ))),
        }
    }
}

/// Grabs single frames through `ffmpeg -f x11grab`
#[derive(Debug, Clone)]
pub struct FfmpegGrabber {
    /// X display, `$DISPLAY` or `:0`
    pub display: String,
}

impl Default for FfmpegGrabber {
    fn default() -> Self {
        Self {
            display: std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string()),
        }
    }
}

impl ScreenGrabber for FfmpegGrabber {
    fn grab(&self, region: &ScreenRegion) -> Result<RgbImage> {
        let display = self.display.split('.').next().unwrap_or(":0");
        let input = format!(
            "{}.{}+{},{}",
            display,
            region.screen,
            region.left.unwrap_or(0),
            region.top.unwrap_or(0)
        );

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg("x11grab");

        if let (Some(w), Some(h)) = (region.width, region.height) {
            cmd.arg("-video_size").arg(format!("{}x{}", w, h));
        }

        cmd.arg("-i")
            .arg(&input)
            .arg("-frames:v")
            .arg("1")
            .arg("-f")
            .arg("image2pipe")
            .arg("-vcodec")
            .arg("png")
            .arg("-")
            .stdin(Stdio::null());

        let output = cmd
            .output()
            .map_err(|e| VisionError::FrameDecode(format!("Failed to run ffmpeg screen grab: {}", e)))?;
        if !output.status.success() {
            return Err(VisionError::FrameDecode(format!(
                "ffmpeg screen grab of {} failed: {}",
                input,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        image::load_from_memory(&output.stdout)
            .map(|img| img.to_rgb8())
            .map_err(|e| VisionError::FrameDecode(format!("Invalid screen grab: {}", e)))
    }
}

/// Endless sequence of screen captures
pub struct Screenshots {
    region: ScreenRegion,
    letterbox: Letterbox,
    grabber: Arc<dyn ScreenGrabber>,
    frame: u64,
}

impl Screenshots {
    pub fn new(region: ScreenRegion, letterbox: Letterbox, grabber: Arc<dyn ScreenGrabber>) -> Self {
        Self { region, letterbox, grabber, frame: 0 }
    }

    fn capture(&mut self) -> Result<FrameBatch> {
        let image = self.grabber.grab(&self.region)?;
        self.frame += 1;

        let description = format!(
            "screen {} (LTWH): {},{},{},{}: ",
            self.region.screen,
            self.region.left.unwrap_or(0),
            self.region.top.unwrap_or(0),
            self.region.width.unwrap_or(image.width()),
            self.region.height.unwrap_or(image.height())
        );
        let pixels = self.letterbox.batch(&[&image]);
        let frame = Frame {
            path: PathBuf::from(format!("screen{}", self.region.screen)),
            image,
            stream: 0,
            frame_index: self.frame,
            capture: None,
        };
        Ok(FrameBatch { frames: vec![frame], pixels, mode: Mode::Screen, description })
    }
}

impl FrameProvider for Screenshots {
    fn next_batch(&mut self) -> Option<Result<FrameBatch>> {
        Some(self.capture())
    }

    fn batch_size(&self) -> usize {
        1
    }

    fn mode(&self) -> Mode {
        Mode::Screen
    }
}
