//! Box overlays and crops

use crate::error::Result;
use crate::paths::next_available_path;
use crate::postprocess::{xywh_to_xyxy, xyxy_to_xywh};
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PALETTE: [&str; 20] = [
    "FF3838", "FF9D97", "FF701F", "FFB21D", "CFD231", "48F90A", "92CC17", "3DDB86", "1A9334", "00D4BB",
    "2C99A8", "00C2FF", "344593", "6473FF", "0018EC", "8438FF", "520085", "CB38FF", "FF95C8", "FF37C7",
];

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/Library/Fonts/Arial.ttf",
];

const CROP_GAIN: f32 = 1.02;
const CROP_PAD: f32 = 10.0;

/// Palette colour for a class index.
pub fn class_color(class_id: usize) -> Rgb<u8> {
    let hex = PALETTE[class_id % PALETTE.len()];
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0);
    Rgb([channel(0), channel(2), channel(4)])
}

/// Load a TrueType font from `path`, or the first system font found.
///
/// Returns `None` when nothing loads; labels are then skipped.
pub fn load_font(path: Option<&Path>) -> Option<Font<'static>> {
    let candidates: Vec<PathBuf> = match path {
        Some(path) => vec![path.to_path_buf()],
        None => FONT_CANDIDATES.iter().map(PathBuf::from).collect(),
    };

    for candidate in &candidates {
        if let Ok(bytes) = fs::read(candidate) {
            if let Some(font) = Font::try_from_vec(bytes) {
                debug!("Loaded label font {:?}", candidate);
                return Some(font);
            }
        }
    }
    warn!("No usable label font found (tried {:?}), labels will not be drawn", candidates);
    None
}

/// Draws labelled boxes onto a copy of a frame
pub struct Annotator<'a> {
    image: RgbImage,
    line_width: u32,
    font: Option<&'a Font<'static>>,
}

impl<'a> Annotator<'a> {
    pub fn new(image: RgbImage, line_width: u32, font: Option<&'a Font<'static>>) -> Self {
        Self { image, line_width: line_width.max(1), font }
    }

    /// Outline `bbox` and, when `label` is non-empty, put it on a filled tab
    /// above the box (or inside when there is no room).
    pub fn box_label(&mut self, bbox: [f32; 4], label: &str, color: Rgb<u8>) {
        let (w, h) = self.image.dimensions();
        if w == 0 || h == 0 {
            return;
        }
        let x1 = (bbox[0].max(0.0) as i32).min(w as i32 - 1);
        let y1 = (bbox[1].max(0.0) as i32).min(h as i32 - 1);
        let x2 = (bbox[2].max(0.0) as i32).min(w as i32 - 1);
        let y2 = (bbox[3].max(0.0) as i32).min(h as i32 - 1);

        for t in 0..self.line_width as i32 {
            let (bw, bh) = (x2 - x1 - 2 * t + 1, y2 - y1 - 2 * t + 1);
            if bw <= 0 || bh <= 0 {
                break;
            }
            draw_hollow_rect_mut(&mut self.image, Rect::at(x1 + t, y1 + t).of_size(bw as u32, bh as u32), color);
        }

        let Some(font) = self.font else { return };
        if label.is_empty() {
            return;
        }

        let scale = Scale::uniform((self.line_width as f32 * 22.0 / 3.0).max(10.0));
        let (text_w, text_h) = text_size(scale, font, label);
        let (text_w, text_h) = (text_w.max(1), text_h.max(1));
        let outside = y1 - text_h >= 3;
        let tab_y = if outside { y1 - text_h - 3 } else { y1 };
        draw_filled_rect_mut(
            &mut self.image,
            Rect::at(x1, tab_y).of_size(text_w as u32 + 2, text_h as u32 + 3),
            color,
        );
        draw_text_mut(&mut self.image, Rgb([255, 255, 255]), x1 + 1, tab_y + 1, scale, font, label);
    }

    pub fn result(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

/// Crop region for a box, enlarged by gain and padding and clipped to the frame.
pub fn crop_bounds(bbox: [f32; 4], width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let mut b = xyxy_to_xywh(bbox);
    b[2] = b[2] * CROP_GAIN + CROP_PAD;
    b[3] = b[3] * CROP_GAIN + CROP_PAD;
    let [x1, y1, x2, y2] = xywh_to_xyxy(b);

    let clip = |v: f32, max: u32| (v.trunc().max(0.0) as u32).min(max);
    let (x1, y1) = (clip(x1, width), clip(y1, height));
    let (x2, y2) = (clip(x2, width), clip(y2, height));
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some((x1, y1, x2 - x1, y2 - y1))
}

/// Save the enlarged box region of `image` as a JPEG at the first free
/// variant of `file`. Returns the written path, `None` for empty crops.
pub fn save_one_box(bbox: [f32; 4], image: &RgbImage, file: &Path) -> Result<Option<PathBuf>> {
    let Some((x, y, w, h)) = crop_bounds(bbox, image.width(), image.height()) else {
        debug!("Skipping empty crop for box {:?}", bbox);
        return Ok(None);
    };

    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    let path = next_available_path(file, false, "").with_extension("jpg");
    let crop = imageops::crop_imm(image, x, y, w, h).to_image();
    crop.save(&path)?;
    Ok(Some(path))
}
