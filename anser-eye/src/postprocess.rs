//! Box geometry and non-maximum suppression for YOLO-style predictions

use crate::error::{Result, VisionError};
use ndarray::{Array3, ArrayView1, Axis};
use std::cmp::Ordering;

/// Maximum box side in pixels, used to offset boxes per class
const MAX_WH: f32 = 7680.0;
/// Candidates kept before the IoU pass
const MAX_NMS: usize = 30_000;

/// One detected object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// x1, y1, x2, y2
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: usize,
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
}

/// Corners to centre/size.
pub fn xyxy_to_xywh(b: [f32; 4]) -> [f32; 4] {
    [
        (b[0] + b[2]) / 2.0,
        (b[1] + b[3]) / 2.0,
        b[2] - b[0],
        b[3] - b[1],
    ]
}

/// Centre/size to corners.
pub fn xywh_to_xyxy(b: [f32; 4]) -> [f32; 4] {
    let (half_w, half_h) = (b[2] / 2.0, b[3] / 2.0);
    [b[0] - half_w, b[1] - half_h, b[0] + half_w, b[1] + half_h]
}

/// Corner box in pixels to centre/size normalized by a `(height, width)` frame.
pub fn normalize_xywh(b: [f32; 4], frame_hw: (u32, u32)) -> [f32; 4] {
    let (h, w) = (frame_hw.0 as f32, frame_hw.1 as f32);
    let [cx, cy, bw, bh] = xyxy_to_xywh(b);
    [cx / w, cy / h, bw / w, bh / h]
}

/// Inverse of [`normalize_xywh`].
pub fn denormalize_xywh(b: [f32; 4], frame_hw: (u32, u32)) -> [f32; 4] {
    let (h, w) = (frame_hw.0 as f32, frame_hw.1 as f32);
    xywh_to_xyxy([b[0] * w, b[1] * h, b[2] * w, b[3] * h])
}

/// Intersection over union of two corner boxes.
pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = inter_w * inter_h;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;

    if union <= 0.0 || !union.is_finite() {
        0.0
    } else {
        intersection / union
    }
}

/// Map boxes from a letterboxed `from` (h, w) canvas back onto a `to` (h, w)
/// frame, clipped to the frame and rounded to whole pixels.
pub fn scale_boxes(from: (u32, u32), detections: &mut [Detection], to: (u32, u32)) {
    let (from_h, from_w) = (from.0 as f32, from.1 as f32);
    let (to_h, to_w) = (to.0 as f32, to.1 as f32);
    let gain = (from_h / to_h).min(from_w / to_w);
    let pad_x = ((from_w - to_w * gain) / 2.0 - 0.1).round();
    let pad_y = ((from_h - to_h * gain) / 2.0 - 0.1).round();

    for det in detections {
        let b = &mut det.bbox;
        b[0] = ((b[0] - pad_x) / gain).clamp(0.0, to_w).round();
        b[2] = ((b[2] - pad_x) / gain).clamp(0.0, to_w).round();
        b[1] = ((b[1] - pad_y) / gain).clamp(0.0, to_h).round();
        b[3] = ((b[3] - pad_y) / gain).clamp(0.0, to_h).round();
    }
}

/// Suppression parameters
#[derive(Debug, Clone)]
pub struct NmsOptions {
    pub conf_thres: f32,
    pub iou_thres: f32,
    /// Keep only these classes
    pub classes: Option<Vec<usize>>,
    /// Suppress across classes instead of per class
    pub agnostic: bool,
    pub max_det: usize,
}

impl Default for NmsOptions {
    fn default() -> Self {
        Self {
            conf_thres: 0.25,
            iou_thres: 0.45,
            classes: None,
            agnostic: false,
            max_det: 300,
        }
    }
}

fn by_confidence_desc(a: &Detection, b: &Detection) -> Ordering {
    b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal)
}

fn candidate(row: ArrayView1<f32>, opts: &NmsOptions) -> Option<Detection> {
    let objectness = row[4];
    if !(objectness > opts.conf_thres) {
        return None;
    }

    let (class_id, class_prob) = row
        .iter()
        .skip(5)
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best });
    let confidence = class_prob * objectness;
    if !(confidence > opts.conf_thres) {
        return None;
    }

    if let Some(classes) = &opts.classes {
        if !classes.contains(&class_id) {
            return None;
        }
    }

    let bbox = xywh_to_xyxy([row[0], row[1], row[2], row[3]]);
    if bbox.iter().any(|v| !v.is_finite()) {
        return None;
    }

    Some(Detection { bbox, confidence, class_id })
}

/// Greedy IoU suppression over raw predictions of shape
/// `[batch, boxes, 5 + classes]` (cx, cy, w, h, objectness, class scores).
///
/// Returns one list per batch item, sorted by confidence, at most
/// `max_det` long.
pub fn non_max_suppression(prediction: &Array3<f32>, opts: &NmsOptions) -> Result<Vec<Vec<Detection>>> {
    if !(0.0..=1.0).contains(&opts.conf_thres) {
        return Err(VisionError::Config(format!(
            "Invalid confidence threshold {}, valid values are between 0.0 and 1.0",
            opts.conf_thres
        )));
    }
    if !(0.0..=1.0).contains(&opts.iou_thres) {
        return Err(VisionError::Config(format!(
            "Invalid IoU threshold {}, valid values are between 0.0 and 1.0",
            opts.iou_thres
        )));
    }
    if prediction.dim().2 < 6 {
        return Err(VisionError::Backend(format!(
            "Prediction rows need at least 6 values, got {}",
            prediction.dim().2
        )));
    }

    let mut output = Vec::with_capacity(prediction.dim().0);
    for image in prediction.axis_iter(Axis(0)) {
        let mut candidates: Vec<Detection> = image
            .axis_iter(Axis(0))
            .filter_map(|row| candidate(row, opts))
            .collect();

        candidates.sort_by(by_confidence_desc);
        candidates.truncate(MAX_NMS);

        let offset = |d: &Detection| {
            let shift = if opts.agnostic { 0.0 } else { d.class_id as f32 * MAX_WH };
            [d.bbox[0] + shift, d.bbox[1] + shift, d.bbox[2] + shift, d.bbox[3] + shift]
        };

        let mut keep: Vec<Detection> = Vec::new();
        let mut kept_boxes: Vec<[f32; 4]> = Vec::new();
        for det in candidates {
            if keep.len() >= opts.max_det {
                break;
            }
            let shifted = offset(&det);
            if kept_boxes.iter().all(|k| box_iou(k, &shifted) <= opts.iou_thres) {
                kept_boxes.push(shifted);
                keep.push(det);
            }
        }
        output.push(keep);
    }

    Ok(output)
}
