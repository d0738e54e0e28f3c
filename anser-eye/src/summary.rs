//! Run accounting: class counts, phase timing and the final result

use crate::postprocess::Detection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Per-class detection counts for a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassCounts {
    counts: BTreeMap<usize, u64>,
}

impl ClassCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store this frame's count for every class it contains. Classes absent
    /// from the frame keep their previous value.
    pub fn record_frame(&mut self, detections: &[Detection]) {
        let mut frame: BTreeMap<usize, u64> = BTreeMap::new();
        for det in detections {
            *frame.entry(det.class_id).or_insert(0) += 1;
        }
        self.counts.extend(frame);
    }

    pub fn get(&self, class_id: usize) -> Option<u64> {
        self.counts.get(&class_id).copied()
    }

    /// Counts ordered by class index, zero for unseen classes.
    pub fn to_vec(&self, num_classes: usize) -> Vec<u64> {
        (0..num_classes).map(|i| self.get(i).unwrap_or(0)).collect()
    }
}

/// Accumulated wall time of one pipeline phase
#[derive(Debug, Clone, Copy, Default)]
pub struct Profile {
    pub total: Duration,
    pub last: Duration,
}

impl Profile {
    pub fn time<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.last = start.elapsed();
        self.total += self.last;
        out
    }
}

/// Average milliseconds per image for each phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Speed {
    pub preprocess: f64,
    pub inference: f64,
    pub nms: f64,
}

impl Speed {
    pub fn from_profiles(profiles: &[Profile; 3], seen: u64) -> Self {
        if seen == 0 {
            return Self::default();
        }
        let per_image = |p: &Profile| p.total.as_secs_f64() * 1e3 / seen as f64;
        Self {
            preprocess: per_image(&profiles[0]),
            inference: per_image(&profiles[1]),
            nms: per_image(&profiles[2]),
        }
    }
}

/// Result of a detection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(rename = "outputDirectory")]
    pub output_directory: PathBuf,
    /// Indexed by class, sized to the model's class table
    pub counts: Vec<u64>,
    #[serde(skip)]
    pub seen: u64,
    #[serde(skip)]
    pub speed: Speed,
    /// Label files under `labels/`, when text export is on
    #[serde(skip)]
    pub label_files: Option<usize>,
}

impl RunSummary {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
