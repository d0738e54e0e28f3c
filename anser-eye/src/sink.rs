//! Per-frame result persistence: labels, CSV, crops, overlays and videos

use crate::annotate::{class_color, load_font, save_one_box, Annotator};
use crate::config::{DetectConfig, LabelFormat};
use crate::error::Result;
use crate::frames::{Frame, Mode};
use crate::paths::{file_name_or, file_stem_or};
use crate::postprocess::{normalize_xywh, scale_boxes, Detection};
use crate::summary::ClassCounts;
use crate::video::{VideoWriterFactory, VideoWriterRegistry};
use image::RgbImage;
use rusttype::Font;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CSV_FILE: &str = "predictions.csv";
pub const CSV_HEADER: [&str; 3] = ["Image Name", "Prediction", "Confidence"];
pub const LABELS_DIR: &str = "labels";
pub const CROPS_DIR: &str = "crops";

/// Shows annotated frames in named windows
pub trait FrameDisplay: Send {
    fn create_window(&mut self, name: &str, width: u32, height: u32) -> Result<()>;

    fn show(&mut self, name: &str, frame: &RgbImage) -> Result<()>;
}

/// Format a number like C's `%g`: six significant digits, trailing zeros
/// dropped, exponent form outside `1e-4 ..= 1e6`.
pub fn format_g(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }

    let trim = |s: String| -> String {
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    };

    let sci = format!("{:.5e}", value);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);

    if !(-4..6).contains(&exp) {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim(mantissa.to_string()), sign, exp.abs())
    } else {
        let decimals = (5 - exp).max(0) as usize;
        trim(format!("{:.*}", decimals, value))
    }
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// `predictions.csv`, shared by every frame of a run
#[derive(Debug, Clone)]
pub struct CsvLog {
    path: PathBuf,
}

impl CsvLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first when the file is new.
    pub fn append(&self, image_name: &str, prediction: &str, confidence: f32) -> Result<()> {
        let is_new = !self.path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;

        let mut text = String::new();
        if is_new {
            text.push_str(&CSV_HEADER.map(csv_field).join(","));
            text.push_str("\r\n");
        }
        let confidence = format!("{:.2}", confidence);
        text.push_str(&[image_name, prediction, confidence.as_str()].map(csv_field).join(","));
        text.push_str("\r\n");
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// Sink switches taken from the run configuration
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub save_img: bool,
    pub save_txt: bool,
    pub save_format: LabelFormat,
    pub save_csv: bool,
    pub save_conf: bool,
    pub save_crop: bool,
    pub view_img: bool,
    pub hide_labels: bool,
    pub hide_conf: bool,
    pub line_thickness: u32,
}

impl SinkOptions {
    pub fn from_config(config: &DetectConfig) -> Self {
        Self {
            save_img: config.saves_images(),
            save_txt: config.save_txt,
            save_format: config.save_format,
            save_csv: config.save_csv,
            save_conf: config.save_conf,
            save_crop: config.save_crop,
            view_img: config.view_img,
            hide_labels: config.hide_labels,
            hide_conf: config.hide_conf,
            line_thickness: config.line_thickness,
        }
    }

    fn needs_overlay(&self) -> bool {
        self.save_img || self.save_crop || self.view_img
    }
}

/// Persists detections for each processed frame and tracks class counts
pub struct ResultSink {
    save_dir: PathBuf,
    opts: SinkOptions,
    names: Vec<String>,
    font: Option<Font<'static>>,
    counts: ClassCounts,
    csv: Option<CsvLog>,
    writers: VideoWriterRegistry,
    display: Option<Box<dyn FrameDisplay>>,
    windows: HashSet<String>,
}

impl ResultSink {
    pub fn new(
        save_dir: PathBuf,
        opts: SinkOptions,
        names: Vec<String>,
        font_path: Option<&Path>,
        writer_factory: Box<dyn VideoWriterFactory>,
        display: Option<Box<dyn FrameDisplay>>,
    ) -> Self {
        let font = if opts.needs_overlay() && !opts.hide_labels { load_font(font_path) } else { None };
        let csv = opts.save_csv.then(|| CsvLog::new(save_dir.join(CSV_FILE)));
        if opts.view_img && display.is_none() {
            warn!("Display requested but no display backend is available, frames will not be shown");
        }
        Self {
            save_dir,
            opts,
            names,
            font,
            counts: ClassCounts::new(),
            csv,
            writers: VideoWriterRegistry::new(writer_factory),
            display,
            windows: HashSet::new(),
        }
    }

    pub fn counts(&self) -> &ClassCounts {
        &self.counts
    }

    pub fn open_writers(&self) -> usize {
        self.writers.open_count()
    }

    fn class_name(&self, class_id: usize) -> String {
        self.names.get(class_id).cloned().unwrap_or_else(|| format!("class{}", class_id))
    }

    fn label_line(&self, det: &Detection, frame_hw: (u32, u32)) -> String {
        let coords = match self.opts.save_format {
            LabelFormat::Yolo => normalize_xywh(det.bbox, frame_hw),
            LabelFormat::PascalVoc => det.bbox,
        };

        let mut fields = vec![format_g(det.class_id as f64)];
        fields.extend(coords.iter().map(|&v| format_g(v as f64)));
        if self.opts.save_conf {
            fields.push(format_g(det.confidence as f64));
        }
        fields.join(" ")
    }

    fn append_label(path: &Path, line: &str) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Rescale `detections` from the `input_hw` canvas to `frame`, record
    /// counts and write every enabled output. Returns the rescaled detections.
    pub fn process(&mut self, frame: &Frame, mode: Mode, input_hw: (u32, u32), mut detections: Vec<Detection>) -> Result<Vec<Detection>> {
        let frame_hw = frame.shape();
        scale_boxes(input_hw, &mut detections, frame_hw);
        self.counts.record_frame(&detections);

        let image_name = file_name_or(&frame.path, "frame");
        let stem = file_stem_or(&frame.path, "frame");
        let label_path = match mode {
            Mode::Image => self.save_dir.join(LABELS_DIR).join(format!("{}.txt", stem)),
            _ => self.save_dir.join(LABELS_DIR).join(format!("{}_{}.txt", stem, frame.frame_index)),
        };

        let mut annotator = self
            .opts
            .needs_overlay()
            .then(|| Annotator::new(frame.image.clone(), self.opts.line_thickness, self.font.as_ref()));

        for det in detections.iter().rev() {
            let name = self.class_name(det.class_id);

            if let Some(csv) = &self.csv {
                csv.append(&image_name, &name, det.confidence)?;
            }

            if self.opts.save_txt {
                Self::append_label(&label_path, &self.label_line(det, frame_hw))?;
            }

            if let Some(annotator) = annotator.as_mut() {
                let label = if self.opts.hide_labels {
                    String::new()
                } else if self.opts.hide_conf {
                    name.clone()
                } else {
                    format!("{} {:.2}", name, det.confidence)
                };
                annotator.box_label(det.bbox, &label, class_color(det.class_id));
            }

            if self.opts.save_crop {
                let file = self.save_dir.join(CROPS_DIR).join(&name).join(format!("{}.jpg", stem));
                save_one_box(det.bbox, &frame.image, &file)?;
            }
        }

        let Some(annotator) = annotator else {
            return Ok(detections);
        };

        if self.opts.view_img {
            if let Some(display) = self.display.as_mut() {
                let window = frame.path.to_string_lossy().into_owned();
                if self.windows.insert(window.clone()) {
                    display.create_window(&window, frame_hw.1, frame_hw.0)?;
                }
                display.show(&window, annotator.result())?;
            }
        }

        if self.opts.save_img {
            let save_path = self.save_dir.join(&image_name);
            match mode {
                Mode::Image => {
                    annotator.result().save(&save_path)?;
                    debug!("Saved {:?}", save_path);
                }
                Mode::Video | Mode::Stream | Mode::Screen => {
                    self.writers.write(frame.stream, &save_path, annotator.result(), frame.capture)?;
                }
            }
        }

        Ok(detections)
    }

    /// Finalize the video of a stream that has closed.
    pub fn release_stream(&mut self, stream: usize) -> Result<()> {
        self.writers.release(stream)
    }

    /// Release video writers and return final counts plus the number of
    /// label files when text export is on.
    pub fn finish(mut self) -> Result<(ClassCounts, Option<usize>)> {
        self.writers.release_all()?;

        let label_files = if self.opts.save_txt {
            let dir = self.save_dir.join(LABELS_DIR);
            let count = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "txt"))
                .count();
            Some(count)
        } else {
            None
        };

        Ok((std::mem::take(&mut self.counts), label_files))
    }
}

/// `2 gooses, 1 egg, ` summary of one frame's detections.
pub fn describe_counts(detections: &[Detection], names: &[String]) -> String {
    let mut per_class: BTreeMap<usize, usize> = BTreeMap::new();
    for det in detections {
        *per_class.entry(det.class_id).or_insert(0) += 1;
    }
    per_class
        .into_iter()
        .map(|(class_id, n)| {
            let name = names.get(class_id).cloned().unwrap_or_else(|| format!("class{}", class_id));
            format!("{} {}{}, ", n, name, if n > 1 { "s" } else { "" })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::MockVideoWriterFactory;
    use image::Rgb;
    use tempfile::TempDir;

    fn options() -> SinkOptions {
        SinkOptions {
            save_img: false,
            save_txt: false,
            save_format: LabelFormat::Yolo,
            save_csv: false,
            save_conf: false,
            save_crop: false,
            view_img: false,
            hide_labels: false,
            hide_conf: false,
            line_thickness: 2,
        }
    }

    fn frame(path: &str) -> Frame {
        Frame {
            path: PathBuf::from(path),
            image: RgbImage::from_pixel(200, 100, Rgb([50, 50, 50])),
            stream: 0,
            frame_index: 7,
            capture: None,
        }
    }

    fn sink(dir: &Path, opts: SinkOptions) -> ResultSink {
        fs::create_dir_all(dir.join(LABELS_DIR)).unwrap();
        ResultSink::new(
            dir.to_path_buf(),
            opts,
            vec!["goose".into(), "egg".into()],
            None,
            Box::new(MockVideoWriterFactory::new()),
            None,
        )
    }

    #[test]
    fn test_format_g_matches_printf() {
        assert_eq!(format_g(0.0), "0");
        assert_eq!(format_g(1.0), "1");
        assert_eq!(format_g(0.5), "0.5");
        assert_eq!(format_g(0.123456789), "0.123457");
        assert_eq!(format_g(123.0), "123");
        assert_eq!(format_g(1234567.0), "1.23457e+06");
        assert_eq!(format_g(0.00001), "1e-05");
        assert_eq!(format_g(0.0001), "0.0001");
        assert_eq!(format_g(-2.5), "-2.5");
    }

    #[test]
    fn test_csv_header_written_once() {
        let dir = TempDir::new().unwrap();
        let csv = CsvLog::new(dir.path().join(CSV_FILE));
        csv.append("a.jpg", "goose", 0.914).unwrap();
        csv.append("b.jpg", "egg, large", 0.5).unwrap();

        let text = fs::read_to_string(csv.path()).unwrap();
        assert_eq!(
            text,
            "Image Name,Prediction,Confidence\r\na.jpg,goose,0.91\r\nb.jpg,\"egg, large\",0.50\r\n"
        );
    }

    #[test]
    fn test_yolo_labels_are_normalized() {
        let dir = TempDir::new().unwrap();
        let mut opts = options();
        opts.save_txt = true;
        opts.save_conf = true;
        let mut sink = sink(dir.path(), opts);

        let det = Detection { bbox: [0.0, 0.0, 100.0, 50.0], confidence: 0.5, class_id: 1 };
        // same canvas and frame shape, so no rescaling
        let frame = Frame { image: RgbImage::new(200, 100), ..frame("imgs/goose.jpg") };
        sink.process(&frame, Mode::Image, (100, 200), vec![det]).unwrap();

        let text = fs::read_to_string(dir.path().join("labels/goose.txt")).unwrap();
        assert_eq!(text, "1 0.25 0.25 0.5 0.5 0.5\n");
    }

    #[test]
    fn test_pascal_voc_labels_use_absolute_corners_and_frame_suffix() {
        let dir = TempDir::new().unwrap();
        let mut opts = options();
        opts.save_txt = true;
        opts.save_format = LabelFormat::PascalVoc;
        let mut sink = sink(dir.path(), opts);

        let det = Detection { bbox: [10.0, 20.0, 110.0, 70.0], confidence: 0.5, class_id: 0 };
        sink.process(&frame("clip.mp4"), Mode::Video, (100, 200), vec![det]).unwrap();

        let text = fs::read_to_string(dir.path().join("labels/clip_7.txt")).unwrap();
        assert_eq!(text, "0 10 20 110 70\n");
    }

    #[test]
    fn test_counts_and_reverse_export_order() {
        let dir = TempDir::new().unwrap();
        let mut opts = options();
        opts.save_csv = true;
        let mut sink = sink(dir.path(), opts);

        let dets = vec![
            Detection { bbox: [0.0, 0.0, 10.0, 10.0], confidence: 0.91, class_id: 0 },
            Detection { bbox: [20.0, 20.0, 40.0, 40.0], confidence: 0.77, class_id: 1 },
        ];
        let out = sink.process(&frame("goose.jpg"), Mode::Image, (100, 200), dets).unwrap();
        assert_eq!(out.len(), 2);

        let text = fs::read_to_string(dir.path().join(CSV_FILE)).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows[1], "goose.jpg,egg,0.77");
        assert_eq!(rows[2], "goose.jpg,goose,0.91");

        let (counts, labels) = sink.finish().unwrap();
        assert_eq!(counts.to_vec(3), vec![1, 1, 0]);
        assert_eq!(labels, None);
    }

    #[test]
    fn test_image_mode_saves_annotated_copy_and_crops() {
        let dir = TempDir::new().unwrap();
        let mut opts = options();
        opts.save_img = true;
        opts.save_crop = true;
        let mut sink = sink(dir.path(), opts);

        let det = Detection { bbox: [50.0, 20.0, 120.0, 80.0], confidence: 0.9, class_id: 0 };
        sink.process(&frame("in/goose.png"), Mode::Image, (100, 200), vec![det]).unwrap();

        assert!(dir.path().join("goose.png").exists());
        assert!(dir.path().join("crops/goose/goose.jpg").exists());
        assert_eq!(sink.open_writers(), 0);
    }

    #[test]
    fn test_describe_counts() {
        let names = vec!["goose".to_string(), "egg".to_string()];
        let dets = vec![
            Detection { bbox: [0.0; 4], confidence: 0.9, class_id: 0 },
            Detection { bbox: [0.0; 4], confidence: 0.9, class_id: 0 },
            Detection { bbox: [0.0; 4], confidence: 0.9, class_id: 1 },
        ];
        assert_eq!(describe_counts(&dets, &names), "2 gooses, 1 egg, ");
    }
}
