//! The inference loop: provider → preprocess → backend → NMS → sink

use crate::config::DetectConfig;
use crate::error::{Result, VisionError};
use crate::frames::{open_provider, Capture, Mode};
use crate::models::Backend;
use crate::paths::{file_stem_or, next_available_path};
use crate::postprocess::{non_max_suppression, NmsOptions};
use crate::preprocess::{check_img_size, InputTensor, Letterbox};
use crate::sink::{describe_counts, FrameDisplay, ResultSink, SinkOptions, LABELS_DIR};
use crate::source;
use crate::summary::{Profile, RunSummary, Speed};
use crate::video::VideoWriterFactory;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// Video writer used when none is supplied
#[cfg(feature = "opencv")]
pub fn default_writer_factory() -> Box<dyn VideoWriterFactory> {
    Box::new(crate::capture::CvWriterFactory)
}

#[cfg(not(feature = "opencv"))]
pub fn default_writer_factory() -> Box<dyn VideoWriterFactory> {
    Box::new(crate::video::FfmpegWriterFactory)
}

/// Display backend for `view_img`, if one is compiled in
#[cfg(feature = "opencv")]
pub fn default_display() -> Option<Box<dyn FrameDisplay>> {
    Some(Box::new(crate::capture::CvDisplay))
}

#[cfg(not(feature = "opencv"))]
pub fn default_display() -> Option<Box<dyn FrameDisplay>> {
    None
}

/// One configured detection run
pub struct Detector {
    config: DetectConfig,
    backend: Backend,
    capture: Capture,
    writer_factory: Box<dyn VideoWriterFactory>,
    display: Option<Box<dyn FrameDisplay>>,
}

impl Detector {
    /// Validate `config` and load its backend with the default capture stack.
    pub fn new(config: DetectConfig) -> Result<Self> {
        config.validate().map_err(VisionError::Config)?;
        let backend = Backend::load(&config)?;
        let display = if config.view_img { default_display() } else { None };
        Ok(Self::with_backend(config, backend, Capture::default(), default_writer_factory(), display))
    }

    /// Assemble a detector from already built parts.
    pub fn with_backend(
        config: DetectConfig,
        backend: Backend,
        capture: Capture,
        writer_factory: Box<dyn VideoWriterFactory>,
        display: Option<Box<dyn FrameDisplay>>,
    ) -> Self {
        Self { config, backend, capture, writer_factory, display }
    }

    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    /// Run detection over `config.source` until the provider is exhausted.
    ///
    /// The source must already be local; see [`detect`] for URL handling.
    pub fn run(self) -> Result<RunSummary> {
        let Self { config, mut backend, capture, writer_factory, display } = self;
        config.validate().map_err(VisionError::Config)?;

        let plan = source::classify(&config.source);
        if plan.download.is_some() {
            return Err(VisionError::SourceResolution(format!(
                "Remote source {} has to be downloaded before the run",
                config.source
            )));
        }

        let save_dir = next_available_path(&config.project.join(&config.name), config.exist_ok, "");
        fs::create_dir_all(if config.save_txt { save_dir.join(LABELS_DIR) } else { save_dir.clone() })?;
        info!("Saving results to {:?}", save_dir);

        let imgsz = check_img_size(config.imgsz, backend.stride());
        let letterbox = Letterbox::new(imgsz);
        let mut provider = open_provider(plan.kind, &config.source, letterbox, config.vid_stride, &capture)?;
        debug!("Opened {} provider with batch size {}", provider.mode(), provider.batch_size());

        backend.warmup(imgsz, provider.batch_size())?;
        let names = backend.names().to_vec();

        let mut sink = ResultSink::new(
            save_dir.clone(),
            SinkOptions::from_config(&config),
            names.clone(),
            config.font.as_deref(),
            writer_factory,
            display,
        );
        let nms = NmsOptions {
            conf_thres: config.conf_thres,
            iou_thres: config.iou_thres,
            classes: config.classes.clone(),
            agnostic: config.agnostic_nms,
            max_det: config.max_det,
        };

        let mut dt = [Profile::default(); 3];
        let mut seen = 0u64;

        while let Some(batch) = provider.next_batch() {
            let batch = batch?;
            let half = backend.is_half();
            let input = dt[0].time(|| InputTensor::from_pixels(&batch.pixels, half));
            let [_, _, input_h, input_w] = input.shape();
            let input_hw = (input_h as u32, input_w as u32);

            let visualize = if config.visualize {
                let stem = batch
                    .frames
                    .first()
                    .map(|f| file_stem_or(&f.path, "frame"))
                    .unwrap_or_else(|| "frame".to_string());
                let dir = next_available_path(&save_dir.join(stem), false, "");
                fs::create_dir_all(&dir)?;
                Some(dir)
            } else {
                None
            };

            let predictions = dt[1].time(|| backend.infer(&input, config.augment, visualize.as_deref()))?;
            let detections = dt[2].time(|| non_max_suppression(&predictions, &nms))?;

            for (i, (frame, dets)) in batch.frames.iter().zip(detections).enumerate() {
                seen += 1;
                let prefix = if batch.mode == Mode::Stream { format!("{}: ", i) } else { String::new() };
                let dets = sink.process(frame, batch.mode, input_hw, dets)?;
                debug!(
                    "{}{}{}x{} {}{}{:.1}ms",
                    prefix,
                    batch.description,
                    input_hw.0,
                    input_hw.1,
                    describe_counts(&dets, &names),
                    if dets.is_empty() { "(no detections), " } else { "" },
                    dt[1].last.as_secs_f64() * 1e3,
                );
            }

            for stream in provider.take_closed() {
                sink.release_stream(stream)?;
            }
        }

        let speed = Speed::from_profiles(&dt, seen);
        info!(
            "Speed: {:.1}ms pre-process, {:.1}ms inference, {:.1}ms NMS per image at shape (1, 3, {}, {})",
            speed.preprocess, speed.inference, speed.nms, imgsz.0, imgsz.1
        );

        let (counts, label_files) = sink.finish()?;
        if let Some(n) = label_files {
            info!("{} labels saved to {:?}", n, save_dir.join(LABELS_DIR));
        }
        info!("Results saved to {:?}", save_dir);

        let output_directory = fs::canonicalize(&save_dir).unwrap_or(save_dir);
        Ok(RunSummary {
            output_directory,
            counts: counts.to_vec(names.len()),
            seen,
            speed,
            label_files,
        })
    }
}

/// Resolve `config.source` (downloading remote files into the working
/// directory), load the backend and run detection on a blocking thread.
pub async fn detect(mut config: DetectConfig) -> Result<RunSummary> {
    config.validate().map_err(VisionError::Config)?;
    let cwd: PathBuf = std::env::current_dir()?;
    config.source = source::resolve(&config.source, &cwd).await?;

    tokio::task::spawn_blocking(move || Detector::new(config)?.run())
        .await
        .map_err(|e| VisionError::Backend(format!("Detection task failed: {}", e)))?
}
