//! Live multi-stream provider with one capture thread per stream

use super::{Frame, FrameBatch, FrameProvider, Mode, StreamOpener, StreamReader};
use crate::error::{Result, VisionError};
use crate::preprocess::Letterbox;
use image::RgbImage;
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Latest frame published by one stream
struct Slot {
    source: String,
    image: Option<RgbImage>,
    /// Frames published so far
    seq: u64,
    /// `seq` of the last frame handed to the consumer
    delivered: u64,
    open: bool,
}

impl Slot {
    fn has_fresh(&self) -> bool {
        self.seq > self.delivered
    }
}

struct Hub {
    slots: Mutex<Vec<Slot>>,
    ready: Condvar,
    stop: AtomicBool,
}

impl Hub {
    fn close(&self, index: usize) {
        self.slots.lock()[index].open = false;
        self.ready.notify_all();
    }
}

/// Replace characters that do not belong in file names.
pub fn clean_source_name(source: &str) -> String {
    const SPECIAL: &str = "|@#!¡·$€%&()=?¿^*;:,¨´><+";
    source.chars().map(|c| if SPECIAL.contains(c) { '_' } else { c }).collect()
}

/// Webcams and network streams read concurrently; each pull returns the
/// newest frame of every live stream
pub struct LiveStreams {
    hub: Arc<Hub>,
    letterbox: Letterbox,
    batches: u64,
    /// Streams already reported through `take_closed`
    retired: Vec<bool>,
    _workers: Vec<JoinHandle<()>>,
}

impl LiveStreams {
    /// Open every source and read its first frame before any thread starts.
    pub fn open(sources: &[String], letterbox: Letterbox, vid_stride: u32, opener: &dyn StreamOpener) -> Result<Self> {
        let mut slots = Vec::with_capacity(sources.len());
        let mut readers = Vec::with_capacity(sources.len());

        for (i, source) in sources.iter().enumerate() {
            let mut reader = opener
                .open(source)
                .map_err(|e| VisionError::SourceResolution(format!("Failed to open {}: {}", source, e)))?;
            let info = reader.info().sanitized();
            let first = reader
                .read()
                .map_err(|e| VisionError::SourceResolution(format!("Failed to read images from {}: {}", source, e)))?
                .ok_or_else(|| VisionError::SourceResolution(format!("Failed to read images from {}", source)))?;

            info!(
                "{}/{}: {}... Success ({}x{} at {:.2} FPS)",
                i + 1,
                sources.len(),
                source,
                first.width(),
                first.height(),
                info.fps
            );

            slots.push(Slot {
                source: clean_source_name(source),
                image: Some(first),
                seq: 1,
                delivered: 0,
                open: true,
            });
            readers.push(reader);
        }

        let hub = Arc::new(Hub {
            slots: Mutex::new(slots),
            ready: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let workers = readers
            .into_iter()
            .enumerate()
            .map(|(index, reader)| {
                let hub = hub.clone();
                let stride = vid_stride.max(1) as u64;
                thread::spawn(move || capture_loop(index, reader, hub, stride))
            })
            .collect();

        Ok(Self { hub, letterbox, batches: 0, retired: vec![false; sources.len()], _workers: workers })
    }

    /// Number of streams that are still delivering frames.
    pub fn live_count(&self) -> usize {
        self.hub.slots.lock().iter().filter(|s| s.open).count()
    }

    fn collect(&mut self) -> Option<FrameBatch> {
        let mut slots = self.hub.slots.lock();
        loop {
            if slots.iter().any(Slot::has_fresh) {
                break;
            }
            if slots.iter().all(|s| !s.open) {
                return None;
            }
            self.hub.ready.wait(&mut slots);
        }

        let mut frames = Vec::new();
        for (index, slot) in slots.iter_mut().enumerate() {
            if !(slot.open || slot.has_fresh()) {
                continue;
            }
            if let Some(image) = &slot.image {
                frames.push(Frame {
                    path: PathBuf::from(&slot.source),
                    image: image.clone(),
                    stream: index,
                    frame_index: slot.seq,
                    // writers for live streams use the frame size at 30 fps
                    capture: None,
                });
                slot.delivered = slot.seq;
            }
        }
        drop(slots);

        self.batches += 1;
        let images: Vec<&RgbImage> = frames.iter().map(|f| &f.image).collect();
        let pixels = self.letterbox.batch(&images);
        Some(FrameBatch {
            description: format!("batch {} ({} streams) ", self.batches, frames.len()),
            frames,
            pixels,
            mode: Mode::Stream,
        })
    }
}

fn capture_loop(index: usize, mut reader: Box<dyn StreamReader>, hub: Arc<Hub>, stride: u64) {
    let mut n = 0u64;
    while !hub.stop.load(Ordering::Relaxed) {
        match reader.read() {
            Ok(Some(image)) => {
                n += 1;
                if n % stride == 0 {
                    let mut slots = hub.slots.lock();
                    let slot = &mut slots[index];
                    slot.image = Some(image);
                    slot.seq += 1;
                    drop(slots);
                    hub.ready.notify_all();
                }
            }
            Ok(None) => {
                info!("Stream {} ended", index);
                break;
            }
            Err(e) => {
                warn!("Stream {} unresponsive, dropping it: {}", index, e);
                break;
            }
        }
    }
    hub.close(index);
    debug!("Capture thread for stream {} stopped", index);
}

impl FrameProvider for LiveStreams {
    fn next_batch(&mut self) -> Option<Result<FrameBatch>> {
        self.collect().map(Ok)
    }

    fn batch_size(&self) -> usize {
        self.hub.slots.lock().len()
    }

    fn mode(&self) -> Mode {
        Mode::Stream
    }

    fn take_closed(&mut self) -> Vec<usize> {
        let slots = self.hub.slots.lock();
        let mut closed = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            if !slot.open && !slot.has_fresh() && !self.retired[index] {
                self.retired[index] = true;
                closed.push(index);
            }
        }
        closed
    }
}

impl Drop for LiveStreams {
    fn drop(&mut self) {
        self.hub.stop.store(true, Ordering::Relaxed);
        self.hub.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::CaptureInfo;
    use image::Rgb;
    use std::time::Duration;

    struct FlakyStream {
        served: u32,
        fail_after: Option<u32>,
        end_after: u32,
    }

    impl StreamReader for FlakyStream {
        fn info(&self) -> CaptureInfo {
            CaptureInfo { fps: 25.0, width: 8, height: 8 }
        }

        fn read(&mut self) -> Result<Option<RgbImage>> {
            thread::sleep(Duration::from_millis(2));
            if self.fail_after == Some(self.served) {
                return Err(VisionError::FrameDecode("connection reset".to_string()));
            }
            if self.served >= self.end_after {
                return Ok(None);
            }
            self.served += 1;
            Ok(Some(RgbImage::from_pixel(8, 8, Rgb([self.served as u8, 0, 0]))))
        }
    }

    struct FlakyOpener;

    impl StreamOpener for FlakyOpener {
        fn open(&self, source: &str) -> Result<Box<dyn StreamReader>> {
            match source {
                "good" => Ok(Box::new(FlakyStream { served: 0, fail_after: None, end_after: 40 })),
                "flaky" => Ok(Box::new(FlakyStream { served: 0, fail_after: Some(5), end_after: 40 })),
                other => Err(VisionError::SourceResolution(format!("no such camera {}", other))),
            }
        }
    }

    #[test]
    fn test_failed_stream_is_dropped_others_continue() {
        let sources = vec!["good".to_string(), "flaky".to_string()];
        let mut streams = LiveStreams::open(&sources, Letterbox::new((16, 16)), 1, &FlakyOpener).unwrap();

        let mut good_frames = 0;
        let mut flaky_max = 0;
        while let Some(batch) = streams.next_batch() {
            let batch = batch.unwrap();
            assert_eq!(batch.mode, Mode::Stream);
            assert_eq!(batch.pixels.dim().0, batch.frames.len());
            for frame in &batch.frames {
                match frame.stream {
                    0 => good_frames += 1,
                    _ => flaky_max = flaky_max.max(frame.frame_index),
                }
            }
        }

        assert!(good_frames > 0);
        assert!(flaky_max <= 5);
        assert_eq!(streams.live_count(), 0);
    }

    #[test]
    fn test_closed_streams_are_reported_once() {
        let sources = vec!["good".to_string(), "flaky".to_string()];
        let mut streams = LiveStreams::open(&sources, Letterbox::new((16, 16)), 1, &FlakyOpener).unwrap();

        let mut reported = Vec::new();
        let mut flaky_after_close = 0;
        while let Some(batch) = streams.next_batch() {
            let batch = batch.unwrap();
            if reported.contains(&1) {
                flaky_after_close += batch.frames.iter().filter(|f| f.stream == 1).count();
            }
            assert!(batch.frames.iter().all(|f| f.capture.is_none()));
            reported.extend(streams.take_closed());
        }
        reported.extend(streams.take_closed());
        reported.sort();

        assert_eq!(reported, vec![0, 1]);
        assert_eq!(flaky_after_close, 0);
        assert!(streams.take_closed().is_empty());
    }

    #[test]
    fn test_open_failure_is_fatal() {
        let sources = vec!["good".to_string(), "missing".to_string()];
        let err = LiveStreams::open(&sources, Letterbox::new((16, 16)), 1, &FlakyOpener).err();
        assert!(matches!(err, Some(VisionError::SourceResolution(_))));
    }

    #[test]
    fn test_clean_source_name() {
        assert_eq!(clean_source_name("rtsp://user@host:554/live"), "rtsp_//user_host_554/live");
        assert_eq!(clean_source_name("0"), "0");
    }
}
