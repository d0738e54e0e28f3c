mod common;

use anser_eye::sink::{CSV_FILE, LABELS_DIR};
use anser_eye::{Detector, LabelFormat, RunSummary, VisionError};
use common::*;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn run(config: anser_eye::DetectConfig, rows: Vec<Row>) -> (RunSummary, WriterLog) {
    let log = WriterLog::default();
    let detector = Detector::with_backend(
        config,
        backend(rows),
        image_only_capture(),
        Box::new(RecordingFactory { log: log.clone() }),
        None,
    );
    (detector.run().unwrap(), log)
}

fn goose_image(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("goose.jpg");
    write_image(&path);
    path
}

#[test]
fn test_single_image_counts_and_summary_json() {
    let dir = TempDir::new().unwrap();
    let source = goose_image(dir.path());
    let project = dir.path().join("runs");

    let (summary, log) = run(config(&source, &project), goose_and_egg());

    assert_eq!(summary.counts, vec![1, 1]);
    assert_eq!(summary.seen, 1);
    assert!(summary.output_directory.is_absolute());
    assert!(summary.output_directory.ends_with("exp"));
    assert!(summary.output_directory.join("goose.jpg").exists());
    assert!(log.entries().is_empty());

    let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
    assert_eq!(json["counts"], serde_json::json!([1, 1]));
    assert!(json["outputDirectory"].as_str().unwrap().ends_with("exp"));
}

#[test]
fn test_repeat_runs_get_fresh_directories() {
    let dir = TempDir::new().unwrap();
    let source = goose_image(dir.path());
    let project = dir.path().join("runs");

    let (first, _) = run(config(&source, &project), goose_and_egg());
    let (second, _) = run(config(&source, &project), goose_and_egg());
    assert!(first.output_directory.ends_with("exp"));
    assert!(second.output_directory.ends_with("exp2"));

    let mut reuse = config(&source, &project);
    reuse.exist_ok = true;
    let (third, _) = run(reuse, goose_and_egg());
    assert_eq!(third.output_directory, first.output_directory);
}

#[test]
fn test_class_filter_and_max_det() {
    let dir = TempDir::new().unwrap();
    let source = goose_image(dir.path());
    let project = dir.path().join("runs");

    let mut only_geese = config(&source, &project);
    only_geese.classes = Some(vec![0]);
    let (summary, _) = run(only_geese, goose_and_egg());
    assert_eq!(summary.counts, vec![1, 0]);

    let mut top_one = config(&source, &project);
    top_one.max_det = 1;
    let (summary, _) = run(top_one, goose_and_egg());
    assert_eq!(summary.counts, vec![1, 0]);
}

#[test]
fn test_nosave_writes_nothing_but_reports_same_counts() {
    let dir = TempDir::new().unwrap();
    let source = goose_image(dir.path());
    let project = dir.path().join("runs");

    let mut quiet = config(&source, &project);
    quiet.nosave = true;
    let (summary, _) = run(quiet, goose_and_egg());

    assert_eq!(summary.counts, vec![1, 1]);
    assert!(summary.output_directory.is_dir());
    assert!(files_in(&summary.output_directory).is_empty());
}

#[test]
fn test_text_and_csv_exports() {
    let dir = TempDir::new().unwrap();
    let source = goose_image(dir.path());
    let project = dir.path().join("runs");

    let mut cfg = config(&source, &project);
    cfg.nosave = true;
    cfg.save_txt = true;
    cfg.save_csv = true;
    cfg.save_format = LabelFormat::PascalVoc;
    let (summary, _) = run(cfg, goose_and_egg());

    assert_eq!(summary.label_files, Some(1));
    let labels = fs::read_to_string(summary.output_directory.join(LABELS_DIR).join("goose.txt")).unwrap();
    let lines: Vec<&str> = labels.lines().collect();
    assert_eq!(lines, vec!["1 42 42 54 54", "0 10 10 22 22"]);

    let csv = fs::read_to_string(summary.output_directory.join(CSV_FILE)).unwrap();
    assert!(csv.starts_with("Image Name,Prediction,Confidence\r\n"));
    assert!(csv.contains("goose.jpg,goose,0.81\r\n"));
    assert!(csv.contains("goose.jpg,egg,0.72\r\n"));
}

#[test]
fn test_crops_come_from_unannotated_frame() {
    let dir = TempDir::new().unwrap();
    let source = goose_image(dir.path());
    let project = dir.path().join("runs");

    let mut cfg = config(&source, &project);
    cfg.save_crop = true;
    let (summary, _) = run(cfg, goose_and_egg());

    let crop = summary.output_directory.join("crops").join("goose").join("goose.jpg");
    let image = image::open(crop).unwrap().to_rgb8();
    let center = image.get_pixel(image.width() / 2, image.height() / 2);
    // jpeg round trips are lossy, but a drawn outline would be far off
    assert!((center[2] as i32 - 150).abs() < 20);
}

#[test]
fn test_video_frames_go_to_one_writer() {
    let dir = TempDir::new().unwrap();
    let video = dir.path().join("clip.avi");
    fs::write(&video, b"").unwrap();
    let project = dir.path().join("runs");

    let mut cfg = config(&video, &project);
    cfg.vid_stride = 2;
    let log = WriterLog::default();
    let detector = Detector::with_backend(
        cfg,
        backend(goose_and_egg()),
        capture(Arc::new(SyntheticVideo { frames: 6 }), Arc::new(ScriptedStreams)),
        Box::new(RecordingFactory { log: log.clone() }),
        None,
    );
    let summary = detector.run().unwrap();

    assert_eq!(summary.seen, 3);
    assert_eq!(log.count("open"), 1);
    assert_eq!(log.entries()[0], "open clip.mp4 64x64@25");
    assert_eq!(log.count("write"), 3);
    assert_eq!(log.count("release"), 1);
}

#[test]
fn test_failing_stream_is_dropped_and_run_finishes() {
    let dir = TempDir::new().unwrap();
    let list = dir.path().join("cams.streams");
    fs::write(&list, "0\n1\n").unwrap();
    let project = dir.path().join("runs");

    let log = WriterLog::default();
    let detector = Detector::with_backend(
        config(&list, &project),
        backend(goose_and_egg()),
        capture(Arc::new(SyntheticVideo { frames: 0 }), Arc::new(ScriptedStreams)),
        Box::new(RecordingFactory { log: log.clone() }),
        None,
    );
    let summary = detector.run().unwrap();

    assert!(summary.seen >= 2);
    assert_eq!(summary.counts, vec![1, 1]);
    let entries = log.entries();
    assert!(entries.iter().any(|e| e.starts_with("open 0.mp4 64x64@30")));
    assert!(entries.iter().any(|e| e.starts_with("open 1.mp4")));
    assert_eq!(log.count("release"), 2);
    assert_eq!(log.count("release 1.mp4"), 1);
}

#[test]
fn test_stream_writer_uses_frame_size_at_thirty_fps() {
    let dir = TempDir::new().unwrap();
    let list = dir.path().join("cam.streams");
    fs::write(&list, "2\n").unwrap();
    let project = dir.path().join("runs");

    let log = WriterLog::default();
    let detector = Detector::with_backend(
        config(&list, &project),
        backend(goose_and_egg()),
        capture(Arc::new(SyntheticVideo { frames: 0 }), Arc::new(ScriptedStreams)),
        Box::new(RecordingFactory { log: log.clone() }),
        None,
    );
    let summary = detector.run().unwrap();

    assert!(summary.seen >= 1);
    let entries = log.entries();
    assert_eq!(entries.first().map(String::as_str), Some("open 2.mp4 64x48@30"));
    assert_eq!(log.count("open"), 1);
    assert_eq!(entries.last().map(String::as_str), Some("release 2.mp4"));
}

#[test]
fn test_directory_with_undecodable_image_formats_still_runs() {
    let dir = TempDir::new().unwrap();
    let images = dir.path().join("images");
    fs::create_dir(&images).unwrap();
    write_image(&images.join("a.jpg"));
    fs::write(images.join("b.pfm"), b"PF\n1 1\n-1.0\n").unwrap();
    let project = dir.path().join("runs");

    let (summary, _) = run(config(&images, &project), goose_and_egg());

    assert_eq!(summary.seen, 1);
    assert_eq!(summary.counts, vec![1, 1]);
    assert!(summary.output_directory.join("a.jpg").exists());
    assert!(!summary.output_directory.join("b.pfm").exists());
}

#[test]
fn test_missing_source_fails_before_inference() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("runs");
    let log = WriterLog::default();
    let detector = Detector::with_backend(
        config(&dir.path().join("nothing.jpg"), &project),
        backend(goose_and_egg()),
        image_only_capture(),
        Box::new(RecordingFactory { log }),
        None,
    );

    let err = detector.run().err();
    assert!(matches!(err, Some(VisionError::SourceResolution(_))));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let source = goose_image(dir.path());
    let mut cfg = config(&source, &dir.path().join("runs"));
    cfg.conf_thres = 2.0;

    let detector = Detector::with_backend(
        cfg,
        backend(goose_and_egg()),
        image_only_capture(),
        Box::new(RecordingFactory { log: WriterLog::default() }),
        None,
    );
    assert!(matches!(detector.run().err(), Some(VisionError::Config(_))));
}
