use anser_eye::source::{classify, expand_files, is_url, SourceKind, IMG_FORMATS, VID_FORMATS};
use anser_eye::{detect, DetectConfig, VisionError};
use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;

proptest! {
    #[test]
    fn digits_are_always_webcams(index in 0u32..10_000) {
        let plan = classify(&index.to_string());
        prop_assert_eq!(plan.kind, SourceKind::Webcam);
        prop_assert!(plan.download.is_none());
    }

    #[test]
    fn remote_media_files_are_downloaded(
        host in "[a-z]{3,10}",
        stem in "[a-z0-9_]{1,12}",
        ext_index in 0usize..(IMG_FORMATS.len() + VID_FORMATS.len()),
    ) {
        let ext = IMG_FORMATS.iter().chain(VID_FORMATS.iter()).nth(ext_index).unwrap();
        let url = format!("https://{}.com/media/{}.{}", host, stem, ext);
        let plan = classify(&url);
        prop_assert_eq!(plan.kind, SourceKind::Files);
        prop_assert_eq!(plan.download, Some(url.clone()));
        prop_assert!(is_url(&url));
    }

    #[test]
    fn remote_non_media_urls_are_streams(host in "[a-z]{3,10}", path in "[a-z]{1,8}") {
        let plan = classify(&format!("rtsp://{}.net/{}", host, path));
        prop_assert_eq!(plan.kind, SourceKind::Webcam);
    }

    #[test]
    fn local_paths_are_file_sequences(stem in "[a-z][a-z0-9_]{0,12}") {
        prop_assert_eq!(classify(&format!("data/{}.jpg", stem)).kind, SourceKind::Files);
        prop_assert_eq!(classify(&format!("data/{}", stem)).kind, SourceKind::Files);
    }
}

#[test]
fn test_screen_descriptors() {
    assert_eq!(classify("screen").kind, SourceKind::Screenshot);
    assert_eq!(classify("screen 0 100 100 512 256").kind, SourceKind::Screenshot);
}

#[test]
fn test_directory_orders_images_before_videos() {
    let dir = TempDir::new().unwrap();
    for name in ["a.mp4", "b.jpg", "c.txt", "d.png"] {
        fs::write(dir.path().join(name), b"").unwrap();
    }

    let files = expand_files(&dir.path().to_string_lossy()).unwrap();
    let names: Vec<String> = files
        .iter()
        .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["b.jpg", "d.png", "a.mp4"]);
}

#[test]
fn test_detect_rejects_bad_config_before_any_io() {
    let config = DetectConfig { iou_thres: 3.0, ..Default::default() };
    let err = tokio_test::block_on(detect(config)).err();
    assert!(matches!(err, Some(VisionError::Config(_))));
}

#[tokio::test]
async fn test_detect_reports_missing_weights() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("goose.jpg");
    fs::write(&image, b"").unwrap();

    let config = DetectConfig {
        weights: dir.path().join("missing.pt"),
        source: image.to_string_lossy().into_owned(),
        project: dir.path().join("runs"),
        ..Default::default()
    };
    let err = detect(config).await.err();
    assert!(matches!(err, Some(VisionError::Backend(_))));
}
