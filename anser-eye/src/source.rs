//! Source descriptor classification and materialization

use crate::error::{Result, VisionError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Still-image extensions accepted as file sources
pub const IMG_FORMATS: &[&str] = &[
    "bmp", "dng", "jpeg", "jpg", "mpo", "png", "tif", "tiff", "webp", "pfm",
];

/// Video extensions accepted as file sources
pub const VID_FORMATS: &[&str] = &[
    "asf", "avi", "gif", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg", "ts", "wmv",
];

const URL_SCHEMES: &[&str] = &["rtsp://", "rtmp://", "http://", "https://"];
const STREAM_LIST_SUFFIX: &str = ".streams";
const LIST_SUFFIX: &str = ".txt";
const SCREEN_PREFIX: &str = "screen";

/// Ingestion mode selected for a source descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Webcam index, `.streams` list or network stream
    Webcam,
    /// Screen region capture
    Screenshot,
    /// Image/video file, directory, glob or `.txt` list
    Files,
}

/// Result of classifying a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePlan {
    pub kind: SourceKind,
    /// Remote file that has to be downloaded before the run
    pub download: Option<String>,
}

/// Lowercase extension of the final path component, if any.
pub fn extension(descriptor: &str) -> Option<String> {
    Path::new(descriptor)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| IMG_FORMATS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_video_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| VID_FORMATS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_url(descriptor: &str) -> bool {
    let lower = descriptor.to_lowercase();
    URL_SCHEMES.iter().any(|scheme| lower.starts_with(scheme))
}

fn is_media_file(descriptor: &str) -> bool {
    extension(descriptor)
        .map(|ext| IMG_FORMATS.contains(&ext.as_str()) || VID_FORMATS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn is_numeric(descriptor: &str) -> bool {
    !descriptor.is_empty() && descriptor.chars().all(char::is_numeric)
}

/// Decide how a descriptor is ingested. Purely textual, no I/O.
pub fn classify(descriptor: &str) -> SourcePlan {
    let is_file = is_media_file(descriptor);
    let is_url = is_url(descriptor);

    if is_numeric(descriptor) || descriptor.ends_with(STREAM_LIST_SUFFIX) || (is_url && !is_file) {
        return SourcePlan { kind: SourceKind::Webcam, download: None };
    }

    if descriptor.to_lowercase().starts_with(SCREEN_PREFIX) {
        return SourcePlan { kind: SourceKind::Screenshot, download: None };
    }

    SourcePlan {
        kind: SourceKind::Files,
        download: (is_url && is_file).then(|| descriptor.to_string()),
    }
}

/// Classify `descriptor` and download remote files into `dir`.
///
/// Returns the descriptor to use for the run: the local path for downloaded
/// files, the original text otherwise.
pub async fn resolve(descriptor: &str, dir: &Path) -> Result<String> {
    match classify(descriptor).download {
        Some(url) => {
            let path = download(&url, dir).await?;
            Ok(path.to_string_lossy().into_owned())
        }
        None => Ok(descriptor.to_string()),
    }
}

/// Local file name for a remote file: last path segment, query stripped.
pub fn download_file_name(url: &str) -> Result<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(".."))
        .ok_or_else(|| VisionError::SourceResolution(format!("Cannot derive a file name from {}", url)))?;
    Ok(name.to_string())
}

/// Download a remote image or video into `dir`, reusing an existing copy.
pub async fn download(url: &str, dir: &Path) -> Result<PathBuf> {
    const MAX_SOURCE_SIZE: u64 = 2_000_000_000;
    const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

    let path = dir.join(download_file_name(url)?);
    if path.is_file() {
        info!("Found {:?} locally at {:?}", url, path);
        return Ok(path);
    }

    info!("Downloading {} to {:?}", url, path);
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()?;

    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(VisionError::SourceResolution(format!(
            "Failed to download {}: HTTP {}",
            url,
            response.status()
        )));
    }

    if let Some(content_length) = response.content_length() {
        if content_length > MAX_SOURCE_SIZE {
            return Err(VisionError::SourceResolution(format!(
                "Source too large: {} bytes (max {} bytes)",
                content_length, MAX_SOURCE_SIZE
            )));
        }
    }

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Err(VisionError::SourceResolution(format!("Downloaded file {} is empty", url)));
    }

    // only complete downloads get the final name
    fs::create_dir_all(dir)?;
    let temp_path = path.with_extension("part");
    fs::write(&temp_path, &bytes)?;
    fs::rename(&temp_path, &path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        VisionError::Io(e)
    })?;

    info!("Downloaded {} bytes to {:?}", bytes.len(), path);
    Ok(path)
}

/// Shell-style match supporting `*` and `?`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            n = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

fn sorted_dir(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && keep(&path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()) {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries)
}

fn expand_entry(entry: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(entry);
    if entry.contains('*') || entry.contains('?') {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let pattern = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        sorted_dir(dir, |name| wildcard_match(&pattern, name))
    } else if path.is_dir() {
        sorted_dir(path, |name| name.contains('.'))
    } else if path.is_file() {
        Ok(vec![path.to_path_buf()])
    } else {
        Err(VisionError::SourceResolution(format!("{} does not exist", entry)))
    }
}

/// Whether the still-image decoder handles this file's extension.
pub fn is_decodable_image(path: &Path) -> bool {
    image::ImageFormat::from_path(path).is_ok()
}

/// Expand a file-sequence descriptor into media files: images first, then videos.
///
/// Accepts a single file, a directory, a glob or a `.txt` file listing any of
/// those (relative entries resolve against the list file's directory).
pub fn expand_files(descriptor: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(descriptor);
    let entries: Vec<String> = if descriptor.ends_with(LIST_SUFFIX) && path.is_file() {
        let base = path.parent().unwrap_or(Path::new("."));
        fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let entry = Path::new(line);
                if entry.is_absolute() {
                    line.to_string()
                } else {
                    base.join(entry).to_string_lossy().into_owned()
                }
            })
            .collect()
    } else {
        vec![descriptor.to_string()]
    };

    let mut files = Vec::new();
    for entry in &entries {
        files.extend(expand_entry(entry)?);
    }

    let (images, videos): (Vec<PathBuf>, Vec<PathBuf>) = files
        .into_iter()
        .filter(|f| is_image_path(f) || is_video_path(f))
        .partition(|f| is_image_path(f));
    let images: Vec<PathBuf> = images
        .into_iter()
        .filter(|f| {
            let decodable = is_decodable_image(f);
            if !decodable {
                warn!("Skipping {:?}: no decoder for this image format", f);
            }
            decodable
        })
        .collect();

    if images.is_empty() && videos.is_empty() {
        return Err(VisionError::SourceResolution(format!(
            "No images or videos found in {}. Supported formats are:\nimages: {:?}\nvideos: {:?}",
            descriptor, IMG_FORMATS, VID_FORMATS
        )));
    }

    Ok(images.into_iter().chain(videos).collect())
}

/// Stream sources for a webcam descriptor; `.streams` files list one per line.
pub fn stream_sources(descriptor: &str) -> Result<Vec<String>> {
    let path = Path::new(descriptor);
    let sources: Vec<String> = if descriptor.ends_with(STREAM_LIST_SUFFIX) && path.is_file() {
        fs::read_to_string(path)?
            .split_whitespace()
            .map(str::to_string)
            .collect()
    } else {
        vec![descriptor.to_string()]
    };

    if sources.is_empty() {
        return Err(VisionError::SourceResolution(format!("{} lists no streams", descriptor)));
    }
    Ok(sources)
}
