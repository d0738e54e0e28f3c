//! Run directory versioning

use std::path::{Path, PathBuf};

const MAX_INCREMENT: u32 = 9999;

/// First free variant of `path`: `exp`, `exp2`, `exp3`, ...
///
/// Files keep their extension (`crop.jpg` → `crop2.jpg`). With `exist_ok`
/// the path is returned unchanged even when it exists.
pub fn next_available_path(path: &Path, exist_ok: bool, sep: &str) -> PathBuf {
    if exist_ok || !path.exists() {
        return path.to_path_buf();
    }

    let (base, suffix) = if path.is_file() {
        let suffix = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        (path.with_extension(""), suffix)
    } else {
        (path.to_path_buf(), String::new())
    };

    for n in 2..MAX_INCREMENT {
        let candidate = PathBuf::from(format!("{}{}{}{}", base.display(), sep, n, suffix));
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

/// Final path component as a string, falling back to `fallback`.
pub fn file_name_or(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

/// Path stem as a string, falling back to `fallback`.
pub fn file_stem_or(path: &Path, fallback: &str) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}
