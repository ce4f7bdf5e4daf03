//! Frame sequences on disk and their normalization.
//!
//! Both workspace directories use the same naming scheme: an 8-digit
//! zero-padded index starting at 0 (`00000000.png`, `00000001.png`, ...).
//! The external decoder and encoder are both driven by that pattern, so the
//! engine's output has to be brought back to it before assembly.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::PipelineResult;

/// Width of the zero-padded frame index.
pub const FRAME_INDEX_WIDTH: usize = 8;

/// Extension of frames written by the decoder and the engine.
pub const FRAME_EXTENSION: &str = "png";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Canonical file name for the frame at `index`.
pub fn frame_file_name(index: usize, extension: &str) -> String {
    format!("{:0width$}.{}", index, extension, width = FRAME_INDEX_WIDTH)
}

/// printf-style pattern understood by ffmpeg's image2 muxer/demuxer.
pub fn frame_pattern(dir: &Path) -> PathBuf {
    dir.join(format!("%0{}d.{}", FRAME_INDEX_WIDTH, FRAME_EXTENSION))
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
}

/// Image files directly inside `dir`, in no particular order.
///
/// A missing directory yields an empty list.
pub fn list_frames(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_image(p))
        .collect()
}

/// Number of image files directly inside `dir`.
pub fn count_frames(dir: &Path) -> usize {
    list_frames(dir).len()
}

/// First run of ASCII digits in the file stem, e.g. `frame_0012.png` -> 12.
fn embedded_index(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let start = stem.find(|c: char| c.is_ascii_digit())?;
    let digits: String = stem[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Orders by embedded number, then by name. Files without a number go last.
fn frame_order(a: &Path, b: &Path) -> Ordering {
    match (embedded_index(a), embedded_index(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.file_name().cmp(&b.file_name())),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.file_name().cmp(&b.file_name()),
    }
}

/// Result of normalizing a frame directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalized {
    /// Frames in the directory after normalization.
    pub frames: usize,
    /// Files that had to be renamed.
    pub renamed: usize,
}

/// Rename the image files in `dir` into a dense, zero-padded sequence.
///
/// Files are ordered by the number embedded in their names (`2.png` before
/// `10.png`) and renamed to `00000000.<ext>`, `00000001.<ext>`, ... keeping
/// their own extension. Files already carrying their target name are left
/// alone, so running this twice performs no renames the second time.
///
/// Renaming happens in two passes through temporary names, so a target name
/// that is still held by another source file is never overwritten.
pub fn normalize(dir: &Path) -> PipelineResult<Normalized> {
    let mut frames = list_frames(dir);
    frames.sort_by(|a, b| frame_order(a, b));

    let mut pending: Vec<(PathBuf, PathBuf)> = Vec::new();
    for (index, path) in frames.iter().enumerate() {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(FRAME_EXTENSION)
            .to_ascii_lowercase();
        let target = dir.join(frame_file_name(index, &extension));
        if *path != target {
            pending.push((path.clone(), target));
        }
    }

    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(pending.len());
    for (i, (source, target)) in pending.into_iter().enumerate() {
        let temp = dir.join(format!(".normalize-{}.tmp", i));
        fs::rename(&source, &temp)?;
        staged.push((temp, target));
    }

    for (temp, target) in &staged {
        fs::rename(temp, target)?;
    }

    debug!(dir = %dir.display(), frames = frames.len(), renamed = staged.len(), "normalized frames");

    Ok(Normalized {
        frames: frames.len(),
        renamed: staged.len(),
    })
}
