//! Locating raw segment folders and video files on disk.

use chrono::NaiveDateTime;
use glob::glob;
use log::debug;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::ConversionError;

/// Prefix of the folders that group one multi-segment protocol run.
pub const SEGMENT_GROUP_PREFIX: &str = "varFreq_";

/// Start-time format encoded in raw folder names, after the subject id.
pub const FOLDER_TIME_FORMAT: &str = "%y%m%d-%H%M%S";

/// Video container extension.
pub const VIDEO_EXTENSION: &str = "mp4";

/// Extension of the processed-series file exported next to the raw folders.
pub const PROCESSED_FILE_EXTENSION: &str = "mat";

/// Returns every path matching `pattern`, sorted.
///
/// A directory that cannot be read while matching is an IO error rather
/// than a silently shorter list.
pub fn find_all(pattern: &str) -> Result<Vec<PathBuf>, ConversionError> {
    let mut paths = glob(pattern)?
        .map(|entry| entry.map_err(unreadable))
        .collect::<Result<Vec<PathBuf>, _>>()?;
    paths.sort();
    Ok(paths)
}

fn unreadable(err: glob::GlobError) -> ConversionError {
    let path = err.path().display().to_string();
    let source = err.into_error();
    ConversionError::Io(io::Error::new(source.kind(), format!("{path}: {source}")))
}

/// Returns the single path matching `pattern`.
///
/// Zero or several matches are a [`ConversionError::Discovery`].
pub fn find_exactly_one(pattern: &str) -> Result<PathBuf, ConversionError> {
    let mut paths = find_all(pattern)?;
    if paths.len() != 1 {
        return Err(ConversionError::Discovery {
            pattern: pattern.to_string(),
            found: paths.len(),
        });
    }
    Ok(paths.remove(0))
}

/// Parses the start time encoded in a raw folder name such as
/// `C4550-240118-101530`.
pub fn parse_folder_start_time(folder: &Path) -> Result<NaiveDateTime, ConversionError> {
    let name = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut parts = name.rsplitn(3, '-');
    let (time, date) = match (parts.next(), parts.next(), parts.next()) {
        (Some(time), Some(date), Some(_subject)) => (time, date),
        _ => {
            return Err(ConversionError::Timestamp {
                value: name.clone(),
                reason: "expected `<subject>-<yymmdd>-<HHMMSS>`".to_string(),
            })
        }
    };

    NaiveDateTime::parse_from_str(&format!("{date}-{time}"), FOLDER_TIME_FORMAT).map_err(|e| {
        ConversionError::Timestamp {
            value: name.clone(),
            reason: e.to_string(),
        }
    })
}

/// Tag of the segment stored in `folder`: the name of its group folder
/// without the [`SEGMENT_GROUP_PREFIX`]. Folders outside a group have none.
pub fn segment_tag(folder: &Path) -> Option<String> {
    let parent = folder.parent()?.file_name()?.to_string_lossy();
    parent.strip_prefix(SEGMENT_GROUP_PREFIX).map(str::to_string)
}

/// Raw folders of one subject under `protocol_dir`, in chronological order.
///
/// With `grouped`, folders are looked up one level down inside
/// `varFreq_<tag>` group folders.
pub fn segment_folders(
    protocol_dir: &Path,
    subject_id: &str,
    grouped: bool,
) -> Result<Vec<PathBuf>, ConversionError> {
    let pattern = if grouped {
        protocol_dir
            .join(format!("{SEGMENT_GROUP_PREFIX}*"))
            .join(format!("{subject_id}-*"))
    } else {
        protocol_dir.join(format!("{subject_id}-*"))
    };
    let pattern = pattern.to_string_lossy().into_owned();

    let mut folders = Vec::new();
    for path in find_all(&pattern)?.into_iter().filter(|p| p.is_dir()) {
        let start = parse_folder_start_time(&path)?;
        folders.push((start, path));
    }
    if folders.is_empty() {
        return Err(ConversionError::Discovery { pattern, found: 0 });
    }

    folders.sort_by(|a, b| a.0.cmp(&b.0));
    debug!("Found {} raw folder(s) matching {}", folders.len(), pattern);
    Ok(folders.into_iter().map(|(_, path)| path).collect())
}

/// The single processed-series file of a protocol folder.
pub fn processed_file(protocol_dir: &Path) -> Result<PathBuf, ConversionError> {
    let pattern = protocol_dir.join(format!("*.{PROCESSED_FILE_EXTENSION}"));
    find_exactly_one(&pattern.to_string_lossy())
}

/// Video files of one subject in `video_dir`, sorted by name.
///
/// Fails unless exactly `expected` files are present.
pub fn video_files(
    video_dir: &Path,
    subject_id: &str,
    expected: usize,
) -> Result<Vec<PathBuf>, ConversionError> {
    let pattern = video_dir
        .join(format!("{subject_id}*.{VIDEO_EXTENSION}"))
        .to_string_lossy()
        .into_owned();
    let files = find_all(&pattern)?;
    if files.len() != expected {
        return Err(ConversionError::Discovery {
            pattern,
            found: files.len(),
        });
    }
    Ok(files)
}

/// Suffix that distinguishes the videos of one session, e.g. `1s` in
/// `C4550_1s.mp4`. `None` when the file name carries no underscore.
pub fn video_suffix(video: &Path) -> Option<String> {
    let stem = video.file_stem()?.to_string_lossy();
    let (_, suffix) = stem.rsplit_once('_')?;
    Some(suffix.to_string())
}
