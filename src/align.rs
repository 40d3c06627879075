//! Placing secondary streams (behavioral video) on the photometry timeline.
//!
//! Videos carry their own clock starting at zero. Their wall-clock start is
//! looked up in a table kept next to the videos, and the whole stream is
//! shifted by its distance from the session start. No drift is modelled.

use chrono::{NaiveDateTime, TimeDelta};
use log::debug;
use ndarray::{Array1, ArrayView1};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

use crate::types::ConversionError;

/// Start-time table kept next to the videos.
pub const VIDEO_START_TABLE: &str = "video_metadata.csv";

/// Wall-clock formats accepted in the `start_time` column.
const START_TIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Seconds from `from` to `to`, negative if `to` is earlier.
pub fn seconds_between(from: NaiveDateTime, to: NaiveDateTime) -> f64 {
    let delta: TimeDelta = to - from;
    delta.num_seconds() as f64 + f64::from(delta.subsec_nanos()) / 1e9
}

/// Parses a wall-clock value as written in a start-time table.
pub fn parse_start_time(value: &str) -> Result<NaiveDateTime, ConversionError> {
    let value = value.trim();
    START_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .ok_or_else(|| ConversionError::Timestamp {
            value: value.to_string(),
            reason: format!("expected one of {START_TIME_FORMATS:?}"),
        })
}

#[derive(Debug, Deserialize)]
struct StartTimeRecord {
    file_name: String,
    start_time: String,
}

/// One row of a start-time table.
#[derive(Debug, Clone, PartialEq)]
pub struct StartTimeEntry {
    pub file_name: String,
    pub start_time: NaiveDateTime,
}

/// Per-file wall-clock start times of secondary streams.
#[derive(Debug, Clone, Default)]
pub struct VideoStartTable {
    entries: Vec<StartTimeEntry>,
}

impl VideoStartTable {
    pub fn from_entries(entries: Vec<StartTimeEntry>) -> Self {
        VideoStartTable { entries }
    }

    /// Reads a CSV table with at least the columns `file_name` and
    /// `start_time`. Other columns are ignored.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConversionError> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut entries = Vec::new();
        for record in csv_reader.deserialize() {
            let record: StartTimeRecord = record?;
            entries.push(StartTimeEntry {
                start_time: parse_start_time(&record.start_time)?,
                file_name: record.file_name.trim().to_string(),
            });
        }
        debug!("Read {} video start time(s)", entries.len());
        Ok(VideoStartTable { entries })
    }

    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self, ConversionError> {
        let file = std::fs::File::open(path.as_ref())?;
        VideoStartTable::from_reader(file)
    }

    pub fn entries(&self) -> &[StartTimeEntry] {
        &self.entries
    }

    /// Start time of `file_id`; absent and duplicated ids are both errors.
    pub fn start_time_of(&self, file_id: &str) -> Result<NaiveDateTime, ConversionError> {
        let mut matches = self.entries.iter().filter(|e| e.file_name == file_id);
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(entry.start_time),
            (None, _) => Err(ConversionError::Lookup {
                key: file_id.to_string(),
                reason: "no start time recorded".to_string(),
            }),
            (Some(_), Some(_)) => Err(ConversionError::Lookup {
                key: file_id.to_string(),
                reason: format!(
                    "{} conflicting start times recorded",
                    self.entries.iter().filter(|e| e.file_name == file_id).count()
                ),
            }),
        }
    }
}

/// Identifier under which a video is listed in the start-time table.
pub fn video_file_id(video: &Path) -> Result<String, ConversionError> {
    video
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ConversionError::Lookup {
            key: video.display().to_string(),
            reason: "path has no file name".to_string(),
        })
}

/// Offset in seconds that maps `file_id`'s clock onto the primary timeline.
///
/// # Errors
///
/// * [`ConversionError::Lookup`] if the table has no entry, or several, for `file_id`
/// * [`ConversionError::NegativeOffset`] if the stream starts before `primary_start`
pub fn compute_offset(
    table: &VideoStartTable,
    file_id: &str,
    primary_start: NaiveDateTime,
) -> Result<f64, ConversionError> {
    let secondary_start = table.start_time_of(file_id)?;
    let offset = seconds_between(primary_start, secondary_start);
    if offset < 0.0 {
        return Err(ConversionError::NegativeOffset {
            file_id: file_id.to_string(),
            offset,
        });
    }
    debug!("`{}` starts {:.3} s into the session", file_id, offset);
    Ok(offset)
}

/// Shifts every timestamp of a secondary stream by `offset` seconds.
pub fn align_timestamps(timestamps: ArrayView1<f64>, offset: f64) -> Array1<f64> {
    timestamps.mapv(|t| t + offset)
}
