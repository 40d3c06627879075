use chrono::NaiveDateTime;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

/// Version information for a raw segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major version number
    pub major: i16,
    /// Minor version number
    pub minor: i16,
}

/// One continuous stream recorded by the acquisition system.
///
/// A stream may carry several rows (e.g. one per photodetector input) that
/// share a single sampling clock. Only some rows are physiologically
/// meaningful for a given recording type; see
/// [`RecordingProfile::stream_indices`](crate::config::RecordingProfile).
#[derive(Debug, Clone)]
pub struct RawStream {
    /// Stream name as stored by the acquisition system (e.g. "Fi1r")
    pub name: String,
    /// Declared sampling rate (Hz)
    pub sampling_rate: f64,
    /// Sample values
    /// - Shape: [num_rows, num_samples]
    pub data: Array2<f64>,
    /// Per-sample time in seconds, relative to the segment's own start.
    ///
    /// Nominally `i / sampling_rate`, but hardware dropouts leave gaps.
    pub timestamps: Array1<f64>,
}

impl RawStream {
    /// Builds a stream whose timestamps are implied by the sampling rate.
    pub fn regular(name: impl Into<String>, sampling_rate: f64, data: Array2<f64>) -> Self {
        let num_samples = data.ncols();
        let timestamps = Array1::from_iter((0..num_samples).map(|i| i as f64 / sampling_rate));
        RawStream {
            name: name.into(),
            sampling_rate,
            data,
            timestamps,
        }
    }

    /// Returns the number of rows (sub-channels) in the stream.
    pub fn num_rows(&self) -> usize {
        self.data.nrows()
    }

    /// Returns the number of samples per row.
    pub fn num_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Returns the duration covered by the stream in seconds.
    ///
    /// If no samples are present, returns 0.0.
    pub fn duration(&self) -> f64 {
        self.num_samples() as f64 / self.sampling_rate
    }
}

/// Onset/offset pairs for one stimulus event channel, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventIntervals {
    pub onset: Vec<f64>,
    pub offset: Vec<f64>,
}

impl EventIntervals {
    /// Iterates over `(onset, offset)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.onset.iter().copied().zip(self.offset.iter().copied())
    }

    /// Returns the number of complete intervals.
    pub fn len(&self) -> usize {
        self.onset.len().min(self.offset.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the intervals shifted by `offset` seconds.
    pub fn shifted(&self, offset: f64) -> Self {
        EventIntervals {
            onset: self.onset.iter().map(|t| t + offset).collect(),
            offset: self.offset.iter().map(|t| t + offset).collect(),
        }
    }
}

/// Stimulus event channels keyed by their acquisition-system name.
pub type EventMap = BTreeMap<String, EventIntervals>;

/// A segment's contents after loading a time window.
///
/// This is the handle returned by
/// [`RawStreamReader::load`](crate::reader::RawStreamReader::load).
#[derive(Debug, Clone)]
pub struct RawSegment {
    /// Wall-clock time at which the segment's clock reads zero
    pub start_time: NaiveDateTime,
    /// Optional label used for segment-boundary annotation
    pub tag: Option<String>,
    /// Streams keyed by name
    pub streams: BTreeMap<String, RawStream>,
    /// Stimulus event channels
    pub events: EventMap,
}

impl RawSegment {
    /// Returns the stream called `name` or a [`ConversionError::MissingStream`].
    pub fn stream(&self, name: &str) -> Result<&RawStream, ConversionError> {
        self.streams
            .get(name)
            .ok_or_else(|| ConversionError::MissingStream {
                name: name.to_string(),
                available: self.streams.keys().cloned().collect(),
            })
    }

    /// Returns the full signal of a stream.
    /// - Shape: [num_rows, num_samples]
    pub fn get_signal(&self, name: &str) -> Result<&Array2<f64>, ConversionError> {
        Ok(&self.stream(name)?.data)
    }

    /// Returns the declared sampling rate of a stream (Hz).
    pub fn get_sampling_rate(&self, name: &str) -> Result<f64, ConversionError> {
        Ok(self.stream(name)?.sampling_rate)
    }

    /// Returns per-sample timestamps of a stream (seconds from segment start).
    pub fn get_timestamps(&self, name: &str) -> Result<&Array1<f64>, ConversionError> {
        Ok(&self.stream(name)?.timestamps)
    }

    /// Returns all stimulus event channels.
    pub fn get_events(&self) -> &EventMap {
        &self.events
    }

    /// Returns the names of all streams in the segment.
    pub fn stream_names(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }
}

/// Two demodulated channels derived from the same raw stream.
///
/// Both share the raw stream's timestamps.
#[derive(Debug, Clone)]
pub struct DemodulatedPair {
    /// Channel recovered at the calcium-indicator driver frequency
    pub calcium: Array1<f64>,
    /// Channel recovered at the isosbestic-control driver frequency
    pub isosbestic: Array1<f64>,
    /// Timestamps shared by both channels
    pub timestamps: Array1<f64>,
}

/// A named interval marking where one segment sits on the session timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentBoundary {
    pub start: f64,
    pub stop: f64,
    pub tag: String,
}

/// One logical channel after all segments have been appended.
#[derive(Debug, Clone)]
pub struct ConcatenatedChannel {
    /// Sample values; NaN marks a known-missing sample
    pub data: Array1<f64>,
    /// Session-relative timestamps in seconds
    pub timestamps: Array1<f64>,
    /// Sampling rate shared by every segment (Hz)
    pub sampling_rate: f64,
    /// One interval per segment
    pub boundaries: Vec<SegmentBoundary>,
    /// Number of sentinel samples inserted by gap filling
    pub num_inserted: usize,
}

impl ConcatenatedChannel {
    /// Returns the number of samples, including sentinels.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Errors raised while reading, demodulating, aligning or writing a session.
///
/// None of these are retried; the batch layer records them per session.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The file was not recognized as a raw segment file
    #[error("unrecognized file format: {0}")]
    UnrecognizedFileFormat(String),

    /// The file ended early or had trailing bytes
    #[error("file size error: {0}")]
    FileSizeError(String),

    /// A numeric parameter was outside its valid range
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The signal is too short for zero-phase filtering
    #[error("signal of {len} samples is too short for zero-phase filtering (needs more than {min})")]
    SignalTooShort { len: usize, min: usize },

    /// Paired arrays differ in length
    #[error("length mismatch: {what} has {left} entries but {right} were expected")]
    LengthMismatch {
        what: String,
        left: usize,
        right: usize,
    },

    /// No segments were supplied for a session
    #[error("no segments to concatenate")]
    EmptySession,

    /// Segment start times are not strictly increasing
    #[error(
        "segments are not in chronological order: segment {index} starts at {start}, \
         which is not after {previous}"
    )]
    OutOfOrderSegments {
        index: usize,
        previous: NaiveDateTime,
        start: NaiveDateTime,
    },

    /// A segment's data runs past the start of the next segment
    #[error(
        "segment {index} ends at {previous_end:.6} s, after the next segment starts at {next_start:.6} s"
    )]
    OverlappingSegments {
        index: usize,
        previous_end: f64,
        next_start: f64,
    },

    /// A stream's sampling rate differs between segments
    #[error("sampling rate of stream `{stream}` differs between segments: {expected} Hz vs {actual} Hz in segment {index}")]
    SamplingRateMismatch {
        stream: String,
        index: usize,
        expected: f64,
        actual: f64,
    },

    /// A secondary stream would start before the primary timeline
    #[error("`{file_id}` starts {offset:.3} s before the session start")]
    NegativeOffset { file_id: String, offset: f64 },

    /// A lookup-table entry was absent or ambiguous
    #[error("lookup failed for `{key}`: {reason}")]
    Lookup { key: String, reason: String },

    /// A required stream or event channel is not present
    #[error("stream `{name}` not found; available: {available:?}")]
    MissingStream { name: String, available: Vec<String> },

    /// A required metadata key is absent
    #[error("missing required metadata key `{0}`")]
    MissingMetadataKey(String),

    /// A configuration label is not recognized
    #[error("unknown {kind} label `{label}`")]
    UnknownLabel { kind: &'static str, label: String },

    /// Path discovery found zero or several candidates where one was expected
    #[error("expected exactly one match for `{pattern}`, found {found}")]
    Discovery { pattern: String, found: usize },

    /// A wall-clock value could not be parsed
    #[error("invalid timestamp `{value}`: {reason}")]
    Timestamp { value: String, reason: String },

    /// The processed-series file could not be opened or read
    #[error("processed file error: {0}")]
    ProcessedFile(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("container error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lookup table error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}
