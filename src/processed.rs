//! Processed series exported by the offline analysis.
//!
//! Next to the raw folders of a protocol sits one processed file holding,
//! for every subject, the demodulated, downsampled and dF/F series of each
//! sub-session. Series are addressed as
//! `stream / target area / subject / stimulus channel`, each leaf a
//! one-dimensional regular series starting at its sub-session's start.
//!
//! The file itself is HDF5 (MATLAB v7.3); reading it needs the `hdf5`
//! feature. Everything else works on the [`ProcessedSeriesSource`]
//! contract, so the series can also be supplied from memory.

use chrono::NaiveDateTime;
use log::debug;
use ndarray::{Array1, Axis};
use std::collections::BTreeMap;
use std::path::Path;

use crate::reader::{RawStreamReader, TimeWindow};
use crate::types::{ConversionError, EventMap, RawSegment, RawStream};

/// Rate of every processed stream except the `*_raw` ones (Hz).
pub const DOWNSAMPLED_SAMPLING_FREQUENCY: f64 = 100.0;

/// Streams written for every subject, in output order.
pub const PROCESSED_STREAMS: [&str; 5] = ["Gc_raw", "af_raw", "Gc", "af", "dF"];

/// Sub-session tags of a grouped protocol, in the order their stimulus
/// channels are listed.
pub const SUB_SESSION_TAGS: [&str; 3] = ["250ms", "1s", "4s"];

/// Rate of a processed stream: the acquisition rate for the demodulated
/// `*_raw` streams, the downsampled rate for the rest.
pub fn processed_sampling_frequency(stream: &str, raw_sampling_frequency: f64) -> f64 {
    if stream.contains("raw") {
        raw_sampling_frequency
    } else {
        DOWNSAMPLED_SAMPLING_FREQUENCY
    }
}

/// Source of processed series.
pub trait ProcessedSeriesSource {
    /// Target areas present for `stream`.
    fn target_areas(&self, stream: &str) -> Result<Vec<String>, ConversionError>;

    /// Subjects recorded from `target_area`.
    fn subjects(&self, stream: &str, target_area: &str) -> Result<Vec<String>, ConversionError>;

    /// One sub-session's series, flattened.
    fn read_series(
        &self,
        stream: &str,
        target_area: &str,
        subject_id: &str,
        channel: &str,
    ) -> Result<Array1<f64>, ConversionError>;
}

/// Target area a subject was recorded from.
///
/// One area per subject is assumed; the first listing the subject wins.
pub fn target_area_for_subject<S: ProcessedSeriesSource + ?Sized>(
    source: &S,
    subject_id: &str,
) -> Result<String, ConversionError> {
    let stream = PROCESSED_STREAMS[0];
    for area in source.target_areas(stream)? {
        if source.subjects(stream, &area)?.iter().any(|s| s == subject_id) {
            debug!("Subject {subject_id} found under target area {area}");
            return Ok(area);
        }
    }
    Err(ConversionError::Lookup {
        key: subject_id.to_string(),
        reason: format!("no target area of stream `{stream}` lists this subject"),
    })
}

/// Processed series held in memory.
#[derive(Debug, Clone, Default)]
pub struct ProcessedSeriesTable {
    // stream -> target area -> subject -> channel
    series: BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, Array1<f64>>>>>,
}

impl ProcessedSeriesTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stream: &str, target_area: &str, subject_id: &str, channel: &str, data: Array1<f64>) {
        self.series
            .entry(stream.to_string())
            .or_default()
            .entry(target_area.to_string())
            .or_default()
            .entry(subject_id.to_string())
            .or_default()
            .insert(channel.to_string(), data);
    }
}

fn missing(path: String) -> ConversionError {
    ConversionError::Lookup {
        key: path,
        reason: "not present in the processed series".to_string(),
    }
}

impl ProcessedSeriesSource for ProcessedSeriesTable {
    fn target_areas(&self, stream: &str) -> Result<Vec<String>, ConversionError> {
        let areas = self.series.get(stream).ok_or_else(|| missing(stream.to_string()))?;
        Ok(areas.keys().cloned().collect())
    }

    fn subjects(&self, stream: &str, target_area: &str) -> Result<Vec<String>, ConversionError> {
        self.series
            .get(stream)
            .and_then(|areas| areas.get(target_area))
            .map(|subjects| subjects.keys().cloned().collect())
            .ok_or_else(|| missing(format!("{stream}/{target_area}")))
    }

    fn read_series(
        &self,
        stream: &str,
        target_area: &str,
        subject_id: &str,
        channel: &str,
    ) -> Result<Array1<f64>, ConversionError> {
        self.series
            .get(stream)
            .and_then(|areas| areas.get(target_area))
            .and_then(|subjects| subjects.get(subject_id))
            .and_then(|channels| channels.get(channel))
            .cloned()
            .ok_or_else(|| missing(format!("{stream}/{target_area}/{subject_id}/{channel}")))
    }
}

/// The processed series of one sub-session, read like a raw segment.
///
/// Every stream in [`PROCESSED_STREAMS`] becomes a one-row regular stream,
/// so the session's concatenator places them exactly like the raw data.
#[derive(Debug)]
pub struct ProcessedSegment<'a, S: ?Sized> {
    source: &'a S,
    target_area: String,
    subject_id: String,
    channel: String,
    start_time: NaiveDateTime,
    tag: Option<String>,
    raw_sampling_frequency: f64,
}

impl<'a, S: ProcessedSeriesSource + ?Sized> ProcessedSegment<'a, S> {
    pub fn new(
        source: &'a S,
        target_area: &str,
        subject_id: &str,
        channel: &str,
        start_time: NaiveDateTime,
        tag: Option<String>,
        raw_sampling_frequency: f64,
    ) -> Self {
        ProcessedSegment {
            source,
            target_area: target_area.to_string(),
            subject_id: subject_id.to_string(),
            channel: channel.to_string(),
            start_time,
            tag,
            raw_sampling_frequency,
        }
    }
}

impl<S: ProcessedSeriesSource + ?Sized> RawStreamReader for ProcessedSegment<'_, S> {
    fn start_time(&self) -> NaiveDateTime {
        self.start_time
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn load(&self, t1: f64, t2: f64) -> Result<RawSegment, ConversionError> {
        let mut streams = BTreeMap::new();
        for stream in PROCESSED_STREAMS {
            let data = self
                .source
                .read_series(stream, &self.target_area, &self.subject_id, &self.channel)?;
            let rate = processed_sampling_frequency(stream, self.raw_sampling_frequency);
            streams.insert(
                stream.to_string(),
                RawStream::regular(stream, rate, data.insert_axis(Axis(0))),
            );
        }
        let segment = RawSegment {
            start_time: self.start_time,
            tag: self.tag.clone(),
            streams,
            events: EventMap::new(),
        };
        Ok(segment.window(TimeWindow { t1, t2 }))
    }
}

/// Stimulus channel holding each segment's processed series.
///
/// With a single channel name the whole session is one processed series.
/// Otherwise each segment is matched to a channel through its sub-session
/// tag, the tags of [`SUB_SESSION_TAGS`] naming the channels in order.
pub fn segment_channels(channels: &[String], tags: &[Option<&str>]) -> Result<Vec<String>, ConversionError> {
    if let [only] = channels {
        return Ok(vec![only.clone()]);
    }
    tags.iter()
        .map(|tag| {
            let label = tag.unwrap_or_default();
            let index = SUB_SESSION_TAGS
                .iter()
                .position(|t| *t == label)
                .ok_or_else(|| ConversionError::UnknownLabel {
                    kind: "sub-session",
                    label: label.to_string(),
                })?;
            channels.get(index).cloned().ok_or_else(|| ConversionError::InvalidParameter {
                name: "processed_channels",
                reason: format!("no processed channel for sub-session `{label}` ({} listed)", channels.len()),
            })
        })
        .collect()
}

/// Opens a processed file.
#[cfg(feature = "hdf5")]
pub fn open_processed_file(path: &Path) -> Result<Box<dyn ProcessedSeriesSource>, ConversionError> {
    Ok(Box::new(mat::MatFile::open(path)?))
}

/// Opens a processed file.
///
/// Without the `hdf5` feature every processed file is rejected.
#[cfg(not(feature = "hdf5"))]
pub fn open_processed_file(path: &Path) -> Result<Box<dyn ProcessedSeriesSource>, ConversionError> {
    Err(ConversionError::ProcessedFile(format!(
        "{}: reading processed files requires the `hdf5` feature",
        path.display()
    )))
}

#[cfg(feature = "hdf5")]
pub mod mat {
    //! HDF5-backed processed files.

    use super::ProcessedSeriesSource;
    use crate::types::ConversionError;
    use ndarray::Array1;
    use std::path::{Path, PathBuf};

    /// A processed file opened read-only.
    pub struct MatFile {
        path: PathBuf,
        file: hdf5::File,
    }

    impl MatFile {
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ConversionError> {
            let path = path.as_ref().to_path_buf();
            let file = hdf5::File::open(&path).map_err(|e| error(&path, e))?;
            Ok(MatFile { path, file })
        }

        fn group(&self, name: &str) -> Result<hdf5::Group, ConversionError> {
            self.file.group(name).map_err(|e| error(&self.path, e))
        }
    }

    fn error(path: &Path, err: hdf5::Error) -> ConversionError {
        ConversionError::ProcessedFile(format!("{}: {err}", path.display()))
    }

    impl ProcessedSeriesSource for MatFile {
        fn target_areas(&self, stream: &str) -> Result<Vec<String>, ConversionError> {
            self.group(stream)?.member_names().map_err(|e| error(&self.path, e))
        }

        fn subjects(&self, stream: &str, target_area: &str) -> Result<Vec<String>, ConversionError> {
            self.group(&format!("{stream}/{target_area}"))?
                .member_names()
                .map_err(|e| error(&self.path, e))
        }

        fn read_series(
            &self,
            stream: &str,
            target_area: &str,
            subject_id: &str,
            channel: &str,
        ) -> Result<Array1<f64>, ConversionError> {
            let dataset = self
                .group(&format!("{stream}/{target_area}/{subject_id}"))?
                .dataset(channel)
                .map_err(|e| error(&self.path, e))?;
            // MATLAB stores vectors as 1 x n or n x 1 matrices
            let values = dataset.read_raw::<f64>().map_err(|e| error(&self.path, e))?;
            Ok(Array1::from_vec(values))
        }
    }
}
