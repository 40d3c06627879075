//! Reading raw acquisition segments.
//!
//! A segment file stores everything one acquisition run produced, little
//! endian throughout:
//!
//! ```text
//! u32      magic number (0x46505331)
//! i16 i16  version major, minor
//! i64 u32  wall-clock start: seconds since 1970-01-01T00:00:00, nanoseconds
//! str      segment tag (may be empty)
//! u16      number of streams, then per stream:
//!   str      name
//!   f64      sampling rate (Hz)
//!   u16 u64  number of rows, number of samples
//!   u8       timestamp mode: 0 = implied by the rate, 1 = stored
//!   f64[n]   timestamps (mode 1 only)
//!   f32[r*n] samples, row-major
//! u16      number of event channels, then per channel:
//!   str      name
//!   u32      number of intervals
//!   f64 f64  onset, offset (repeated)
//! ```
//!
//! Strings are a `u32` byte length followed by UTF-8; a length of
//! `0xFFFFFFFF` means empty.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, NaiveDateTime};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::discover;
use crate::gaps::find_gaps;
use crate::types::*;

// Constants used throughout the reader
const SEGMENT_MAGIC_NUMBER: u32 = 0x4650_5331;
const CURRENT_VERSION: Version = Version { major: 1, minor: 0 };
const EMPTY_STRING_LENGTH: u32 = 0xFFFF_FFFF;
const TIMESTAMPS_IMPLIED: u8 = 0;
const TIMESTAMPS_STORED: u8 = 1;

/// File extension of raw segment files.
pub const SEGMENT_FILE_EXTENSION: &str = "fps";

/// Source of one recording segment.
///
/// The core only depends on this contract, not on how segments are stored.
pub trait RawStreamReader {
    /// Wall-clock time at which the segment's own clock reads zero.
    fn start_time(&self) -> NaiveDateTime;

    /// Label of the segment, used to tag its boundary interval.
    fn tag(&self) -> Option<&str>;

    /// Loads the samples and events between `t1` and `t2` seconds.
    ///
    /// `t1 = 0` reads from the start and `t2 = 0` reads to the end.
    fn load(&self, t1: f64, t2: f64) -> Result<RawSegment, ConversionError>;
}

/// Time window to read from every segment, in segment-relative seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub t1: f64,
    pub t2: f64,
}

impl TimeWindow {
    /// The whole recording.
    pub fn full() -> Self {
        TimeWindow::default()
    }

    /// A one-second window starting at `t1`, for quick test conversions.
    ///
    /// Fails if an end time was already requested.
    pub fn stub(self) -> Result<Self, ConversionError> {
        if self.t2 != 0.0 {
            return Err(ConversionError::InvalidParameter {
                name: "t2",
                reason: format!(
                    "a stub conversion cannot be combined with an explicit end time ({})",
                    self.t2
                ),
            });
        }
        Ok(TimeWindow {
            t1: self.t1,
            t2: self.t1 + 1.0,
        })
    }

    fn contains(&self, t: f64) -> bool {
        t >= self.t1 && (self.t2 == 0.0 || t < self.t2)
    }
}

impl RawSegment {
    /// Returns the part of the segment inside `window`.
    pub fn window(&self, window: TimeWindow) -> RawSegment {
        if window == TimeWindow::full() {
            return self.clone();
        }

        let streams = self
            .streams
            .iter()
            .map(|(name, stream)| {
                let keep: Vec<usize> = stream
                    .timestamps
                    .iter()
                    .enumerate()
                    .filter(|&(_, &t)| window.contains(t))
                    .map(|(i, _)| i)
                    .collect();
                let windowed = RawStream {
                    name: stream.name.clone(),
                    sampling_rate: stream.sampling_rate,
                    data: stream.data.select(Axis(1), &keep),
                    timestamps: stream.timestamps.select(Axis(0), &keep),
                };
                (name.clone(), windowed)
            })
            .collect();

        let events = self
            .events
            .iter()
            .map(|(name, intervals)| {
                let (onset, offset): (Vec<f64>, Vec<f64>) = intervals
                    .pairs()
                    .filter(|(on, _)| window.contains(*on))
                    .unzip();
                (name.clone(), EventIntervals { onset, offset })
            })
            .collect();

        RawSegment {
            start_time: self.start_time,
            tag: self.tag.clone(),
            streams,
            events,
        }
    }
}

impl RawStreamReader for RawSegment {
    fn start_time(&self) -> NaiveDateTime {
        self.start_time
    }

    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn load(&self, t1: f64, t2: f64) -> Result<RawSegment, ConversionError> {
        Ok(self.window(TimeWindow { t1, t2 }))
    }
}

/// A segment file on disk, parsed once when opened.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    /// Path of the segment file
    pub path: PathBuf,
    /// File format version
    pub version: Version,
    contents: RawSegment,
}

impl SegmentFile {
    /// Opens and parses a segment file.
    pub fn open<P: AsRef<Path>>(file_path: P) -> Result<Self, ConversionError> {
        let path = file_path.as_ref().to_path_buf();
        let (version, contents) = load_file(&path)?;
        Ok(SegmentFile {
            path,
            version,
            contents,
        })
    }

    /// Opens the single segment file inside a raw-data folder.
    ///
    /// The segment tag is taken from the folder layout when the file itself
    /// does not carry one.
    pub fn open_folder<P: AsRef<Path>>(folder_path: P) -> Result<Self, ConversionError> {
        let folder_path = folder_path.as_ref();
        let pattern = folder_path.join(format!("*.{SEGMENT_FILE_EXTENSION}"));
        let file_path = discover::find_exactly_one(&pattern.to_string_lossy())?;
        let mut segment = SegmentFile::open(file_path)?;
        if segment.contents.tag.is_none() {
            segment.contents.tag = discover::segment_tag(folder_path);
        }
        Ok(segment)
    }

    /// Returns the parsed contents without windowing.
    pub fn contents(&self) -> &RawSegment {
        &self.contents
    }
}

impl RawStreamReader for SegmentFile {
    fn start_time(&self) -> NaiveDateTime {
        self.contents.start_time
    }

    fn tag(&self) -> Option<&str> {
        self.contents.tag.as_deref()
    }

    fn load(&self, t1: f64, t2: f64) -> Result<RawSegment, ConversionError> {
        Ok(self.contents.window(TimeWindow { t1, t2 }))
    }
}

/// Loads a segment file and returns its version and contents.
///
/// This function uses buffered I/O; the whole segment is held in memory.
pub fn load_file<P: AsRef<Path>>(file_path: P) -> Result<(Version, RawSegment), ConversionError> {
    let tic = Instant::now();

    let file = File::open(file_path.as_ref())?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::with_capacity(65536, file);

    check_magic_number(&mut reader)?;
    let version = read_version_number(&mut reader)?;
    let start_time = read_start_time(&mut reader)?;
    let tag = read_string(&mut reader, file_size)?;
    let tag = if tag.is_empty() { None } else { Some(tag) };

    let num_streams = reader.read_u16::<LittleEndian>()?;
    let mut streams = BTreeMap::new();
    for _ in 0..num_streams {
        let stream = read_stream(&mut reader, file_size)?;
        check_timestamps(&stream);
        streams.insert(stream.name.clone(), stream);
    }

    let num_event_channels = reader.read_u16::<LittleEndian>()?;
    let mut events = EventMap::new();
    for _ in 0..num_event_channels {
        let (name, intervals) = read_event_channel(&mut reader, file_size)?;
        events.insert(name, intervals);
    }

    check_end_of_file(file_size, &mut reader)?;

    let segment = RawSegment {
        start_time,
        tag,
        streams,
        events,
    };
    print_segment_summary(file_path.as_ref(), &segment);
    debug!("Done! Elapsed time: {:.1} seconds", tic.elapsed().as_secs_f64());

    Ok((version, segment))
}

/// Helper function to check the magic number that identifies segment files
fn check_magic_number<R: Read>(reader: &mut R) -> Result<(), ConversionError> {
    let magic_number = reader.read_u32::<LittleEndian>()?;
    if magic_number != SEGMENT_MAGIC_NUMBER {
        return Err(ConversionError::UnrecognizedFileFormat(format!(
            "magic number {magic_number:#010x}"
        )));
    }
    Ok(())
}

fn read_version_number<R: Read>(reader: &mut R) -> Result<Version, ConversionError> {
    let version = Version {
        major: reader.read_i16::<LittleEndian>()?,
        minor: reader.read_i16::<LittleEndian>()?,
    };
    if version.major > CURRENT_VERSION.major {
        return Err(ConversionError::UnrecognizedFileFormat(format!(
            "unsupported version {}.{}",
            version.major, version.minor
        )));
    }
    Ok(version)
}

fn read_start_time<R: Read>(reader: &mut R) -> Result<NaiveDateTime, ConversionError> {
    let seconds = reader.read_i64::<LittleEndian>()?;
    let nanoseconds = reader.read_u32::<LittleEndian>()?;
    DateTime::from_timestamp(seconds, nanoseconds)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| ConversionError::Timestamp {
            value: format!("{seconds}.{nanoseconds:09}"),
            reason: "start time out of range".to_string(),
        })
}

/// Helper function to read a length-prefixed UTF-8 string
///
/// The length is checked against the bytes left in the file before
/// anything is allocated.
fn read_string<R: Read + Seek>(reader: &mut R, file_size: u64) -> Result<String, ConversionError> {
    let length = reader.read_u32::<LittleEndian>()?;
    if length == EMPTY_STRING_LENGTH {
        return Ok(String::new());
    }

    ensure_remaining(reader, file_size, length as u64, "string")?;
    let mut bytes = vec![0u8; length as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| ConversionError::UnrecognizedFileFormat(format!("invalid UTF-8 string: {e}")))
}

fn ensure_remaining<R: Seek>(
    reader: &mut R,
    file_size: u64,
    needed: u64,
    what: &str,
) -> Result<(), ConversionError> {
    let position = reader.stream_position()?;
    let remaining = file_size.saturating_sub(position);
    if needed > remaining {
        return Err(ConversionError::FileSizeError(format!(
            "{what} needs {needed} bytes but only {remaining} remain"
        )));
    }
    Ok(())
}

fn read_stream<R: Read + Seek>(reader: &mut R, file_size: u64) -> Result<RawStream, ConversionError> {
    let name = read_string(reader, file_size)?;
    let sampling_rate = reader.read_f64::<LittleEndian>()?;
    if !(sampling_rate > 0.0) {
        return Err(ConversionError::InvalidParameter {
            name: "sampling_rate",
            reason: format!("stream `{name}` declares {sampling_rate} Hz"),
        });
    }
    let num_rows = reader.read_u16::<LittleEndian>()?;
    let num_samples = reader.read_u64::<LittleEndian>()?;
    let timestamp_mode = reader.read_u8()?;

    // Sizes come from the file; nothing is allocated until the payload
    // they imply is known to fit in what is left of it.
    let overflow = |what: &str| {
        ConversionError::FileSizeError(format!(
            "{what} of stream `{name}` overflow ({num_rows} rows x {num_samples} samples)"
        ))
    };
    if num_rows == 0 && num_samples > 0 {
        return Err(ConversionError::FileSizeError(format!(
            "stream `{name}` declares {num_samples} samples but no rows"
        )));
    }
    let num_values = (num_rows as u64)
        .checked_mul(num_samples)
        .ok_or_else(|| overflow("samples"))?;
    let sample_bytes = num_values.checked_mul(4).ok_or_else(|| overflow("samples"))?;
    let timestamp_bytes = match timestamp_mode {
        TIMESTAMPS_IMPLIED => 0,
        TIMESTAMPS_STORED => num_samples.checked_mul(8).ok_or_else(|| overflow("timestamps"))?,
        other => {
            return Err(ConversionError::UnrecognizedFileFormat(format!(
                "unknown timestamp mode {other} for stream `{name}`"
            )))
        }
    };
    let payload_bytes = timestamp_bytes
        .checked_add(sample_bytes)
        .ok_or_else(|| overflow("payload"))?;
    ensure_remaining(reader, file_size, payload_bytes, "stream payload")?;

    let num_rows = num_rows as usize;
    let num_samples = usize::try_from(num_samples).map_err(|_| overflow("samples"))?;
    let num_values = usize::try_from(num_values).map_err(|_| overflow("samples"))?;

    let timestamps = if timestamp_mode == TIMESTAMPS_STORED {
        let mut timestamps = vec![0f64; num_samples];
        reader.read_f64_into::<LittleEndian>(&mut timestamps)?;
        Array1::from_vec(timestamps)
    } else {
        Array1::from_iter((0..num_samples).map(|i| i as f64 / sampling_rate))
    };

    let mut samples = vec![0f32; num_values];
    reader.read_f32_into::<LittleEndian>(&mut samples)?;
    let data = Array2::from_shape_vec(
        (num_rows, num_samples),
        samples.into_iter().map(f64::from).collect(),
    )?;

    Ok(RawStream {
        name,
        sampling_rate,
        data,
        timestamps,
    })
}

fn read_event_channel<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
) -> Result<(String, EventIntervals), ConversionError> {
    let name = read_string(reader, file_size)?;
    let count = reader.read_u32::<LittleEndian>()? as usize;
    ensure_remaining(reader, file_size, 16 * count as u64, "event intervals")?;

    let mut intervals = EventIntervals {
        onset: Vec::with_capacity(count),
        offset: Vec::with_capacity(count),
    };
    for _ in 0..count {
        intervals.onset.push(reader.read_f64::<LittleEndian>()?);
        intervals.offset.push(reader.read_f64::<LittleEndian>()?);
    }
    Ok((name, intervals))
}

/// Helper function to check end of file
///
/// Trailing bytes mean the layout was misread.
fn check_end_of_file<R: Read + Seek>(file_size: u64, reader: &mut R) -> Result<(), ConversionError> {
    let current_position = reader.stream_position()?;
    let bytes_remaining = file_size - current_position;

    if bytes_remaining != 0 {
        return Err(ConversionError::FileSizeError(format!(
            "{bytes_remaining} unexpected trailing bytes"
        )));
    }

    Ok(())
}

// Report dropouts; they are repaired later, not here
fn check_timestamps(stream: &RawStream) {
    let num_gaps = find_gaps(stream.timestamps.view(), stream.sampling_rate).len();

    if num_gaps == 0 {
        debug!("No missing timestamps in stream `{}`.", stream.name);
    } else {
        warn!(
            "{} gap{} in timestamps of stream `{}`. Time scale will not be uniform!",
            num_gaps,
            if num_gaps != 1 { "s" } else { "" },
            stream.name
        );
    }
}

fn print_segment_summary(path: &Path, segment: &RawSegment) {
    info!(
        "Read segment {} starting {} ({} stream{}, {} event channel{})",
        path.display(),
        segment.start_time,
        segment.streams.len(),
        if segment.streams.len() != 1 { "s" } else { "" },
        segment.events.len(),
        if segment.events.len() != 1 { "s" } else { "" },
    );
    for stream in segment.streams.values() {
        debug!(
            "  {}: {} row{} x {} samples at {:.4} Hz ({:.3} s)",
            stream.name,
            stream.num_rows(),
            if stream.num_rows() != 1 { "s" } else { "" },
            stream.num_samples(),
            stream.sampling_rate,
            stream.duration()
        );
    }
}

/// Writes `segment` as a segment file.
///
/// Streams whose timestamps are exactly `i / sampling_rate` are stored
/// without explicit timestamps.
pub fn write_segment_file<P: AsRef<Path>>(file_path: P, segment: &RawSegment) -> Result<(), ConversionError> {
    let mut writer = BufWriter::new(File::create(file_path.as_ref())?);

    writer.write_u32::<LittleEndian>(SEGMENT_MAGIC_NUMBER)?;
    writer.write_i16::<LittleEndian>(CURRENT_VERSION.major)?;
    writer.write_i16::<LittleEndian>(CURRENT_VERSION.minor)?;

    let start = segment.start_time.and_utc();
    writer.write_i64::<LittleEndian>(start.timestamp())?;
    writer.write_u32::<LittleEndian>(start.timestamp_subsec_nanos())?;
    write_string(&mut writer, segment.tag.as_deref().unwrap_or(""))?;

    writer.write_u16::<LittleEndian>(segment.streams.len() as u16)?;
    for stream in segment.streams.values() {
        write_string(&mut writer, &stream.name)?;
        writer.write_f64::<LittleEndian>(stream.sampling_rate)?;
        writer.write_u16::<LittleEndian>(stream.num_rows() as u16)?;
        writer.write_u64::<LittleEndian>(stream.num_samples() as u64)?;

        let implied = stream
            .timestamps
            .iter()
            .enumerate()
            .all(|(i, &t)| t == i as f64 / stream.sampling_rate);
        if implied {
            writer.write_u8(TIMESTAMPS_IMPLIED)?;
        } else {
            writer.write_u8(TIMESTAMPS_STORED)?;
            for &t in stream.timestamps.iter() {
                writer.write_f64::<LittleEndian>(t)?;
            }
        }

        for &value in stream.data.iter() {
            writer.write_f32::<LittleEndian>(value as f32)?;
        }
    }

    writer.write_u16::<LittleEndian>(segment.events.len() as u16)?;
    for (name, intervals) in &segment.events {
        write_string(&mut writer, name)?;
        writer.write_u32::<LittleEndian>(intervals.len() as u32)?;
        for (onset, offset) in intervals.pairs() {
            writer.write_f64::<LittleEndian>(onset)?;
            writer.write_f64::<LittleEndian>(offset)?;
        }
    }

    writer.flush()?;
    Ok(())
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), ConversionError> {
    if value.is_empty() {
        writer.write_u32::<LittleEndian>(EMPTY_STRING_LENGTH)?;
    } else {
        writer.write_u32::<LittleEndian>(value.len() as u32)?;
        writer.write_all(value.as_bytes())?;
    }
    Ok(())
}
