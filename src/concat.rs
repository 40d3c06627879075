//! Stitching independently recorded segments into one session timeline.
//!
//! Each segment keeps its own clock. Its samples are moved onto the session
//! timeline by adding the wall-clock distance between its start and the
//! first segment's start, then appended in order. Nothing is resampled.

use chrono::NaiveDateTime;
use log::{debug, info};
use ndarray::{concatenate, Array1, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::align::seconds_between;
use crate::gaps::fill_gaps;
use crate::reader::{RawStreamReader, TimeWindow};
use crate::types::*;

/// Largest difference in declared sampling rate still treated as the same rate (Hz).
pub const SAMPLING_RATE_TOLERANCE: f64 = 0.01;

/// Where NaN sentinels may be inserted when a channel has dropouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapFillPolicy {
    /// Keep the recorded timestamps as they are
    #[default]
    Disabled,
    /// Fill the whole concatenated channel, including the pauses between
    /// segments
    AcrossSegments,
    /// Fill each segment on its own; pauses between segments stay as
    /// recorded and are described by the segment boundaries
    WithinSegments,
}

/// Offsets of each segment from the first one, in seconds.
///
/// Start times must be strictly increasing.
pub fn segment_offsets(start_times: &[NaiveDateTime]) -> Result<Vec<f64>, ConversionError> {
    let first = *start_times.first().ok_or(ConversionError::EmptySession)?;

    for (index, pair) in start_times.windows(2).enumerate() {
        if pair[1] <= pair[0] {
            return Err(ConversionError::OutOfOrderSegments {
                index: index + 1,
                previous: pair[0],
                start: pair[1],
            });
        }
    }

    Ok(start_times.iter().map(|&start| seconds_between(first, start)).collect())
}

/// Picks `stream_indices` rows of a stream and flattens them.
///
/// Without indices every row is used. Rows are interleaved sample by
/// sample, so a single selected row comes out unchanged.
pub fn select_rows(stream: &RawStream, stream_indices: Option<&[usize]>) -> Result<Array1<f64>, ConversionError> {
    let selected = match stream_indices {
        Some(indices) => {
            if let Some(&bad) = indices.iter().find(|&&i| i >= stream.num_rows()) {
                return Err(ConversionError::InvalidParameter {
                    name: "stream_indices",
                    reason: format!(
                        "row {bad} requested but stream `{}` has {} row(s)",
                        stream.name,
                        stream.num_rows()
                    ),
                });
            }
            stream.data.select(Axis(0), indices)
        }
        None => stream.data.clone(),
    };

    // samples-major order, one sample of every selected row after another
    Ok(selected.t().iter().copied().collect())
}

/// Segments of one session, loaded and placed on a shared timeline.
#[derive(Debug, Clone)]
pub struct Concatenator {
    segments: Vec<RawSegment>,
    offsets: Vec<f64>,
}

impl Concatenator {
    /// Loads `window` from every reader.
    ///
    /// Ordering is checked before anything is read, so an out-of-order
    /// session fails without loading any data.
    pub fn load<R: RawStreamReader>(readers: &[R], window: TimeWindow) -> Result<Self, ConversionError> {
        let start_times: Vec<NaiveDateTime> = readers.iter().map(|r| r.start_time()).collect();
        let offsets = segment_offsets(&start_times)?;

        let mut segments = Vec::with_capacity(readers.len());
        for reader in readers {
            let mut segment = reader.load(window.t1, window.t2)?;
            if segment.tag.is_none() {
                segment.tag = reader.tag().map(str::to_string);
            }
            segments.push(segment);
        }

        info!(
            "Loaded {} segment{} at offsets {:?} s",
            segments.len(),
            if segments.len() != 1 { "s" } else { "" },
            offsets
        );
        Ok(Concatenator { segments, offsets })
    }

    /// Builds a concatenator from segments already in memory.
    pub fn from_segments(segments: Vec<RawSegment>) -> Result<Self, ConversionError> {
        let start_times: Vec<NaiveDateTime> = segments.iter().map(|s| s.start_time).collect();
        let offsets = segment_offsets(&start_times)?;
        Ok(Concatenator { segments, offsets })
    }

    pub fn segments(&self) -> &[RawSegment] {
        &self.segments
    }

    /// Offset of each segment from the session start, in seconds.
    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    /// Wall-clock start of the first segment.
    pub fn start_time(&self) -> NaiveDateTime {
        self.segments[0].start_time
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Concatenates the selected rows of `stream` across all segments.
    pub fn concatenate(
        &self,
        stream: &str,
        stream_indices: Option<&[usize]>,
        policy: GapFillPolicy,
    ) -> Result<ConcatenatedChannel, ConversionError> {
        self.concatenate_map(stream, policy, |raw| select_rows(raw, stream_indices))
    }

    /// Concatenates one derived channel per segment.
    ///
    /// `derive` turns a segment's copy of `stream` into a single channel
    /// holding one value per timestamp; demodulation plugs in here so each
    /// segment is filtered on its own.
    pub fn concatenate_map<F>(
        &self,
        stream: &str,
        policy: GapFillPolicy,
        mut derive: F,
    ) -> Result<ConcatenatedChannel, ConversionError>
    where
        F: FnMut(&RawStream) -> Result<Array1<f64>, ConversionError>,
    {
        let mut data_parts = Vec::with_capacity(self.segments.len());
        let mut timestamp_parts = Vec::with_capacity(self.segments.len());
        let mut boundaries = Vec::with_capacity(self.segments.len());
        let mut sampling_rate = None;
        let mut previous_end: Option<f64> = None;
        let mut num_inserted = 0;

        for (index, (segment, &offset)) in self.segments.iter().zip(&self.offsets).enumerate() {
            let raw = segment.stream(stream)?;

            let rate = *sampling_rate.get_or_insert(raw.sampling_rate);
            if (raw.sampling_rate - rate).abs() > SAMPLING_RATE_TOLERANCE {
                return Err(ConversionError::SamplingRateMismatch {
                    stream: stream.to_string(),
                    index,
                    expected: rate,
                    actual: raw.sampling_rate,
                });
            }

            let mut data = derive(raw)?;
            if data.len() != raw.timestamps.len() {
                return Err(ConversionError::LengthMismatch {
                    what: format!("stream `{stream}` in segment {index}"),
                    left: data.len(),
                    right: raw.timestamps.len(),
                });
            }

            let mut timestamps = &raw.timestamps + offset;
            if policy == GapFillPolicy::WithinSegments {
                let (filled, filled_timestamps) = fill_gaps(data.view(), timestamps.view(), rate)?;
                num_inserted += filled.len() - data.len();
                data = filled;
                timestamps = filled_timestamps;
            }

            let tag = segment.tag.clone().unwrap_or_else(|| format!("segment_{index}"));
            match (timestamps.first(), timestamps.last()) {
                (Some(&first), Some(&last)) => {
                    if let Some(end) = previous_end {
                        if first < end {
                            return Err(ConversionError::OverlappingSegments {
                                index: index - 1,
                                previous_end: end,
                                next_start: first,
                            });
                        }
                    }
                    previous_end = Some(last);
                    boundaries.push(SegmentBoundary { start: first, stop: last, tag });
                }
                _ => boundaries.push(SegmentBoundary {
                    start: offset,
                    stop: offset,
                    tag,
                }),
            }

            data_parts.push(data);
            timestamp_parts.push(timestamps);
        }

        let sampling_rate = sampling_rate.ok_or(ConversionError::EmptySession)?;
        let mut data = join(&data_parts)?;
        let mut timestamps = join(&timestamp_parts)?;

        if policy == GapFillPolicy::AcrossSegments {
            let (filled, filled_timestamps) = fill_gaps(data.view(), timestamps.view(), sampling_rate)?;
            num_inserted += filled.len() - data.len();
            data = filled;
            timestamps = filled_timestamps;
        }

        debug!(
            "Concatenated `{}`: {} samples ({} sentinel{})",
            stream,
            data.len(),
            num_inserted,
            if num_inserted != 1 { "s" } else { "" }
        );

        Ok(ConcatenatedChannel {
            data,
            timestamps,
            sampling_rate,
            boundaries,
            num_inserted,
        })
    }

    /// Event channels of every segment on the session timeline.
    ///
    /// Intervals of segment `i` are shifted by its offset and appended in
    /// segment order.
    pub fn events(&self) -> EventMap {
        let mut merged = EventMap::new();
        for (segment, &offset) in self.segments.iter().zip(&self.offsets) {
            for (name, intervals) in segment.get_events() {
                let shifted = intervals.shifted(offset);
                let entry = merged.entry(name.clone()).or_default();
                entry.onset.extend(shifted.onset);
                entry.offset.extend(shifted.offset);
            }
        }
        merged
    }
}

fn join(parts: &[Array1<f64>]) -> Result<Array1<f64>, ConversionError> {
    let views: Vec<ArrayView1<f64>> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}
