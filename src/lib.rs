//! Fiber photometry session conversion.
//!
//! Raw recordings arrive as one or more segments, each a frequency-multiplexed
//! photodetector stream with its own clock. This crate demodulates the
//! carriers, stitches the segments onto one timeline, marks dropouts,
//! aligns behavioral videos and writes one container per session, together
//! with the series the offline analysis exported for it.

pub mod align;
pub mod batch;
pub mod concat;
pub mod config;
pub mod container;
pub mod demodulate;
pub mod discover;
pub mod gaps;
pub mod metadata;
pub mod processed;
pub mod reader;
pub mod session;
pub mod stimulus;
pub mod types;

use std::path::{Path, PathBuf};

// Re-export types
pub use types::*;

pub use batch::{convert_batch, BatchReport};
pub use concat::{Concatenator, GapFillPolicy};
pub use config::{RecordingProfile, SessionConfig};
pub use processed::{ProcessedSeriesSource, ProcessedSeriesTable};
pub use container::{ContainerWriter, JsonContainerWriter, SessionContainer};
pub use reader::{RawStreamReader, SegmentFile, TimeWindow};
pub use session::{convert_session, SessionRequest};

/// Loads a raw segment file
///
/// # Examples
///
/// ```no_run
/// use fiber_photometry_importer::load;
///
/// let result = load("path/to/segment.fps");
/// match result {
///     Ok(segment) => println!("Streams: {:?}", segment.stream_names()),
///     Err(e) => println!("Error loading file: {}", e),
/// }
/// ```
pub fn load<P: AsRef<Path>>(file_path: P) -> Result<RawSegment, ConversionError> {
    Ok(reader::load_file(file_path)?.1)
}

/// Converts one session described by a YAML request file
///
/// The container is written as JSON under the request's output folder.
///
/// # Examples
///
/// ```no_run
/// use fiber_photometry_importer::convert;
///
/// let written = convert("requests/C4550_varying_frequencies.yaml").unwrap();
/// println!("Wrote {}", written.display());
/// ```
pub fn convert<P: AsRef<Path>>(request_path: P) -> Result<PathBuf, ConversionError> {
    let text = std::fs::read_to_string(request_path.as_ref())?;
    let request: SessionRequest = serde_yaml::from_str(&text)?;
    convert_session(&request, &JsonContainerWriter { pretty: false })
}
