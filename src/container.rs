//! Output container: one serializable record per converted session.

use chrono::NaiveDateTime;
use log::info;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::gaps::{regular_series_rate, RATE_TOLERANCE_DECIMALS};
use crate::stimulus::{OptogeneticEpoch, ShockStimulus};
use crate::types::{ConversionError, SegmentBoundary};

/// How sample times of a series are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Timing {
    /// Sample `i` is at `starting_time + i / rate`
    StartingTimeAndRate { starting_time: f64, rate: f64 },
    /// One time per sample
    Timestamps { timestamps: Array1<f64> },
}

impl Timing {
    /// Uses a starting time and rate when `infer_rate` is set and the
    /// series is regular, explicit timestamps otherwise.
    pub fn for_timestamps(timestamps: Array1<f64>, infer_rate: bool) -> Self {
        if infer_rate {
            if let Some(rate) = regular_series_rate(timestamps.view(), RATE_TOLERANCE_DECIMALS) {
                return Timing::StartingTimeAndRate {
                    starting_time: timestamps[0],
                    rate,
                };
            }
        }
        Timing::Timestamps { timestamps }
    }

    /// Time of sample `index`.
    pub fn time_of(&self, index: usize) -> Option<f64> {
        match self {
            Timing::StartingTimeAndRate { starting_time, rate } => Some(starting_time + index as f64 / rate),
            Timing::Timestamps { timestamps } => timestamps.get(index).copied(),
        }
    }
}

/// One photometry series on the session timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub name: String,
    pub description: String,
    pub unit: String,
    /// Raw stream the series was read or demodulated from
    pub stream_name: String,
    #[serde(default)]
    pub driver_freq: Option<f64>,
    /// Sample values; missing samples are written as `null`
    #[serde(with = "nan_as_null")]
    pub data: Array1<f64>,
    pub timing: Timing,
    /// Number of samples inserted for dropouts
    #[serde(default)]
    pub num_missing_samples: usize,
    /// Rows of the fiber photometry table the series was recorded from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fiber_photometry_table_region: Vec<usize>,
}

/// A behavioral video referenced by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalVideo {
    pub name: String,
    pub file_path: PathBuf,
    /// Offset of the video's first frame on the session timeline (s)
    pub starting_time: f64,
}

/// A tagged stretch of the session, e.g. one recording segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialInterval {
    pub start_time: f64,
    pub stop_time: f64,
    pub tags: Vec<String>,
}

impl From<&SegmentBoundary> for TrialInterval {
    fn from(boundary: &SegmentBoundary) -> Self {
        TrialInterval {
            start_time: boundary.start,
            stop_time: boundary.stop,
            tags: vec![boundary.tag.clone()],
        }
    }
}

/// Everything written for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContainer {
    pub subject_id: String,
    pub session_id: String,
    pub session_start_time: NaiveDateTime,
    pub session_description: String,
    /// Merged metadata template the session was described with
    pub metadata: serde_yaml::Value,
    pub response_series: Vec<TimeSeries>,
    /// Series exported by the offline analysis, on the same timeline
    #[serde(default)]
    pub processed_series: Vec<TimeSeries>,
    #[serde(default)]
    pub trials: Vec<TrialInterval>,
    #[serde(default)]
    pub optogenetic_epochs: Vec<OptogeneticEpoch>,
    #[serde(default)]
    pub shock_stimuli: Vec<ShockStimulus>,
    #[serde(default)]
    pub videos: Vec<ExternalVideo>,
}

impl SessionContainer {
    /// File name without extension: `sub-{subject}_ses-{session}`.
    pub fn file_stem(&self) -> String {
        format!("sub-{}_ses-{}", self.subject_id, self.session_id)
    }

    /// Looks up a raw, demodulated or processed series by name.
    pub fn series(&self, name: &str) -> Option<&TimeSeries> {
        self.response_series
            .iter()
            .chain(&self.processed_series)
            .find(|s| s.name == name)
    }
}

/// Destination for converted sessions.
pub trait ContainerWriter {
    /// Writes `container` into `output_dir` and returns the file written.
    fn write(&self, container: &SessionContainer, output_dir: &Path) -> Result<PathBuf, ConversionError>;
}

/// Writes containers as JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonContainerWriter {
    pub pretty: bool,
}

impl ContainerWriter for JsonContainerWriter {
    fn write(&self, container: &SessionContainer, output_dir: &Path) -> Result<PathBuf, ConversionError> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join(format!("{}.json", container.file_stem()));

        let mut writer = BufWriter::new(File::create(&path)?);
        if self.pretty {
            serde_json::to_writer_pretty(&mut writer, container)?;
        } else {
            serde_json::to_writer(&mut writer, container)?;
        }
        writer.flush()?;

        info!("Session written to {}", path.display());
        Ok(path)
    }
}

/// Reads back a container written by [`JsonContainerWriter`].
pub fn read_container<P: AsRef<Path>>(path: P) -> Result<SessionContainer, ConversionError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    Ok(serde_json::from_reader(reader)?)
}

/// NaN sentinels as `null`, so they survive formats without NaN.
mod nan_as_null {
    use ndarray::Array1;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Array1<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(data.iter().map(|v| if v.is_nan() { None } else { Some(*v) }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array1<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ndarray::array;

    fn container() -> SessionContainer {
        SessionContainer {
            subject_id: "C4550".to_string(),
            session_id: "varying_frequencies".to_string(),
            session_start_time: NaiveDate::from_ymd_opt(2024, 1, 18)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            session_description: "test".to_string(),
            metadata: serde_yaml::from_str("Subject:\n  sex: M\n").unwrap(),
            response_series: vec![TimeSeries {
                name: "calcium_SN".to_string(),
                description: String::new(),
                unit: "a.u.".to_string(),
                stream_name: "Fi1r".to_string(),
                driver_freq: Some(330.0),
                data: array![1.0, f64::NAN, 3.0],
                timing: Timing::StartingTimeAndRate {
                    starting_time: 0.0,
                    rate: 10.0,
                },
                num_missing_samples: 1,
                fiber_photometry_table_region: vec![0],
            }],
            processed_series: Vec::new(),
            trials: vec![TrialInterval {
                start_time: 0.0,
                stop_time: 0.2,
                tags: vec!["1s".to_string()],
            }],
            optogenetic_epochs: Vec::new(),
            shock_stimuli: Vec::new(),
            videos: Vec::new(),
        }
    }

    #[test]
    fn sentinels_are_written_as_null_and_read_back_as_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = JsonContainerWriter { pretty: false }
            .write(&container(), dir.path())
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "sub-C4550_ses-varying_frequencies.json");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[1.0,null,3.0]"));

        let back = read_container(&path).unwrap();
        let data = &back.series("calcium_SN").unwrap().data;
        assert_eq!(data[0], 1.0);
        assert!(data[1].is_nan());
        assert_eq!(back.trials, container().trials);
        assert_eq!(back.metadata["Subject"]["sex"].as_str(), Some("M"));
    }

    #[test]
    fn regular_series_is_stored_as_rate() {
        let timestamps = Array1::from_iter((0..100).map(|i| 5.0 + i as f64 / 20.0));
        match Timing::for_timestamps(timestamps.clone(), true) {
            Timing::StartingTimeAndRate { starting_time, rate } => {
                assert_eq!(starting_time, 5.0);
                assert!((rate - 20.0).abs() < 1e-9);
            }
            other => panic!("expected a rate, got {other:?}"),
        }
        assert!(matches!(Timing::for_timestamps(timestamps, false), Timing::Timestamps { .. }));
    }

    #[test]
    fn irregular_series_keeps_timestamps() {
        let timing = Timing::for_timestamps(array![0.0, 0.1, 0.3], true);
        assert_eq!(timing.time_of(2), Some(0.3));
        assert_eq!(timing.time_of(3), None);
    }
}
