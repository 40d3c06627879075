//! Converting one session: discovery, signal processing, metadata, output.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

use crate::align::{compute_offset, video_file_id, VideoStartTable, VIDEO_START_TABLE};
use crate::concat::{select_rows, Concatenator, GapFillPolicy, SAMPLING_RATE_TOLERANCE};
use crate::config::{FolderLayout, RecordingProfile, SessionConfig};
use crate::container::{ContainerWriter, ExternalVideo, SessionContainer, TimeSeries, Timing, TrialInterval};
use crate::demodulate::{demodulate_pair, Carrier};
use crate::discover;
use crate::metadata::{self, ResponseSeriesMetadata};
use crate::processed::{self, ProcessedSegment, ProcessedSeriesSource, PROCESSED_STREAMS};
use crate::reader::{SegmentFile, TimeWindow};
use crate::stimulus::{optogenetic_epochs, shock_stimuli, ChannelAliases};
use crate::types::{ConcatenatedChannel, ConversionError, DemodulatedPair};

/// Everything needed to convert one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub config: SessionConfig,
    /// Folder holding the session's raw segment folders
    pub protocol_dir: PathBuf,
    /// YAML metadata template for the subject's cohort
    pub metadata_path: PathBuf,
    /// Further templates merged over the cohort template in order, e.g.
    /// stimulus descriptions shared between cohorts
    #[serde(default)]
    pub extra_metadata_paths: Vec<PathBuf>,
    /// Folder holding behavioral videos and their start-time table
    #[serde(default)]
    pub video_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    /// Convert only one second of every segment
    #[serde(default)]
    pub stub_test: bool,
    #[serde(default)]
    pub window: TimeWindow,
    /// Also convert the series of the protocol folder's processed file
    #[serde(default)]
    pub include_processed: bool,
}

/// Locates the raw segment folders of a session.
pub fn session_folders(protocol_dir: &Path, folder_id: &str, layout: FolderLayout) -> Result<Vec<PathBuf>, ConversionError> {
    match layout {
        FolderLayout::Single => {
            let folders = discover::segment_folders(protocol_dir, folder_id, false)?;
            if folders.len() != 1 {
                return Err(ConversionError::Discovery {
                    pattern: protocol_dir.join(format!("{folder_id}-*")).display().to_string(),
                    found: folders.len(),
                });
            }
            Ok(folders)
        }
        FolderLayout::Flat => discover::segment_folders(protocol_dir, folder_id, false),
        FolderLayout::Grouped => discover::segment_folders(protocol_dir, folder_id, true),
    }
}

/// Converts one session and writes it with `writer`.
///
/// Returns the path of the written container.
pub fn convert_session<W: ContainerWriter + ?Sized>(
    request: &SessionRequest,
    writer: &W,
) -> Result<PathBuf, ConversionError> {
    let config = &request.config;
    let profile = config.profile();
    let folder_id = config.subject.folder_id();
    info!(
        "Converting subject {} ({}, {}, {})",
        config.subject.subject_id, config.protocol_type, config.recording_type, config.stimulus_location
    );

    let folders = session_folders(&request.protocol_dir, folder_id, profile.folder_layout)?;
    let readers = folders
        .iter()
        .map(SegmentFile::open_folder)
        .collect::<Result<Vec<_>, _>>()?;

    let window = if request.stub_test {
        request.window.stub()?
    } else {
        request.window
    };
    let session = Concatenator::load(&readers, window)?;

    let mut template = metadata::load_template(&request.metadata_path)?;
    for path in &request.extra_metadata_paths {
        metadata::deep_update(&mut template, &metadata::load_template(path)?);
    }

    let processed_source = if request.include_processed && !profile.processed_channels.is_empty() {
        let path = discover::processed_file(&request.protocol_dir)?;
        Some(processed::open_processed_file(&path)?)
    } else {
        None
    };
    let processed = processed_source
        .as_deref()
        .map(|source| load_processed(source, config, &profile, &session, window))
        .transpose()?;

    let (videos, video_table) = if profile.expected_videos > 0 {
        let video_dir = request
            .video_dir
            .as_deref()
            .ok_or_else(|| ConversionError::MissingMetadataKey("video_dir".to_string()))?;
        let videos = discover::video_files(video_dir, folder_id, profile.expected_videos)?;
        let table = VideoStartTable::from_csv_path(video_dir.join(VIDEO_START_TABLE))?;
        (videos, Some(table))
    } else {
        (Vec::new(), None)
    };

    let container = assemble_session(
        config,
        &profile,
        &session,
        processed.as_ref(),
        template,
        &videos,
        video_table.as_ref(),
    )?;

    let output_dir = if request.stub_test {
        request.output_dir.join("stub")
    } else {
        request.output_dir.clone()
    };
    writer.write(&container, &output_dir)
}

/// Places the processed series of a session on the raw session's timeline.
///
/// Each raw segment contributes the processed channel of its sub-session,
/// starting at the same wall-clock time, so both share offsets.
pub fn load_processed<S: ProcessedSeriesSource + ?Sized>(
    source: &S,
    config: &SessionConfig,
    profile: &RecordingProfile,
    session: &Concatenator,
    window: TimeWindow,
) -> Result<Concatenator, ConversionError> {
    let subject_id = config.subject.folder_id();
    let target_area = processed::target_area_for_subject(source, subject_id)?;
    if target_area != config.subject.target_area {
        warn!(
            "Processed series of {} are under {}, the subject sheet says {}",
            subject_id, target_area, config.subject.target_area
        );
    }

    let tags: Vec<Option<&str>> = session.segments().iter().map(|s| s.tag.as_deref()).collect();
    let channels = processed::segment_channels(&profile.processed_channels, &tags)?;
    let readers: Vec<_> = channels
        .iter()
        .zip(session.segments())
        .map(|(channel, segment)| {
            ProcessedSegment::new(
                source,
                &target_area,
                subject_id,
                channel,
                segment.start_time,
                segment.tag.clone(),
                profile.raw_sampling_frequency,
            )
        })
        .collect();
    Concatenator::load(&readers, window)
}

/// Builds the container for a session whose segments are already loaded.
pub fn assemble_session(
    config: &SessionConfig,
    profile: &RecordingProfile,
    session: &Concatenator,
    processed: Option<&Concatenator>,
    template: Value,
    videos: &[PathBuf],
    video_table: Option<&VideoStartTable>,
) -> Result<SessionContainer, ConversionError> {
    let subject = &config.subject;
    let session_id = config.session_id();
    let session_start_time = session.start_time();

    let mut metadata = template;
    metadata::apply_hemisphere(&mut metadata, subject.hemisphere);
    metadata::filter_by_target_area(&mut metadata, &subject.target_area);
    metadata::filter_by_stimulus_location(&mut metadata, config.stimulus_location.label());
    metadata::deep_update(&mut metadata, &session_metadata(config, profile, session));

    let raw_series = metadata::series_for_stream(&metadata, &profile.raw_stream)?;
    check_declared_rate(session, profile, &raw_series)?;

    // both carriers come out of one filtering pass per segment
    let pairs = if raw_series.iter().any(|s| s.driver_freq.is_some()) {
        demodulate_segments(session, profile)?
    } else {
        Vec::new()
    };

    let mut response_series = Vec::new();
    let mut boundaries = Vec::new();
    for series in raw_series {
        let channel = match series.driver_freq {
            Some(driver_freq) => {
                let carrier = profile.drivers.carrier_of(driver_freq)?;
                demodulated_channel(session, profile, &pairs, carrier)?
            }
            None => session.concatenate(&profile.raw_stream, profile.stream_indices.as_deref(), profile.gap_fill)?,
        };
        if boundaries.is_empty() {
            boundaries = channel.boundaries.clone();
        }
        response_series.push(time_series(series, channel, profile.gap_fill));
    }

    let processed_series = match processed {
        Some(processed) => PROCESSED_STREAMS
            .iter()
            .map(|stream| {
                let series = metadata::processed_series_for_stream(&metadata, stream)?;
                let channel = processed.concatenate(stream, None, profile.gap_fill)?;
                Ok(time_series(series, channel, profile.gap_fill))
            })
            .collect::<Result<Vec<_>, ConversionError>>()?,
        None => Vec::new(),
    };

    // a single segment needs no boundary annotation
    let trials = if session.len() > 1 {
        boundaries.iter().map(TrialInterval::from).collect()
    } else {
        Vec::new()
    };

    let events = session.events();
    let aliases = ChannelAliases::default().with_overrides(&config.channel_name_overrides);
    let optogenetic_epochs = if profile.stimulus_channels.is_empty() {
        Vec::new()
    } else {
        let settings = metadata::optogenetic_settings(&metadata)?;
        optogenetic_epochs(&events, &profile.stimulus_channels, &aliases, settings)
    };
    let shock_stimuli = match metadata::shock_protocol(&metadata)? {
        Some(protocol) => shock_stimuli(&events, &protocol, &aliases)?,
        None => Vec::new(),
    };

    let videos = align_videos(videos, video_table, session)?;

    Ok(SessionContainer {
        subject_id: subject.subject_id.clone(),
        session_id,
        session_start_time,
        session_description: profile.session_description.clone(),
        metadata,
        response_series,
        processed_series,
        trials,
        optogenetic_epochs,
        shock_stimuli,
        videos,
    })
}

/// Values derived from the session itself, merged over the templates.
fn session_metadata(config: &SessionConfig, profile: &RecordingProfile, session: &Concatenator) -> Value {
    let mut subject = Mapping::new();
    subject.insert("subject_id".into(), config.subject.subject_id.as_str().into());
    subject.insert("sex".into(), config.subject.sex.as_str().into());

    let mut nwbfile = Mapping::new();
    nwbfile.insert("session_id".into(), config.session_id().into());
    nwbfile.insert("session_description".into(), profile.session_description.as_str().into());
    nwbfile.insert("session_start_time".into(), session.start_time().to_string().into());

    let mut derived = Mapping::new();
    derived.insert("Subject".into(), Value::Mapping(subject));
    derived.insert("NWBFile".into(), Value::Mapping(nwbfile));
    Value::Mapping(derived)
}

fn time_series(series: ResponseSeriesMetadata, channel: ConcatenatedChannel, gap_fill: GapFillPolicy) -> TimeSeries {
    info!(
        "Series `{}`: {} samples, {} missing",
        series.name,
        channel.len(),
        channel.num_inserted
    );
    TimeSeries {
        name: series.name,
        description: series.description,
        unit: series.unit,
        stream_name: series.stream_name,
        driver_freq: series.driver_freq,
        data: channel.data,
        timing: Timing::for_timestamps(channel.timestamps, gap_fill != GapFillPolicy::Disabled),
        num_missing_samples: channel.num_inserted,
        fiber_photometry_table_region: series.fiber_photometry_table_region,
    }
}

fn demodulate_segments(session: &Concatenator, profile: &RecordingProfile) -> Result<Vec<DemodulatedPair>, ConversionError> {
    session
        .segments()
        .iter()
        .map(|segment| {
            let raw = segment.stream(&profile.raw_stream)?;
            let signal = select_rows(raw, profile.stream_indices.as_deref())?;
            demodulate_pair(
                signal.view(),
                raw.timestamps.view(),
                raw.sampling_rate,
                profile.drivers,
                profile.cutoff_frequency,
            )
        })
        .collect()
}

fn demodulated_channel(
    session: &Concatenator,
    profile: &RecordingProfile,
    pairs: &[DemodulatedPair],
    carrier: Carrier,
) -> Result<ConcatenatedChannel, ConversionError> {
    // segments are visited in order, one call each
    let mut pairs = pairs.iter();
    session.concatenate_map(&profile.raw_stream, profile.gap_fill, |raw| {
        pairs
            .next()
            .map(|pair| pair.channel(carrier).clone())
            .ok_or_else(|| ConversionError::MissingStream {
                name: raw.name.clone(),
                available: Vec::new(),
            })
    })
}

/// Checks every segment's rate against the rates the session declares.
///
/// A template entry's `sampling_frequency` must match the recording; a
/// profile rate that differs only draws a warning, since the rigs report
/// slightly different nominal rates.
fn check_declared_rate(
    session: &Concatenator,
    profile: &RecordingProfile,
    series: &[ResponseSeriesMetadata],
) -> Result<(), ConversionError> {
    for (index, segment) in session.segments().iter().enumerate() {
        let Ok(rate) = segment.get_sampling_rate(&profile.raw_stream) else {
            continue;
        };
        if (rate - profile.raw_sampling_frequency).abs() > SAMPLING_RATE_TOLERANCE {
            warn!(
                "Segment {} declares {} Hz for `{}`, expected {} Hz",
                index, rate, profile.raw_stream, profile.raw_sampling_frequency
            );
        }
        for declared in series.iter().filter_map(|s| s.sampling_frequency) {
            if (rate - declared).abs() > SAMPLING_RATE_TOLERANCE {
                return Err(ConversionError::SamplingRateMismatch {
                    stream: profile.raw_stream.clone(),
                    index,
                    expected: declared,
                    actual: rate,
                });
            }
        }
    }
    Ok(())
}

fn align_videos(
    videos: &[PathBuf],
    video_table: Option<&VideoStartTable>,
    session: &Concatenator,
) -> Result<Vec<ExternalVideo>, ConversionError> {
    if videos.is_empty() {
        return Ok(Vec::new());
    }
    let table = video_table.ok_or_else(|| ConversionError::MissingMetadataKey(VIDEO_START_TABLE.to_string()))?;

    videos
        .iter()
        .map(|path| {
            let starting_time = compute_offset(table, &video_file_id(path)?, session.start_time())?;
            let name = match (videos.len(), discover::video_suffix(path)) {
                (1, _) | (_, None) => "BehavioralVideo".to_string(),
                (_, Some(suffix)) => format!("BehavioralVideo_{suffix}"),
            };
            Ok(ExternalVideo {
                name,
                file_path: path.clone(),
                starting_time,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::StartTimeEntry;
    use crate::config::{Hemisphere, SubjectInfo};
    use crate::container::{read_container, JsonContainerWriter};
    use crate::processed::ProcessedSeriesTable;
    use crate::reader::write_segment_file;
    use crate::types::{EventIntervals, EventMap, RawSegment, RawStream};
    use chrono::{NaiveDate, NaiveDateTime};
    use ndarray::{Array1, Array2};
    use std::collections::BTreeMap;
    use std::f64::consts::PI;

    const TEMPLATE: &str = r#"
Ophys:
  FiberPhotometry:
    FiberPhotometryResponseSeries:
      - name: raw_SN
        stream_name: Fi1r
        target_area: SN
      - name: calcium_SN
        stream_name: Fi1r
        target_area: SN
        driver_freq: 330
      - name: isosbestic_SN
        stream_name: Fi1r
        target_area: SN
        driver_freq: 210
      - name: calcium_STR
        stream_name: Fi1r
        target_area: STR
        driver_freq: 330
    ProcessedFiberPhotometryResponseSeries:
      - name: calcium_demodulated_SN
        stream_name: Gc_raw
        target_area: SN
      - name: isosbestic_demodulated_SN
        stream_name: af_raw
        target_area: SN
      - name: calcium_downsampled_SN
        stream_name: Gc
        target_area: SN
      - name: isosbestic_downsampled_SN
        stream_name: af
        target_area: SN
      - name: dff_SN
        stream_name: dF
        target_area: SN
        unit: "%"
Optogenetics:
  power_in_mW: 5.0
  excitation_wavelength_in_nm: 473
"#;

    fn at(m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 18)
            .unwrap()
            .and_hms_opt(10, m, 0)
            .unwrap()
    }

    fn config() -> SessionConfig {
        SessionConfig {
            protocol_type: "Varying frequencies".parse().unwrap(),
            recording_type: "SN pan GABA recordings".parse().unwrap(),
            stimulus_location: "PPN".parse().unwrap(),
            channel_name_overrides: BTreeMap::new(),
            subject: SubjectInfo {
                subject_id: "C4550".to_string(),
                sex: "M".to_string(),
                hemisphere: Hemisphere::Left,
                target_area: "SN".to_string(),
                recording_site: None,
                folder_id: None,
                high_rate_rig: false,
            },
        }
    }

    fn segment(start: NaiveDateTime, fs: f64, seconds: f64, tag: &str) -> RawSegment {
        let n = (seconds * fs) as usize;
        let data = Array2::from_shape_fn((1, n), |(_, i)| {
            let t = i as f64 / fs;
            2.0 * (2.0 * PI * 330.0 * t).cos() + (2.0 * PI * 210.0 * t).cos()
        });
        let mut streams = BTreeMap::new();
        streams.insert("Fi1r".to_string(), RawStream::regular("Fi1r", fs, data));
        let mut events = EventMap::new();
        events.insert("H10_".to_string(), EventIntervals { onset: vec![0.5], offset: vec![1.0] });
        RawSegment {
            start_time: start,
            tag: Some(tag.to_string()),
            streams,
            events,
        }
    }

    #[test]
    fn two_segments_become_one_session() {
        let fs = 2000.0;
        let session = Concatenator::from_segments(vec![
            segment(at(0), fs, 2.0, "250ms"),
            segment(at(20), fs, 2.0, "1s"),
        ])
        .unwrap();
        let mut profile = config().profile();
        profile.gap_fill = GapFillPolicy::Disabled;
        let template: Value = serde_yaml::from_str(TEMPLATE).unwrap();

        let container = assemble_session(&config(), &profile, &session, None, template, &[], None).unwrap();

        assert_eq!(container.response_series.len(), 3);
        assert!(container.series("calcium_STR").is_none());
        let calcium = container.series("calcium_SN").unwrap();
        assert_eq!(calcium.data.len(), 8000);
        assert!(matches!(calcium.timing, Timing::Timestamps { .. }));
        assert_eq!(calcium.timing.time_of(4000), Some(1200.0));

        assert_eq!(container.trials.len(), 2);
        assert_eq!(container.trials[1].tags, vec!["1s".to_string()]);

        assert_eq!(container.optogenetic_epochs.len(), 2);
        assert_eq!(container.optogenetic_epochs[1].start_time, 1200.5);
        assert_eq!(container.optogenetic_epochs[1].number_pulses_per_pulse_train, 5);

        assert_eq!(container.metadata["Subject"]["subject_id"].as_str(), Some("C4550"));
        assert_eq!(container.file_stem(), "sub-C4550_ses-varying_frequencies");
    }

    #[test]
    fn demodulated_series_recover_carrier_amplitudes() {
        let fs = 2000.0;
        let session = Concatenator::from_segments(vec![segment(at(0), fs, 4.0, "only")]).unwrap();
        let template: Value = serde_yaml::from_str(TEMPLATE).unwrap();
        let container = assemble_session(&config(), &config().profile(), &session, None, template, &[], None).unwrap();

        assert!(container.trials.is_empty());
        let middle = 4000;
        let calcium = container.series("calcium_SN").unwrap().data[middle];
        let isosbestic = container.series("isosbestic_SN").unwrap().data[middle];
        assert!((calcium - 1.0).abs() < 0.05, "calcium envelope {calcium}");
        assert!((isosbestic - 0.5).abs() < 0.05, "isosbestic envelope {isosbestic}");
    }

    #[test]
    fn videos_are_placed_after_session_start() {
        let session = Concatenator::from_segments(vec![segment(at(0), 1000.0, 1.0, "only")]).unwrap();
        let table = VideoStartTable::from_entries(vec![StartTimeEntry {
            file_name: "C4550_1s.mp4".to_string(),
            start_time: at(0) + chrono::TimeDelta::seconds(4),
        }]);
        let videos = vec![PathBuf::from("/videos/C4550_1s.mp4")];
        let aligned = align_videos(&videos, Some(&table), &session).unwrap();
        assert_eq!(aligned[0].starting_time, 4.0);
        assert_eq!(aligned[0].name, "BehavioralVideo");

        let unknown = vec![PathBuf::from("/videos/C4550_4s.mp4")];
        assert!(matches!(
            align_videos(&unknown, Some(&table), &session),
            Err(ConversionError::Lookup { .. })
        ));
    }

    #[test]
    fn missing_optogenetic_settings_fail_loudly() {
        let session = Concatenator::from_segments(vec![segment(at(0), 1000.0, 1.0, "only")]).unwrap();
        let template: Value = serde_yaml::from_str(
            "Ophys:\n  FiberPhotometry:\n    FiberPhotometryResponseSeries:\n      - name: raw\n        stream_name: Fi1r\n        target_area: SN\n",
        )
        .unwrap();
        let err = assemble_session(&config(), &config().profile(), &session, None, template, &[], None).unwrap_err();
        assert!(matches!(err, ConversionError::MissingMetadataKey(_)));
    }

    #[test]
    fn unknown_driver_frequency_is_rejected() {
        let session = Concatenator::from_segments(vec![segment(at(0), 1000.0, 1.0, "only")]).unwrap();
        let mut template: Value = serde_yaml::from_str(TEMPLATE).unwrap();
        template["Ophys"]["FiberPhotometry"]["FiberPhotometryResponseSeries"][1]["driver_freq"] = Value::from(400);

        let err = assemble_session(&config(), &config().profile(), &session, None, template, &[], None).unwrap_err();
        assert!(matches!(err, ConversionError::InvalidParameter { name: "driver_freq", .. }));
    }

    #[test]
    fn declared_series_rate_must_match_the_recording() {
        let session = Concatenator::from_segments(vec![segment(at(0), 2000.0, 1.0, "only")]).unwrap();
        let mut template: Value = serde_yaml::from_str(TEMPLATE).unwrap();
        let raw_entry = &mut template["Ophys"]["FiberPhotometry"]["FiberPhotometryResponseSeries"][0];
        raw_entry["fiber_photometry_table_region"] = serde_yaml::from_str("[0, 1]").unwrap();

        raw_entry["sampling_frequency"] = Value::from(2000.0);
        let container =
            assemble_session(&config(), &config().profile(), &session, None, template.clone(), &[], None).unwrap();
        assert_eq!(container.series("raw_SN").unwrap().fiber_photometry_table_region, vec![0, 1]);

        template["Ophys"]["FiberPhotometry"]["FiberPhotometryResponseSeries"][0]["sampling_frequency"] =
            Value::from(1000.0);
        let err = assemble_session(&config(), &config().profile(), &session, None, template, &[], None).unwrap_err();
        assert!(matches!(err, ConversionError::SamplingRateMismatch { expected, .. } if expected == 1000.0));
    }

    #[test]
    fn processed_series_follow_the_raw_segments() {
        let session = Concatenator::from_segments(vec![
            segment(at(0), 1000.0, 1.0, "250ms"),
            segment(at(1), 1000.0, 1.0, "1s"),
        ])
        .unwrap();
        let mut profile = config().profile();
        profile.raw_sampling_frequency = 1000.0;
        profile.gap_fill = GapFillPolicy::Disabled;
        profile.processed_channels = vec!["s250ms".to_string(), "s1s".to_string(), "s4s".to_string()];

        let mut table = ProcessedSeriesTable::new();
        for stream in PROCESSED_STREAMS {
            let n = if stream.contains("raw") { 1000 } else { 100 };
            table.insert(stream, "SN", "C4550", "s250ms", Array1::from_elem(n, 1.0));
            table.insert(stream, "SN", "C4550", "s1s", Array1::from_elem(n, 2.0));
        }

        let processed = load_processed(&table, &config(), &profile, &session, TimeWindow::full()).unwrap();
        assert_eq!(processed.offsets(), session.offsets());

        let template: Value = serde_yaml::from_str(TEMPLATE).unwrap();
        let container = assemble_session(&config(), &profile, &session, Some(&processed), template, &[], None).unwrap();
        assert_eq!(container.processed_series.len(), 5);

        let dff = container.series("dff_SN").unwrap();
        assert_eq!(dff.unit, "%");
        assert_eq!(dff.data[0], 1.0);
        assert_eq!(dff.timing.time_of(100), Some(60.0));
        assert_eq!(dff.data[100], 2.0);
        let demodulated = container.series("calcium_demodulated_SN").unwrap();
        assert_eq!(demodulated.data.len(), 2000);
    }

    #[test]
    fn extra_templates_are_merged_under_derived_values() {
        let dir = tempfile::tempdir().unwrap();
        let protocol_dir = dir.path().join("protocol");
        let folder = protocol_dir.join("C4550-240118-100000");
        std::fs::create_dir_all(&folder).unwrap();
        write_segment_file(folder.join("segment.fps"), &segment(at(0), 1000.0, 1.0, "only")).unwrap();

        std::fs::write(dir.path().join("metadata.yaml"), TEMPLATE).unwrap();
        std::fs::write(
            dir.path().join("stimulus.yaml"),
            "NWBFile:\n  session_id: from_template\n  keywords: [optogenetics]\nStimulus:\n  OptogeneticStimulusInterval:\n    name: opto\n",
        )
        .unwrap();

        let mut config = config();
        config.protocol_type = "Varying durations".parse().unwrap();
        config.recording_type = "Cell_type recordings_Vgat".parse().unwrap();
        let mut request = SessionRequest {
            config,
            protocol_dir,
            metadata_path: dir.path().join("metadata.yaml"),
            extra_metadata_paths: vec![dir.path().join("stimulus.yaml")],
            video_dir: None,
            output_dir: dir.path().join("out"),
            stub_test: false,
            window: TimeWindow::full(),
            include_processed: false,
        };

        let path = convert_session(&request, &JsonContainerWriter::default()).unwrap();
        let container = read_container(&path).unwrap();
        let metadata = &container.metadata;
        assert_eq!(metadata["Stimulus"]["OptogeneticStimulusInterval"]["name"].as_str(), Some("opto"));
        assert_eq!(metadata["NWBFile"]["keywords"][0].as_str(), Some("optogenetics"));
        assert_eq!(metadata["NWBFile"]["session_id"].as_str(), Some("varying_durations"));
        assert_eq!(metadata["Subject"]["subject_id"].as_str(), Some("C4550"));
        assert_eq!(
            metadata["NWBFile"]["session_start_time"].as_str(),
            Some("2024-01-18 10:00:00")
        );

        // a processed file is required once asked for
        request.include_processed = true;
        let err = convert_session(&request, &JsonContainerWriter::default()).unwrap_err();
        assert!(matches!(err, ConversionError::Discovery { found: 0, .. }));
    }
}
