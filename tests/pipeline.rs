use chrono::{NaiveDate, NaiveDateTime};
use fiber_photometry_importer::batch::convert_batch;
use fiber_photometry_importer::config::{Hemisphere, SessionConfig, SubjectInfo};
use fiber_photometry_importer::container::{read_container, Timing};
use fiber_photometry_importer::reader::write_segment_file;
use fiber_photometry_importer::*;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

// binary-exact sample spacing keeps gap counts free of rounding
const FS: f64 = 1024.0;

const TEMPLATE: &str = r#"
NWBFile:
  session_description: placeholder
Subject:
  species: Mus musculus
Ophys:
  FiberPhotometry:
    FiberPhotometryResponseSeries:
      - name: raw_SN
        description: Raw modulated signal
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
Optogenetics:
  power_in_mW: 5.0
  excitation_wavelength_in_nm: 473
  OptogeneticEffectors:
    - name: ChR2_PPN
    - name: ChR2_STN
"#;

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 18)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn folder_name(subject: &str, start: NaiveDateTime) -> String {
    format!("{subject}-{}", start.format("%y%m%d-%H%M%S"))
}

/// Three seconds of a calcium carrier of amplitude 2 plus an isosbestic
/// carrier of amplitude 1.
fn write_segment(folder: &Path, start: NaiveDateTime, events: &[(&str, f64, f64)]) {
    let n = (3.0 * FS) as usize;
    let data = Array2::from_shape_fn((1, n), |(_, i)| {
        let t = i as f64 / FS;
        2.0 * (2.0 * PI * 330.0 * t).cos() + (2.0 * PI * 210.0 * t).cos()
    });
    let mut streams = BTreeMap::new();
    streams.insert("Fi1r".to_string(), RawStream::regular("Fi1r", FS, data));
    let events = events
        .iter()
        .map(|&(name, onset, offset)| {
            (
                name.to_string(),
                EventIntervals {
                    onset: vec![onset],
                    offset: vec![offset],
                },
            )
        })
        .collect();

    fs::create_dir_all(folder).unwrap();
    let segment = RawSegment {
        start_time: start,
        tag: None,
        streams,
        events,
    };
    write_segment_file(folder.join("segment.fps"), &segment).unwrap();
}

fn config(protocol: &str, recording: &str, location: &str, subject_id: &str) -> SessionConfig {
    SessionConfig {
        protocol_type: protocol.parse().unwrap(),
        recording_type: recording.parse().unwrap(),
        stimulus_location: location.parse().unwrap(),
        channel_name_overrides: BTreeMap::new(),
        subject: SubjectInfo {
            subject_id: subject_id.to_string(),
            sex: "M".to_string(),
            hemisphere: Hemisphere::Right,
            target_area: "SN".to_string(),
            recording_site: None,
            folder_id: None,
            high_rate_rig: false,
        },
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("metadata.yaml"), TEMPLATE).unwrap();
        Fixture { _dir: dir, root }
    }

    /// Grouped frequency session: segments 5 s apart, 3 s long each.
    fn frequency_request(&self, subject_id: &str) -> SessionRequest {
        let protocol_dir = self.root.join("frequencies");
        let starts = [(at(10, 0, 0), "250ms"), (at(10, 0, 5), "1s"), (at(10, 0, 10), "4s")];
        for (index, (start, tag)) in starts.into_iter().enumerate() {
            let folder = protocol_dir
                .join(format!("varFreq_{tag}"))
                .join(folder_name(subject_id, start));
            let events: &[(&str, f64, f64)] = match index {
                0 => &[("H10_", 1.0, 1.5)],
                1 => &[("H20_", 0.5, 1.0)],
                _ => &[],
            };
            write_segment(&folder, start, events);
        }

        SessionRequest {
            config: config("Varying frequencies", "Cell_type recordings_Vgat", "PPN", subject_id),
            protocol_dir,
            metadata_path: self.root.join("metadata.yaml"),
            extra_metadata_paths: Vec::new(),
            video_dir: None,
            output_dir: self.root.join("out"),
            stub_test: false,
            window: TimeWindow::full(),
            include_processed: false,
        }
    }

    /// Single-folder duration session with one video.
    fn duration_request(&self, video_start: &str) -> SessionRequest {
        let protocol_dir = self.root.join("durations");
        let start = at(11, 0, 0);
        write_segment(
            &protocol_dir.join(folder_name("C4551", start)),
            start,
            &[("ssm_", 1.0, 1.25)],
        );

        let video_dir = self.root.join("videos");
        fs::create_dir_all(&video_dir).unwrap();
        fs::write(video_dir.join("C4551_session.mp4"), b"").unwrap();
        fs::write(
            video_dir.join("video_metadata.csv"),
            format!("file_name,start_time\nC4551_session.mp4,{video_start}\n"),
        )
        .unwrap();

        SessionRequest {
            config: config("Varying durations", "SN pan GABA recordings", "PPN", "C4551"),
            protocol_dir,
            metadata_path: self.root.join("metadata.yaml"),
            extra_metadata_paths: Vec::new(),
            video_dir: Some(video_dir),
            output_dir: self.root.join("out"),
            stub_test: false,
            window: TimeWindow::full(),
            include_processed: false,
        }
    }
}

#[test]
fn grouped_session_is_concatenated_and_gap_filled() {
    let fixture = Fixture::new();
    let request = fixture.frequency_request("C4550");
    let path = convert_session(&request, &JsonContainerWriter::default()).unwrap();
    assert_eq!(path, fixture.root.join("out").join("sub-C4550_ses-varying_frequencies.json"));

    let container = read_container(&path).unwrap();
    assert_eq!(container.session_start_time, at(10, 0, 0));
    assert_eq!(container.response_series.len(), 3);
    assert!(container.series("calcium_STR").is_none());

    // 3 x 3072 recorded samples, 2 x 2048 sentinels in the pauses
    let calcium = container.series("calcium_SN").unwrap();
    assert_eq!(calcium.data.len(), 13312);
    assert_eq!(calcium.num_missing_samples, 4096);
    assert_eq!(calcium.data.iter().filter(|v| v.is_nan()).count(), 4096);
    match &calcium.timing {
        Timing::StartingTimeAndRate { starting_time, rate } => {
            assert_eq!(*starting_time, 0.0);
            assert!((rate - FS).abs() < 1e-6);
        }
        other => panic!("expected a regular series, got {other:?}"),
    }

    // settled envelope is half the carrier amplitude
    assert!((calcium.data[1536] - 1.0).abs() < 0.05);
    let isosbestic = container.series("isosbestic_SN").unwrap();
    assert!((isosbestic.data[1536] - 0.5).abs() < 0.05);

    let tags: Vec<&str> = container.trials.iter().map(|t| t.tags[0].as_str()).collect();
    assert_eq!(tags, vec!["250ms", "1s", "4s"]);
    assert_eq!(container.trials[1].start_time, 5.0);

    assert_eq!(container.optogenetic_epochs.len(), 2);
    assert_eq!(container.optogenetic_epochs[0].stream_name, "H10_");
    assert_eq!(container.optogenetic_epochs[0].number_pulses_per_pulse_train, 5);
    assert_eq!(container.optogenetic_epochs[1].start_time, 5.5);
    assert_eq!(container.optogenetic_epochs[1].stimulus_frequency, 20.0);

    assert_eq!(container.metadata["Subject"]["subject_id"].as_str(), Some("C4550"));
    assert_eq!(container.metadata["Subject"]["species"].as_str(), Some("Mus musculus"));
    let effectors = container.metadata["Optogenetics"]["OptogeneticEffectors"]
        .as_sequence()
        .unwrap();
    assert_eq!(effectors.len(), 1);
}

#[test]
fn stub_conversion_reads_one_second_per_segment() {
    let fixture = Fixture::new();
    let mut request = fixture.frequency_request("C4550");
    request.stub_test = true;
    let path = convert_session(&request, &JsonContainerWriter::default()).unwrap();
    assert!(path.starts_with(fixture.root.join("out").join("stub")));

    // 3 x 1024 samples, 2 x 4096 sentinels
    let container = read_container(&path).unwrap();
    assert_eq!(container.series("raw_SN").unwrap().data.len(), 11264);
}

#[test]
fn segments_out_of_order_are_rejected() {
    let fixture = Fixture::new();
    let request = fixture.frequency_request("C4550");
    // folder names sort this segment last, its recorded clock says first
    let late_folder = request
        .protocol_dir
        .join("varFreq_4s")
        .join(folder_name("C4550", at(10, 0, 10)));
    write_segment(&late_folder, at(9, 0, 0), &[]);

    let err = convert_session(&request, &JsonContainerWriter::default()).unwrap_err();
    assert!(matches!(err, ConversionError::OutOfOrderSegments { index: 2, .. }));
}

#[test]
fn single_session_video_is_aligned() {
    let fixture = Fixture::new();
    let request = fixture.duration_request("2024-01-18 11:00:02.5");
    let path = convert_session(&request, &JsonContainerWriter::default()).unwrap();
    let container = read_container(&path).unwrap();

    assert_eq!(container.videos.len(), 1);
    assert_eq!(container.videos[0].name, "BehavioralVideo");
    assert_eq!(container.videos[0].starting_time, 2.5);

    // one segment: recorded timestamps, no boundary annotation
    assert!(container.trials.is_empty());
    let raw = container.series("raw_SN").unwrap();
    assert_eq!(raw.data.len(), 3072);
    assert!(matches!(raw.timing, Timing::Timestamps { .. }));

    assert_eq!(container.optogenetic_epochs.len(), 1);
    assert_eq!(container.optogenetic_epochs[0].stream_name, "ssm_");
    assert_eq!(container.optogenetic_epochs[0].number_pulses_per_pulse_train, 10);
}

#[test]
fn video_offset_follows_the_recorded_start() {
    let fixture = Fixture::new();
    let mut request = fixture.duration_request("2024-01-18 11:00:02.5");
    // folder name says 11:00:00, the segment itself was recorded from 11:00:01
    let protocol_dir = fixture.root.join("durations_late");
    write_segment(
        &protocol_dir.join(folder_name("C4551", at(11, 0, 0))),
        at(11, 0, 1),
        &[("ssm_", 1.0, 1.25)],
    );
    request.protocol_dir = protocol_dir;

    let path = convert_session(&request, &JsonContainerWriter::default()).unwrap();
    let container = read_container(&path).unwrap();
    assert_eq!(container.session_start_time, at(11, 0, 1));
    assert_eq!(container.videos[0].starting_time, 1.5);
}

#[test]
fn video_before_session_start_is_an_error() {
    let fixture = Fixture::new();
    let request = fixture.duration_request("2024-01-18T10:59:59");
    let err = convert_session(&request, &JsonContainerWriter::default()).unwrap_err();
    assert!(matches!(err, ConversionError::NegativeOffset { .. }));
}

#[test]
fn batch_continues_past_a_failed_session() {
    let fixture = Fixture::new();
    let good = fixture.frequency_request("C4550");
    let mut bad = good.clone();
    bad.config.subject.subject_id = "C9999".to_string();

    let report = convert_batch(&[bad, good], &JsonContainerWriter::default()).unwrap();
    assert_eq!(report.converted.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(
        report.failed[0],
        fixture.root.join("out").join("ERROR_sub-C9999_ses-varying_frequencies.txt")
    );
    assert!(report.converted[0].exists());
}

#[test]
fn processed_file_must_be_unique_when_requested() {
    let fixture = Fixture::new();
    let mut request = fixture.frequency_request("C4550");
    request.include_processed = true;

    fs::write(request.protocol_dir.join("C4550_processed.mat"), b"").unwrap();
    fs::write(request.protocol_dir.join("C4550_processed_v2.mat"), b"").unwrap();
    let err = convert_session(&request, &JsonContainerWriter::default()).unwrap_err();
    assert!(matches!(err, ConversionError::Discovery { found: 2, .. }));
}

#[cfg(not(feature = "hdf5"))]
#[test]
fn processed_file_needs_hdf5_support() {
    let fixture = Fixture::new();
    let mut request = fixture.frequency_request("C4550");
    request.include_processed = true;

    fs::write(request.protocol_dir.join("C4550_processed.mat"), b"").unwrap();
    let err = convert_session(&request, &JsonContainerWriter::default()).unwrap_err();
    assert!(matches!(err, ConversionError::ProcessedFile(_)));
}
