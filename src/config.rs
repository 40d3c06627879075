//! Session configuration and the recording profile derived from it.
//!
//! Experiment variants differ only in a handful of acquisition settings.
//! [`SessionConfig`] names the variant; [`SessionConfig::profile`] turns it
//! into the concrete [`RecordingProfile`] the pipeline runs with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::concat::GapFillPolicy;
use crate::demodulate::{DriverFrequencies, DEFAULT_CUTOFF_FREQUENCY};
use crate::types::ConversionError;

/// Raw photometry stream recorded by the acquisition system.
pub const RAW_STREAM_NAME: &str = "Fi1r";

/// Acquisition rate of the standard rig (Hz).
pub const STANDARD_SAMPLING_FREQUENCY: f64 = 6103.5156;

/// Acquisition rate of the multi-row rig (Hz).
pub const HIGH_RATE_SAMPLING_FREQUENCY: f64 = 24414.0625;

/// Row of the multi-row rig's raw stream that carries the photometry signal.
pub const HIGH_RATE_SIGNAL_ROW: usize = 2;

/// Folder, below recording type and stimulus location, that holds the raw
/// acquisition data.
pub const RAW_DATA_FOLDER: &str = "Fiber photometry_TDT";

macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => [$label:literal $(, $alias:literal)*]),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Label used in folder names and metadata sheets.
            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConversionError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                $(
                    if trimmed.eq_ignore_ascii_case($label) $(|| trimmed.eq_ignore_ascii_case($alias))* {
                        return Ok($name::$variant);
                    }
                )+
                Err(ConversionError::UnknownLabel {
                    kind: $kind,
                    label: s.to_string(),
                })
            }
        }

        impl TryFrom<String> for $name {
            type Error = ConversionError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.label().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

labelled_enum!(
    /// Stimulation protocol run during the session.
    ProtocolType, "protocol" {
        VaryingFrequencies => ["Varying frequencies", "varying_frequencies"],
        VaryingDurations => ["Varying durations", "varying_durations"],
        Shocks => ["Shocks", "shock"],
    }
);

labelled_enum!(
    /// Anatomical site that received optogenetic stimulation.
    StimulusLocation, "stimulus location" {
        Ppn => ["PPN"],
        Stn => ["STN"],
    }
);

labelled_enum!(
    /// Hemisphere of the implant.
    Hemisphere, "hemisphere" {
        Left => ["Left", "L"],
        Right => ["Right", "R"],
    }
);

labelled_enum!(
    /// Cohort the subject belongs to.
    RecordingType, "recording type" {
        SnPanGaba => ["SN pan GABA recordings", "SN_pan_GABA_recordings"],
        StrDaTerminal => ["Str_DA_terminal recordings", "Str_DA_terminal_recordings"],
        CellTypeVglut2 => ["Cell_type recordings_Vglut2", "Cell_type_recordings_Vglut2"],
        CellTypeVgat => ["Cell_type recordings_Vgat", "Cell_type_recordings_Vgat"],
    }
);

impl ProtocolType {
    /// Session identifier used in output file names.
    pub fn session_id(&self) -> &'static str {
        match self {
            ProtocolType::VaryingFrequencies => "varying_frequencies",
            ProtocolType::VaryingDurations => "varying_durations",
            ProtocolType::Shocks => "shocks",
        }
    }
}

impl RecordingType {
    /// File name of the metadata template for this cohort.
    pub fn metadata_file_name(&self) -> String {
        format!("{}_metadata.yaml", self.label().replace(' ', "_"))
    }
}

/// How the raw folders of one session are laid out under the protocol folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderLayout {
    /// Exactly one `{subject}-{yymmdd}-{HHMMSS}` folder
    Single,
    /// Several such folders side by side
    Flat,
    /// One folder inside each `varFreq_<tag>` group folder
    Grouped,
}

/// Subject-level facts taken from the lab's subject sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectInfo {
    pub subject_id: String,
    pub sex: String,
    pub hemisphere: Hemisphere,
    /// Recording target used to select response-series metadata
    pub target_area: String,
    /// Appended to the session id when a subject was recorded at several sites
    #[serde(default)]
    pub recording_site: Option<String>,
    /// Subject id as spelled in raw folder and video names, when it differs
    #[serde(default)]
    pub folder_id: Option<String>,
    /// Recorded on the multi-row high-rate rig
    #[serde(default)]
    pub high_rate_rig: bool,
}

impl SubjectInfo {
    /// Id used to find this subject's raw folders and videos.
    pub fn folder_id(&self) -> &str {
        self.folder_id.as_deref().unwrap_or(&self.subject_id)
    }
}

/// Everything that distinguishes one experiment variant from another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub protocol_type: ProtocolType,
    pub recording_type: RecordingType,
    pub stimulus_location: StimulusLocation,
    /// Extra accepted names per canonical stimulus channel
    #[serde(default)]
    pub channel_name_overrides: BTreeMap<String, Vec<String>>,
    pub subject: SubjectInfo,
}

impl SessionConfig {
    /// Session id, e.g. `varying_frequencies` or `varying_frequencies_STN`.
    pub fn session_id(&self) -> String {
        match &self.subject.recording_site {
            Some(site) => format!("{}_{}", self.protocol_type.session_id(), site),
            None => self.protocol_type.session_id().to_string(),
        }
    }

    /// Protocol folder under the lab's data root.
    pub fn protocol_dir(&self, data_root: &Path) -> PathBuf {
        data_root
            .join(self.recording_type.label())
            .join(self.stimulus_location.label())
            .join(RAW_DATA_FOLDER)
            .join(self.protocol_type.label())
    }

    fn on_high_rate_rig(&self) -> bool {
        match (self.recording_type, self.stimulus_location) {
            (RecordingType::SnPanGaba, StimulusLocation::Stn) => true,
            (RecordingType::StrDaTerminal, _) => true,
            (RecordingType::CellTypeVglut2, _) => self.subject.high_rate_rig,
            _ => false,
        }
    }

    /// Acquisition and processing settings for this variant.
    pub fn profile(&self) -> RecordingProfile {
        let mut profile = RecordingProfile {
            raw_stream: RAW_STREAM_NAME.to_string(),
            raw_sampling_frequency: STANDARD_SAMPLING_FREQUENCY,
            stream_indices: None,
            gap_fill: GapFillPolicy::Disabled,
            folder_layout: FolderLayout::Single,
            stimulus_channels: BTreeMap::new(),
            expected_videos: 0,
            processed_channels: Vec::new(),
            drivers: DriverFrequencies::default(),
            cutoff_frequency: DEFAULT_CUTOFF_FREQUENCY,
            session_description: String::new(),
        };
        let ppn_gaba = self.recording_type == RecordingType::SnPanGaba
            && self.stimulus_location == StimulusLocation::Ppn;

        match self.protocol_type {
            ProtocolType::VaryingFrequencies => {
                profile.session_description = "The subject is placed in a plastic tub and undergoes 3 recording \
                    sessions corresponding to a fixed duration of stimulation (250ms, 1s and 4s), each lasting \
                    8 minutes. The subject receives optogenetic stimulation at varying frequencies (5 Hz, 10 Hz, \
                    20 Hz and 40 Hz) 5 times for each duration with an ISI of 10s."
                    .to_string();
                profile.stimulus_channels = channel_map(&[("H10_", 10.0), ("H20_", 20.0), ("H40_", 40.0), ("H05_", 5.0)]);
                profile.gap_fill = GapFillPolicy::AcrossSegments;
                profile.folder_layout = FolderLayout::Grouped;
                profile.processed_channels = names(&["s250ms", "s1s", "s4s"]);
                if ppn_gaba {
                    profile.folder_layout = FolderLayout::Flat;
                    profile.expected_videos = 3;
                    profile.processed_channels = names(&["AllDurs"]);
                } else if self.on_high_rate_rig() {
                    if self.recording_type == RecordingType::SnPanGaba {
                        profile.processed_channels = names(&["s250ms5mW", "s1s10mW"]);
                    }
                    profile.use_high_rate_rig();
                    profile.gap_fill = GapFillPolicy::Disabled;
                }
            }
            ProtocolType::VaryingDurations => {
                profile.session_description = "The subject is placed in a plastic tub and receives optogenetic \
                    stimulation at 40 Hz with varying pulse train durations (250ms, 1s and 4s) 5 times each \
                    with an ISI of 10s."
                    .to_string();
                profile.stimulus_channels = channel_map(&[("sms_", 40.0), ("s1s_", 40.0), ("s4s_", 40.0)]);
                profile.processed_channels = names(&["LP5mW"]);
                if ppn_gaba {
                    profile.expected_videos = 1;
                } else if self.recording_type != RecordingType::CellTypeVglut2 && self.on_high_rate_rig() {
                    profile.stimulus_channels =
                        channel_map(&[("S1s_", 40.0), ("S4s_", 40.0), ("S6s_", 40.0), ("Sms_", 40.0)]);
                    profile.use_high_rate_rig();
                }
            }
            ProtocolType::Shocks => {
                profile.session_description = "The subject receives foot shocks of varying amplitude, some \
                    paired with an auditory cue."
                    .to_string();
            }
        }
        profile
    }
}

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn channel_map(channels: &[(&str, f64)]) -> BTreeMap<String, f64> {
    channels.iter().map(|&(name, f)| (name.to_string(), f)).collect()
}

/// Concrete settings one session is converted with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingProfile {
    /// Name of the frequency-multiplexed raw stream
    pub raw_stream: String,
    /// Nominal acquisition rate (Hz); the rate declared in each segment wins
    pub raw_sampling_frequency: f64,
    /// Rows of the raw stream that carry the photometry signal
    pub stream_indices: Option<Vec<usize>>,
    pub gap_fill: GapFillPolicy,
    pub folder_layout: FolderLayout,
    /// Optogenetic stimulus channel name to stimulation frequency (Hz)
    pub stimulus_channels: BTreeMap<String, f64>,
    /// Number of behavioral videos to align, zero for none
    pub expected_videos: usize,
    /// Stimulus channels of the processed file, one per sub-session tag or
    /// a single one for the whole session; empty when none is exported
    pub processed_channels: Vec<String>,
    pub drivers: DriverFrequencies,
    pub cutoff_frequency: f64,
    pub session_description: String,
}

impl RecordingProfile {
    fn use_high_rate_rig(&mut self) {
        self.stream_indices = Some(vec![HIGH_RATE_SIGNAL_ROW]);
        self.raw_sampling_frequency = HIGH_RATE_SAMPLING_FREQUENCY;
    }
}
