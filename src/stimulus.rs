//! Stimulus intervals built from the acquisition system's event channels.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ConversionError, EventIntervals, EventMap};

/// Length of a single light pulse; not recorded by the rig (ms).
pub const PULSE_LENGTH_MS: f64 = 1.0;

/// Names under which older sessions stored the same event channel.
const LEGACY_ALIASES: [(&str, &str); 3] = [("sms_", "ssm_"), ("s1s_", "ss1_"), ("s4s_", "ss4_")];

/// Canonical event channel name to the other names it may be stored under.
///
/// Consulted once per lookup: the canonical name wins, then aliases in order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelAliases {
    aliases: BTreeMap<String, Vec<String>>,
}

impl Default for ChannelAliases {
    fn default() -> Self {
        let mut aliases: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (canonical, alias) in LEGACY_ALIASES {
            aliases.entry(canonical.to_string()).or_default().push(alias.to_string());
        }
        ChannelAliases { aliases }
    }
}

impl ChannelAliases {
    /// An alias table with no entries.
    pub fn none() -> Self {
        ChannelAliases {
            aliases: BTreeMap::new(),
        }
    }

    /// Adds per-session aliases after the built-in ones.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, Vec<String>>) -> Self {
        for (canonical, names) in overrides {
            let entry = self.aliases.entry(canonical.clone()).or_default();
            for name in names {
                if !entry.contains(name) {
                    entry.push(name.clone());
                }
            }
        }
        self
    }

    pub fn aliases_of(&self, canonical: &str) -> &[String] {
        self.aliases.get(canonical).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Finds the event channel stored for `canonical`.
    pub fn resolve<'a>(&self, canonical: &str, events: &'a EventMap) -> Option<(&'a str, &'a EventIntervals)> {
        std::iter::once(canonical)
            .chain(self.aliases_of(canonical).iter().map(String::as_str))
            .find_map(|name| events.get_key_value(name))
            .map(|(name, intervals)| (name.as_str(), intervals))
    }

    /// Like [`resolve`](Self::resolve), but a missing channel is an error.
    pub fn require<'a>(
        &self,
        canonical: &str,
        events: &'a EventMap,
    ) -> Result<(&'a str, &'a EventIntervals), ConversionError> {
        self.resolve(canonical, events)
            .ok_or_else(|| ConversionError::MissingStream {
                name: canonical.to_string(),
                available: events.keys().cloned().collect(),
            })
    }
}

/// Light source settings shared by every epoch of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptogeneticSettings {
    pub power_in_mw: f64,
    pub wavelength_in_nm: f64,
}

/// One optogenetic pulse train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptogeneticEpoch {
    pub start_time: f64,
    pub stop_time: f64,
    /// Event channel the train was recorded on
    pub stream_name: String,
    pub stimulus_frequency: f64,
    pub stimulation_on: bool,
    pub pulse_length_in_ms: f64,
    pub period_in_ms: f64,
    pub number_pulses_per_pulse_train: u32,
    pub number_trains: u32,
    pub intertrain_interval_in_ms: f64,
    pub power_in_mw: f64,
    pub wavelength_in_nm: f64,
    /// Rows of the optogenetic sites table the train was delivered to
    pub optogenetic_sites: Vec<usize>,
}

/// Builds one epoch per recorded interval of each stimulus channel.
///
/// `channels` maps canonical channel names to stimulation frequency. A
/// channel absent from `events` is skipped with a warning; sessions of older
/// protocols legitimately lack some of them.
pub fn optogenetic_epochs(
    events: &EventMap,
    channels: &BTreeMap<String, f64>,
    aliases: &ChannelAliases,
    settings: OptogeneticSettings,
) -> Vec<OptogeneticEpoch> {
    let mut epochs = Vec::new();
    for (canonical, &frequency) in channels {
        let Some((stream_name, intervals)) = aliases.resolve(canonical, events) else {
            warn!("Stimulus channel `{}` not found in events. Skipping.", canonical);
            continue;
        };

        for (start_time, stop_time) in intervals.pairs() {
            epochs.push(OptogeneticEpoch {
                start_time,
                stop_time,
                stream_name: stream_name.to_string(),
                stimulus_frequency: frequency,
                stimulation_on: true,
                pulse_length_in_ms: PULSE_LENGTH_MS,
                period_in_ms: 1000.0 / frequency,
                number_pulses_per_pulse_train: ((stop_time - start_time) * frequency).floor() as u32,
                number_trains: 1,
                intertrain_interval_in_ms: 0.0,
                power_in_mw: settings.power_in_mw,
                wavelength_in_nm: settings.wavelength_in_nm,
                optogenetic_sites: vec![0],
            });
        }
    }
    epochs
}

/// Shock channels and what each of them delivered.
///
/// The three lists run in parallel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShockProtocol {
    pub stream_names: Vec<String>,
    /// Amplitude of each channel's shock (mA)
    pub stimulus_amplitude: Vec<f64>,
    pub paired_auditory_cue: Vec<bool>,
}

/// One delivered shock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShockStimulus {
    pub start_time: f64,
    pub stop_time: f64,
    pub stream_name: String,
    pub stimulus_amplitude: f64,
    pub paired_auditory_cue: bool,
}

/// Tabulates every shock interval of the channels listed in `protocol`.
///
/// Channels missing from `events` are skipped, as sessions recorded before
/// the paired-cue protocol lack them.
pub fn shock_stimuli(
    events: &EventMap,
    protocol: &ShockProtocol,
    aliases: &ChannelAliases,
) -> Result<Vec<ShockStimulus>, ConversionError> {
    let n = protocol.stream_names.len();
    for (what, len) in [
        ("stimulus_amplitude", protocol.stimulus_amplitude.len()),
        ("paired_auditory_cue", protocol.paired_auditory_cue.len()),
    ] {
        if len != n {
            return Err(ConversionError::LengthMismatch {
                what: what.to_string(),
                left: len,
                right: n,
            });
        }
    }

    let mut stimuli = Vec::new();
    for ((canonical, &amplitude), &cue) in protocol
        .stream_names
        .iter()
        .zip(&protocol.stimulus_amplitude)
        .zip(&protocol.paired_auditory_cue)
    {
        let Some((stream_name, intervals)) = aliases.resolve(canonical, events) else {
            warn!("Shock channel `{}` not found in events. Skipping.", canonical);
            continue;
        };
        stimuli.extend(intervals.pairs().map(|(start_time, stop_time)| ShockStimulus {
            start_time,
            stop_time,
            stream_name: stream_name.to_string(),
            stimulus_amplitude: amplitude,
            paired_auditory_cue: cue,
        }));
    }
    Ok(stimuli)
}
