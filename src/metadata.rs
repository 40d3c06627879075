//! Metadata templates: loading, merging and cohort-specific filtering.
//!
//! Templates are nested YAML mappings. Values the pipeline depends on are
//! read through [`require`] so a missing key names its full dotted path.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;

use crate::config::Hemisphere;
use crate::stimulus::{OptogeneticSettings, ShockProtocol};
use crate::types::ConversionError;

/// Path of the response-series list in a template.
pub const RESPONSE_SERIES_PATH: &str = "Ophys.FiberPhotometry.FiberPhotometryResponseSeries";

/// Path of the processed-series list in a template.
pub const PROCESSED_SERIES_PATH: &str = "Ophys.FiberPhotometry.ProcessedFiberPhotometryResponseSeries";

const INDICATOR_PATHS: [&str; 2] = [
    "Ophys.FiberPhotometry.Indicators",
    "Ophys.FiberPhotometry.FiberPhotometryIndicators",
];

const ML_COORDINATE_KEYS: [&str; 2] = ["ml_in_mm", "insertion_position_ml_in_mm"];

/// Reads a YAML template.
pub fn load_template<P: AsRef<Path>>(path: P) -> Result<Value, ConversionError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let value: Value = serde_yaml::from_str(&text)?;
    debug!("Loaded metadata template {}", path.as_ref().display());
    Ok(value)
}

/// Recursively merges `update` into `base`.
///
/// Mappings are merged key by key; any other value in `update` replaces
/// the one in `base`.
pub fn deep_update(base: &mut Value, update: &Value) {
    match (base, update) {
        (Value::Mapping(base_map), Value::Mapping(update_map)) => {
            for (key, value) in update_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_update(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, update) => *base = update.clone(),
    }
}

/// Looks up a dotted path such as `Optogenetics.power_in_mW`.
pub fn lookup<'a>(metadata: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(metadata, |value, key| value.get(key))
}

fn lookup_mut<'a>(metadata: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(metadata, |value, key| value.get_mut(key))
}

/// Like [`lookup`], but a missing key is a [`ConversionError::MissingMetadataKey`].
pub fn require<'a>(metadata: &'a Value, path: &str) -> Result<&'a Value, ConversionError> {
    lookup(metadata, path).ok_or_else(|| ConversionError::MissingMetadataKey(path.to_string()))
}

pub fn require_str<'a>(metadata: &'a Value, path: &str) -> Result<&'a str, ConversionError> {
    require(metadata, path)?
        .as_str()
        .ok_or_else(|| ConversionError::MissingMetadataKey(format!("{path} (as text)")))
}

pub fn require_f64(metadata: &Value, path: &str) -> Result<f64, ConversionError> {
    require(metadata, path)?
        .as_f64()
        .ok_or_else(|| ConversionError::MissingMetadataKey(format!("{path} (as number)")))
}

/// Description of one photometry series, as listed in a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSeriesMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Raw stream the series is derived from
    pub stream_name: String,
    #[serde(default)]
    pub target_area: Option<String>,
    /// Carrier to demodulate at; absent for the raw series itself
    #[serde(default)]
    pub driver_freq: Option<f64>,
    #[serde(default)]
    pub sampling_frequency: Option<f64>,
    #[serde(default)]
    pub fiber_photometry_table_region: Vec<usize>,
}

fn default_unit() -> String {
    "a.u.".to_string()
}

/// All response-series entries of a template.
pub fn response_series(metadata: &Value) -> Result<Vec<ResponseSeriesMetadata>, ConversionError> {
    let entries = require(metadata, RESPONSE_SERIES_PATH)?;
    Ok(serde_yaml::from_value(entries.clone())?)
}

/// Response-series entries derived from `stream_name`.
pub fn series_for_stream(
    metadata: &Value,
    stream_name: &str,
) -> Result<Vec<ResponseSeriesMetadata>, ConversionError> {
    let series: Vec<ResponseSeriesMetadata> = response_series(metadata)?
        .into_iter()
        .filter(|s| s.stream_name == stream_name)
        .collect();
    if series.is_empty() {
        return Err(ConversionError::MissingMetadataKey(format!(
            "{RESPONSE_SERIES_PATH}[stream_name = {stream_name}]"
        )));
    }
    Ok(series)
}

/// The processed-series entry describing `stream_name`.
pub fn processed_series_for_stream(
    metadata: &Value,
    stream_name: &str,
) -> Result<ResponseSeriesMetadata, ConversionError> {
    let entries: Vec<ResponseSeriesMetadata> = serde_yaml::from_value(require(metadata, PROCESSED_SERIES_PATH)?.clone())?;
    entries
        .into_iter()
        .find(|s| s.stream_name == stream_name)
        .ok_or_else(|| ConversionError::MissingMetadataKey(format!("{PROCESSED_SERIES_PATH}[stream_name = {stream_name}]")))
}

fn retain_items<F>(metadata: &mut Value, path: &str, mut keep: F)
where
    F: FnMut(&Value) -> bool,
{
    if let Some(Value::Sequence(items)) = lookup_mut(metadata, path) {
        items.retain(|item| keep(item));
    }
}

fn field_contains(item: &Value, field: &str, needle: &str) -> bool {
    item.get(field)
        .and_then(Value::as_str)
        .is_some_and(|value| value.contains(needle))
}

/// Keeps only response-series entries recorded from `target_area`.
///
/// Applies to every list under `Ophys.FiberPhotometry` whose key mentions
/// response series.
pub fn filter_by_target_area(metadata: &mut Value, target_area: &str) {
    let Some(Value::Mapping(photometry)) = lookup_mut(metadata, "Ophys.FiberPhotometry") else {
        return;
    };
    for (key, value) in photometry.iter_mut() {
        let is_series_list = key.as_str().is_some_and(|k| k.contains("FiberPhotometryResponseSeries"));
        if let (true, Value::Sequence(items)) = (is_series_list, value) {
            items.retain(|item| item.get("target_area").and_then(Value::as_str) == Some(target_area));
        }
    }
}

/// Keeps only the optogenetic effectors, injections and sites of `location`.
///
/// Fiber photometry indicators injected elsewhere are dropped as well;
/// indicators without an `injection_location` are kept.
pub fn filter_by_stimulus_location(metadata: &mut Value, location: &str) {
    for path in INDICATOR_PATHS {
        retain_items(metadata, path, |item| {
            item.get("injection_location").is_none() || field_contains(item, "injection_location", location)
        });
    }
    retain_items(metadata, "Optogenetics.OptogeneticEffectors", |item| {
        field_contains(item, "name", location)
    });
    retain_items(metadata, "Optogenetics.OptogeneticVirusInjections", |item| {
        field_contains(item, "name", location)
    });
    retain_items(metadata, "Optogenetics.OptogeneticSitesTable.rows", |row| {
        field_contains(row, "effector", location)
    });
}

/// Mirrors right-hemisphere coordinates for a left-hemisphere implant.
///
/// Every `hemisphere: right` becomes `left` and every positive
/// medio-lateral coordinate is negated, at any depth.
pub fn mirror_to_left_hemisphere(metadata: &mut Value) {
    match metadata {
        Value::Mapping(map) => {
            if let Some(hemisphere) = map.get_mut("hemisphere") {
                if hemisphere.as_str().is_some_and(|h| h.eq_ignore_ascii_case("right")) {
                    *hemisphere = Value::String("left".to_string());
                }
            }
            for key in ML_COORDINATE_KEYS {
                if let Some(coordinate) = map.get_mut(key) {
                    if let Some(ml) = coordinate.as_f64().filter(|ml| *ml > 0.0) {
                        *coordinate = Value::from(-ml);
                    }
                }
            }
            for (_, value) in map.iter_mut() {
                mirror_to_left_hemisphere(value);
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(mirror_to_left_hemisphere),
        _ => {}
    }
}

/// Applies the subject's hemisphere to a right-hemisphere template.
pub fn apply_hemisphere(metadata: &mut Value, hemisphere: Hemisphere) {
    if hemisphere == Hemisphere::Left {
        mirror_to_left_hemisphere(metadata);
    }
}

/// Light source settings under `Optogenetics`.
pub fn optogenetic_settings(metadata: &Value) -> Result<OptogeneticSettings, ConversionError> {
    Ok(OptogeneticSettings {
        power_in_mw: require_f64(metadata, "Optogenetics.power_in_mW")?,
        wavelength_in_nm: require_f64(metadata, "Optogenetics.excitation_wavelength_in_nm")?,
    })
}

/// Shock channel table, if the template describes shock stimuli.
pub fn shock_protocol(metadata: &Value) -> Result<Option<ShockProtocol>, ConversionError> {
    if lookup(metadata, "Stimulus.ShockStimulusInterval").is_none() {
        return Ok(None);
    }
    let table = require(metadata, "TDTEvents")?;
    Ok(Some(serde_yaml::from_value(table.clone())?))
}
