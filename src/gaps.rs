//! Detection and sentinel-filling of dropped samples.
//!
//! A gap is never interpolated: missing samples are inserted as NaN so the
//! loss stays visible in the converted data.

use log::debug;
use ndarray::{s, Array1, ArrayView1};

use crate::demodulate::check_positive;
use crate::types::ConversionError;

/// Decimal places used when deciding whether a filled series is regular.
pub const RATE_TOLERANCE_DECIMALS: i32 = 2;

/// Number of sentinels needed to bridge a gap of `delta` seconds.
fn missing_samples(delta: f64, sampling_rate: f64) -> usize {
    ((delta * sampling_rate).floor() as i64 - 1).max(0) as usize
}

/// Indices `i` for which `timestamps[i + 1] - timestamps[i]` exceeds the
/// nominal interval.
pub fn find_gaps(timestamps: ArrayView1<f64>, sampling_rate: f64) -> Vec<usize> {
    let expected_interval = 1.0 / sampling_rate;
    timestamps
        .iter()
        .zip(timestamps.iter().skip(1))
        .enumerate()
        .filter(|(_, (a, b))| *b - *a > expected_interval)
        .map(|(i, _)| i)
        .collect()
}

/// Fills gaps in `data` with NaN so the series again implies `sampling_rate`.
///
/// For every consecutive pair of timestamps further apart than
/// `1 / sampling_rate`, `floor(delta * sampling_rate) - 1` NaN samples are
/// spliced in at `t_before + k / sampling_rate`. Runs between gaps are
/// copied through untouched; with no gaps the inputs are returned as copies.
///
/// # Errors
///
/// * [`ConversionError::LengthMismatch`] if `data` and `timestamps` differ in length
/// * [`ConversionError::InvalidParameter`] if `sampling_rate` is not positive
pub fn fill_gaps(
    data: ArrayView1<f64>,
    timestamps: ArrayView1<f64>,
    sampling_rate: f64,
) -> Result<(Array1<f64>, Array1<f64>), ConversionError> {
    if data.len() != timestamps.len() {
        return Err(ConversionError::LengthMismatch {
            what: "data".to_string(),
            left: data.len(),
            right: timestamps.len(),
        });
    }
    check_positive("sampling_rate", sampling_rate)?;

    let gap_indices = find_gaps(timestamps, sampling_rate);
    if gap_indices.is_empty() {
        return Ok((data.to_owned(), timestamps.to_owned()));
    }

    let expected_interval = 1.0 / sampling_rate;
    let num_inserted: usize = gap_indices
        .iter()
        .map(|&i| missing_samples(timestamps[i + 1] - timestamps[i], sampling_rate))
        .sum();

    debug!(
        "Filling {} gap{} with {} NaN sample{}",
        gap_indices.len(),
        if gap_indices.len() != 1 { "s" } else { "" },
        num_inserted,
        if num_inserted != 1 { "s" } else { "" },
    );

    let capacity = data.len() + num_inserted;
    let mut filled_data = Vec::with_capacity(capacity);
    let mut filled_timestamps = Vec::with_capacity(capacity);

    let mut run_start = 0;
    for &gap in &gap_indices {
        filled_data.extend(data.slice(s![run_start..=gap]).iter().copied());
        filled_timestamps.extend(timestamps.slice(s![run_start..=gap]).iter().copied());

        let before = timestamps[gap];
        let missing = missing_samples(timestamps[gap + 1] - before, sampling_rate);
        for k in 1..=missing {
            filled_data.push(f64::NAN);
            filled_timestamps.push(before + k as f64 * expected_interval);
        }

        run_start = gap + 1;
    }
    filled_data.extend(data.slice(s![run_start..]).iter().copied());
    filled_timestamps.extend(timestamps.slice(s![run_start..]).iter().copied());

    Ok((Array1::from_vec(filled_data), Array1::from_vec(filled_timestamps)))
}

/// Infers a single sampling rate for `timestamps`, if there is one.
///
/// The rate implied by every consecutive interval is rounded to
/// `tolerance_decimals` places; if all agree, the mean rate of the series is
/// returned. Series with fewer than two samples or non-increasing
/// timestamps have no regular rate.
pub fn regular_series_rate(timestamps: ArrayView1<f64>, tolerance_decimals: i32) -> Option<f64> {
    let n = timestamps.len();
    if n < 2 {
        return None;
    }

    let scale = 10f64.powi(tolerance_decimals);
    let mut rounded_rate = None;
    for (a, b) in timestamps.iter().zip(timestamps.iter().skip(1)) {
        let delta = b - a;
        if !(delta > 0.0) {
            return None;
        }
        let rate = (scale / delta).round();
        match rounded_rate {
            None => rounded_rate = Some(rate),
            Some(first) if first != rate => return None,
            Some(_) => {}
        }
    }

    Some((n - 1) as f64 / (timestamps[n - 1] - timestamps[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn regular_series_is_returned_unchanged() {
        let timestamps = Array1::from_iter((0..50).map(|i| i as f64 / 20.0));
        let data = Array1::from_iter((0..50).map(|i| i as f64 * 0.5));
        let (filled, filled_ts) = fill_gaps(data.view(), timestamps.view(), 20.0).unwrap();
        assert_eq!(filled, data);
        assert_eq!(filled_ts, timestamps);
    }

    #[test]
    fn one_second_gap_at_ten_hertz_gets_nine_sentinels() {
        let data = array![1.0, 2.0];
        let timestamps = array![0.0, 1.0];
        let (filled, filled_ts) = fill_gaps(data.view(), timestamps.view(), 10.0).unwrap();

        assert_eq!(filled.len(), 11);
        assert_eq!(filled[0], 1.0);
        assert_eq!(filled[10], 2.0);
        assert!(filled.slice(s![1..10]).iter().all(|v| v.is_nan()));
        for k in 1..10 {
            assert_relative_eq!(filled_ts[k], k as f64 * 0.1, epsilon = 1e-12);
        }
        assert_eq!(filled_ts[10], 1.0);
    }

    #[test]
    fn several_gaps_keep_real_samples_in_place() {
        // 4 Hz with a 0.75 s hole after 0.25 and a 0.5 s hole after 1.5
        let timestamps = array![0.0, 0.25, 1.0, 1.25, 1.5, 2.0];
        let data = array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let (filled, filled_ts) = fill_gaps(data.view(), timestamps.view(), 4.0).unwrap();

        assert_eq!(filled.len(), 6 + 2 + 1);
        let real: Vec<f64> = filled.iter().copied().filter(|v| !v.is_nan()).collect();
        assert_eq!(real, data.to_vec());
        assert_eq!(find_gaps(filled_ts.view(), 4.0), Vec::<usize>::new());
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = fill_gaps(array![1.0, 2.0].view(), array![0.0].view(), 10.0).unwrap_err();
        assert!(matches!(err, ConversionError::LengthMismatch { left: 2, right: 1, .. }));
    }

    #[test]
    fn non_positive_rate_is_rejected() {
        let err = fill_gaps(array![1.0].view(), array![0.0].view(), 0.0).unwrap_err();
        assert!(matches!(err, ConversionError::InvalidParameter { .. }));
    }

    #[test]
    fn filled_series_has_a_regular_rate() {
        let (_, filled_ts) = fill_gaps(array![1.0, 2.0].view(), array![0.0, 1.0].view(), 10.0).unwrap();
        let rate = regular_series_rate(filled_ts.view(), RATE_TOLERANCE_DECIMALS).unwrap();
        assert_relative_eq!(rate, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn irregular_series_has_no_rate() {
        let timestamps = array![0.0, 0.1, 0.2, 0.35, 0.45];
        assert_eq!(regular_series_rate(timestamps.view(), RATE_TOLERANCE_DECIMALS), None);
        assert_eq!(regular_series_rate(array![0.0].view(), RATE_TOLERANCE_DECIMALS), None);
    }

    #[test]
    fn high_rate_series_survives_float_jitter() {
        let fs = 6103.515625;
        let timestamps = Array1::from_iter((0..10_000).map(|i| 1200.0 + i as f64 / fs));
        let rate = regular_series_rate(timestamps.view(), RATE_TOLERANCE_DECIMALS).unwrap();
        assert_relative_eq!(rate, fs, max_relative = 1e-9);
    }
}
