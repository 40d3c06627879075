//! Lock-in demodulation of frequency-multiplexed photometry signals.
//!
//! Each excitation LED is driven by a sinusoid at its own carrier frequency,
//! so one photodetector stream carries several fluorescence channels at
//! once. Mixing the stream with a quadrature pair at a carrier and
//! low-passing both products recovers that channel's envelope.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};

use crate::types::{ConversionError, DemodulatedPair};

/// Default low-pass cutoff applied after mixing (Hz).
pub const DEFAULT_CUTOFF_FREQUENCY: f64 = 6.0;

/// Carrier of the 465 nm (calcium-dependent) excitation LED (Hz).
pub const CALCIUM_DRIVER_FREQUENCY: f64 = 330.0;

/// Carrier of the 405 nm (isosbestic) excitation LED (Hz).
pub const ISOSBESTIC_DRIVER_FREQUENCY: f64 = 210.0;

// Carriers are configured in whole hertz
const DRIVER_FREQUENCY_TOLERANCE: f64 = 1e-3;

// 3 * max(len(a), len(b)) for a biquad
const FILTFILT_PAD_LENGTH: usize = 9;

/// Carrier frequencies of the two multiplexed channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverFrequencies {
    pub calcium: f64,
    pub isosbestic: f64,
}

impl Default for DriverFrequencies {
    fn default() -> Self {
        DriverFrequencies {
            calcium: CALCIUM_DRIVER_FREQUENCY,
            isosbestic: ISOSBESTIC_DRIVER_FREQUENCY,
        }
    }
}

impl DriverFrequencies {
    /// Which of the two carriers `driver_freq` names.
    pub fn carrier_of(&self, driver_freq: f64) -> Result<Carrier, ConversionError> {
        if (driver_freq - self.calcium).abs() < DRIVER_FREQUENCY_TOLERANCE {
            Ok(Carrier::Calcium)
        } else if (driver_freq - self.isosbestic).abs() < DRIVER_FREQUENCY_TOLERANCE {
            Ok(Carrier::Isosbestic)
        } else {
            Err(ConversionError::InvalidParameter {
                name: "driver_freq",
                reason: format!(
                    "{driver_freq} Hz is neither the calcium ({} Hz) nor the isosbestic ({} Hz) carrier",
                    self.calcium, self.isosbestic
                ),
            })
        }
    }
}

/// One of the two multiplexed channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    Calcium,
    Isosbestic,
}

impl DemodulatedPair {
    pub fn channel(&self, carrier: Carrier) -> &Array1<f64> {
        match carrier {
            Carrier::Calcium => &self.calcium,
            Carrier::Isosbestic => &self.isosbestic,
        }
    }
}

/// Second-order IIR section in normalized form (`a[0] == 1`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl BiquadCoeffs {
    /// Designs a 2nd-order Butterworth lowpass by bilinear transform with
    /// frequency pre-warping.
    ///
    /// # Arguments
    ///
    /// * `sampling_rate` - Sampling frequency in Hz
    /// * `cutoff` - -3 dB frequency in Hz, strictly between 0 and Nyquist
    pub fn butterworth_lowpass(sampling_rate: f64, cutoff: f64) -> Result<Self, ConversionError> {
        check_positive("sampling_rate", sampling_rate)?;
        let nyquist = sampling_rate / 2.0;
        if !(cutoff > 0.0 && cutoff < nyquist) {
            return Err(ConversionError::InvalidParameter {
                name: "cutoff_freq",
                reason: format!("must lie strictly between 0 and Nyquist ({nyquist} Hz), got {cutoff}"),
            });
        }

        let k = (PI * cutoff / sampling_rate).tan();
        let k2 = k * k;
        let norm = 1.0 / (1.0 + SQRT_2 * k + k2);
        let b0 = k2 * norm;

        Ok(BiquadCoeffs {
            b: [b0, 2.0 * b0, b0],
            a: [1.0, 2.0 * (k2 - 1.0) * norm, (1.0 - SQRT_2 * k + k2) * norm],
        })
    }

    /// Filter state that produces a step response already at steady state
    /// for a unit input.
    fn steady_state(&self) -> [f64; 2] {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let r0 = b1 - a1 * b0;
        let r1 = b2 - a2 * b0;
        let z0 = (r0 + r1) / (1.0 + a1 + a2);
        [z0, r1 - a2 * z0]
    }

    /// Runs the section over `input` (transposed direct form II).
    fn filter_with_state(&self, input: &[f64], mut state: [f64; 2]) -> Vec<f64> {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        input
            .iter()
            .map(|&x| {
                let y = b0 * x + state[0];
                state[0] = b1 * x - a1 * y + state[1];
                state[1] = b2 * x - a2 * y;
                y
            })
            .collect()
    }
}

/// Applies `coeffs` forward and backward so the output has no phase shift.
///
/// Edges are handled by odd extension over `3 * max(len(a), len(b))`
/// samples, and each pass starts from the steady state of its first input
/// sample. Signals no longer than the extension are rejected.
pub fn filtfilt(coeffs: &BiquadCoeffs, signal: &[f64]) -> Result<Vec<f64>, ConversionError> {
    let n = signal.len();
    if n <= FILTFILT_PAD_LENGTH {
        return Err(ConversionError::SignalTooShort {
            len: n,
            min: FILTFILT_PAD_LENGTH,
        });
    }

    let extended = odd_extension(signal, FILTFILT_PAD_LENGTH);
    let zi = coeffs.steady_state();

    let x0 = extended[0];
    let forward = coeffs.filter_with_state(&extended, [zi[0] * x0, zi[1] * x0]);

    let reversed: Vec<f64> = forward.into_iter().rev().collect();
    let y0 = reversed[0];
    let mut backward = coeffs.filter_with_state(&reversed, [zi[0] * y0, zi[1] * y0]);
    backward.reverse();

    Ok(backward[FILTFILT_PAD_LENGTH..FILTFILT_PAD_LENGTH + n].to_vec())
}

fn odd_extension(signal: &[f64], pad: usize) -> Vec<f64> {
    let n = signal.len();
    let first = signal[0];
    let last = signal[n - 1];

    let mut extended = Vec::with_capacity(n + 2 * pad);
    extended.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
    extended.extend_from_slice(signal);
    extended.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));
    extended
}

/// Recovers one channel from a raw modulated signal.
///
/// The raw signal is mixed with `sin` and `cos` at `driver_freq` on the
/// time axis `t[i] = i / sampling_rate`, both products are low-passed with a
/// zero-phase 2nd-order Butterworth at `cutoff_freq`, and the magnitude
/// `sqrt(sin² + cos²)` is returned. For a carrier `A·cos(2π·f·t)` the
/// result settles at `A / 2`.
///
/// `driver_freq` should be below Nyquist; this is not checked.
///
/// # Errors
///
/// * [`ConversionError::InvalidParameter`] for a non-positive sampling rate or
///   driver frequency, or a cutoff not strictly inside (0, Nyquist)
/// * [`ConversionError::SignalTooShort`] when the signal cannot be padded
pub fn demodulate(
    raw: ArrayView1<f64>,
    sampling_rate: f64,
    driver_freq: f64,
    cutoff_freq: f64,
) -> Result<Array1<f64>, ConversionError> {
    check_positive("sampling_rate", sampling_rate)?;
    check_positive("driver_freq", driver_freq)?;
    let coeffs = BiquadCoeffs::butterworth_lowpass(sampling_rate, cutoff_freq)?;

    let omega = 2.0 * PI * driver_freq / sampling_rate;
    let (sin_component, cos_component): (Vec<f64>, Vec<f64>) = raw
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let phase = omega * i as f64;
            (x * phase.sin(), x * phase.cos())
        })
        .unzip();

    let filtered_sin = filtfilt(&coeffs, &sin_component)?;
    let filtered_cos = filtfilt(&coeffs, &cos_component)?;

    Ok(filtered_sin
        .iter()
        .zip(&filtered_cos)
        .map(|(s, c)| s.hypot(*c))
        .collect())
}

/// Demodulates the calcium and isosbestic channels from one raw stream.
pub fn demodulate_pair(
    raw: ArrayView1<f64>,
    timestamps: ArrayView1<f64>,
    sampling_rate: f64,
    drivers: DriverFrequencies,
    cutoff_freq: f64,
) -> Result<DemodulatedPair, ConversionError> {
    if raw.len() != timestamps.len() {
        return Err(ConversionError::LengthMismatch {
            what: "timestamps".to_string(),
            left: timestamps.len(),
            right: raw.len(),
        });
    }

    Ok(DemodulatedPair {
        calcium: demodulate(raw, sampling_rate, drivers.calcium, cutoff_freq)?,
        isosbestic: demodulate(raw, sampling_rate, drivers.isosbestic, cutoff_freq)?,
        timestamps: timestamps.to_owned(),
    })
}

pub(crate) fn check_positive(name: &'static str, value: f64) -> Result<(), ConversionError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConversionError::InvalidParameter {
            name,
            reason: format!("must be a positive finite number, got {value}"),
        })
    }
}
