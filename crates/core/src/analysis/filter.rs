use std::{
    f64::consts::{FRAC_1_SQRT_2, PI},
    fmt,
    sync::Arc,
};

use realfft::{
    num_complex::{Complex32, Complex64},
    RealFftPlanner, RealToComplex,
};
use serde::{Deserialize, Serialize};

use crate::{BeatSyncError, Result};

/// Mean |x| of a sinusoid relative to its RMS (2√2 / π).
const SINE_MEAN_ABS_PER_RMS: f32 = 0.900_316_3;

/// Immutable descriptor for one analysed frequency range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    tag: String,
    low_hz: f32,
    high_hz: f32,
}

impl FrequencyBand {
    /// Validates `0 < low_hz < high_hz < sample_rate / 2` and builds the band.
    pub fn new(tag: impl Into<String>, low_hz: f32, high_hz: f32, sample_rate: u32) -> Result<Self> {
        let tag = tag.into();
        let nyquist = sample_rate as f32 * 0.5;
        let in_range = low_hz.is_finite()
            && high_hz.is_finite()
            && low_hz > 0.0
            && low_hz < high_hz
            && high_hz < nyquist;

        if !in_range {
            return Err(BeatSyncError::InvalidBandRange {
                tag,
                low_hz,
                high_hz,
                nyquist,
            });
        }

        Ok(Self {
            tag,
            low_hz,
            high_hz,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn low_hz(&self) -> f32 {
        self.low_hz
    }

    pub fn high_hz(&self) -> f32 {
        self.high_hz
    }

    /// Geometric centre of the band.
    pub fn center_hz(&self) -> f32 {
        (self.low_hz * self.high_hz).sqrt()
    }
}

/// How filtered samples are reduced to a single energy scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyMeasure {
    #[default]
    MeanAbsolute,
    Rms,
}

/// Band-limiting strategy used by the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDesign {
    /// 4th-order Butterworth bandpass per band.
    #[default]
    Butterworth,
    /// One windowed FFT per frame, bands read from the spectrum.
    Spectral,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn response(&self, omega: f64) -> Complex64 {
        let z1 = Complex64::from_polar(1.0, -omega);
        let z2 = z1 * z1;
        let numerator = self.b0 + z1 * self.b1 + z2 * self.b2;
        let denominator = 1.0 + z1 * self.a1 + z2 * self.a2;
        numerator / denominator
    }
}

/// 4th-order Butterworth bandpass, realised as two second-order sections.
///
/// Coefficients are derived once from the band edges. Every call to
/// [`BandpassFilter::energy`] starts from zeroed filter state, so the
/// transform is stateless across frames and never mutates its input.
#[derive(Debug, Clone)]
pub struct BandpassFilter {
    band: FrequencyBand,
    measure: EnergyMeasure,
    sections: [Biquad; 2],
}

impl BandpassFilter {
    /// Designs the filter via the bilinear transform of an order-2 analog
    /// lowpass prototype, with pre-warped band edges.
    pub fn design(band: &FrequencyBand, sample_rate: u32, measure: EnergyMeasure) -> Self {
        let fs2 = 2.0 * sample_rate as f64;
        let warp = |hz: f32| fs2 * (PI * hz as f64 / sample_rate as f64).tan();
        let w1 = warp(band.low_hz);
        let w2 = warp(band.high_hz);
        let bandwidth = w2 - w1;
        let center_sq = w1 * w2;

        let prototype = Complex64::new(-FRAC_1_SQRT_2, FRAC_1_SQRT_2);
        let half = prototype * (bandwidth * 0.5);
        let root = (half * half - center_sq).sqrt();

        let mut sections = [half + root, half - root].map(|pole| {
            let z = (fs2 + pole) / (fs2 - pole);
            Biquad {
                b0: 1.0,
                b1: 0.0,
                b2: -1.0,
                a1: -2.0 * z.re,
                a2: z.norm_sqr(),
            }
        });

        // Unity gain at the digital image of the analog centre frequency.
        let omega = 2.0 * (center_sq.sqrt() / fs2).atan();
        let peak = sections
            .iter()
            .map(|section| section.response(omega))
            .fold(Complex64::new(1.0, 0.0), |acc, h| acc * h)
            .norm();
        if peak > f64::EPSILON {
            sections[0].b0 /= peak;
            sections[0].b2 /= peak;
        }

        Self {
            band: band.clone(),
            measure,
            sections,
        }
    }

    pub fn band(&self) -> &FrequencyBand {
        &self.band
    }

    /// Magnitude response at `hz`, mostly useful for diagnostics.
    pub fn gain_at(&self, hz: f32, sample_rate: u32) -> f32 {
        let omega = 2.0 * PI * hz as f64 / sample_rate as f64;
        self.sections
            .iter()
            .map(|section| section.response(omega))
            .fold(Complex64::new(1.0, 0.0), |acc, h| acc * h)
            .norm() as f32
    }

    /// Filters `samples` and reduces the output to an energy scalar.
    ///
    /// Non-finite input propagates to a non-finite result; callers decide how
    /// to treat it.
    pub fn energy(&self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let mut state = [[0.0_f64; 2]; 2];
        let mut accumulator = 0.0_f64;

        for &sample in samples {
            let mut value = sample as f64;
            for (section, st) in self.sections.iter().zip(state.iter_mut()) {
                let out = section.b0 * value + st[0];
                st[0] = section.b1 * value - section.a1 * out + st[1];
                st[1] = section.b2 * value - section.a2 * out;
                value = out;
            }
            accumulator += match self.measure {
                EnergyMeasure::MeanAbsolute => value.abs(),
                EnergyMeasure::Rms => value * value,
            };
        }

        let mean = accumulator / samples.len() as f64;
        match self.measure {
            EnergyMeasure::MeanAbsolute => mean as f32,
            EnergyMeasure::Rms => mean.sqrt() as f32,
        }
    }
}

/// FFT-backed band energy extraction: one transform per frame shared by all
/// declared bands.
pub struct SpectralBands {
    bands: Vec<FrequencyBand>,
    sample_rate: u32,
    measure: EnergyMeasure,
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
    window: Vec<f32>,
    window_power: f32,
    bin_ranges: Vec<(usize, usize)>,
}

impl SpectralBands {
    pub fn new(bands: Vec<FrequencyBand>, sample_rate: u32, measure: EnergyMeasure) -> Self {
        Self {
            bands,
            sample_rate,
            measure,
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Writes one energy value per band into `out`, in declaration order.
    pub fn energies(&mut self, samples: &[f32], out: &mut [f32]) -> Result<()> {
        if samples.len() < 2 {
            return Err(BeatSyncError::TransientProcessing(
                "spectral analysis requires at least two samples".to_string(),
            ));
        }
        if out.len() != self.bands.len() {
            return Err(BeatSyncError::TransientProcessing(format!(
                "expected {} output slots, got {}",
                self.bands.len(),
                out.len()
            )));
        }

        let measure = self.measure;
        let fft = self.prepare_fft(samples.len());

        for ((slot, sample), weight) in fft.input.iter_mut().zip(samples).zip(&fft.window) {
            *slot = *sample * *weight;
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let norm = fft.size as f32 * fft.window_power;
        for (value, &(first, last)) in out.iter_mut().zip(&fft.bin_ranges) {
            let power: f32 = fft.spectrum[first..=last].iter().map(|bin| bin.norm_sqr()).sum();
            let rms = if norm > f32::EPSILON {
                (2.0 * power / norm).sqrt()
            } else {
                0.0
            };
            *value = match measure {
                EnergyMeasure::Rms => rms,
                EnergyMeasure::MeanAbsolute => rms * SINE_MEAN_ABS_PER_RMS,
            };
        }

        Ok(())
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let rebuild = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(true);

        if rebuild {
            self.fft = None;
        }

        let (planner, bands, sample_rate) = (&mut self.planner, &self.bands, self.sample_rate);
        self.fft
            .get_or_insert_with(|| FftResources::build(planner, bands, sample_rate, size))
    }
}

impl FftResources {
    fn build(
        planner: &mut RealFftPlanner<f32>,
        bands: &[FrequencyBand],
        sample_rate: u32,
        size: usize,
    ) -> Self {
        let plan = planner.plan_fft_forward(size);
        let window: Vec<f32> = (0..size).map(|index| hann_value(index, size)).collect();
        let window_power = window.iter().map(|w| w * w).sum();
        let bin_hz = sample_rate as f32 / size as f32;
        let last_bin = size / 2;
        let bin_ranges = bands
            .iter()
            .map(|band| {
                let first = ((band.low_hz / bin_hz).ceil() as usize).min(last_bin);
                let last = ((band.high_hz / bin_hz).floor() as usize).min(last_bin);
                if first <= last {
                    (first, last)
                } else {
                    let nearest = ((band.center_hz() / bin_hz).round() as usize).min(last_bin);
                    (nearest, nearest)
                }
            })
            .collect();

        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
            window,
            window_power,
            bin_ranges,
        }
    }
}

impl fmt::Debug for SpectralBands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralBands")
            .field("bands", &self.bands.len())
            .field("sample_rate", &self.sample_rate)
            .field("measure", &self.measure)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * std::f32::consts::PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
pub(crate) fn sine(hz: f32, amplitude: f32, sample_rate: u32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| {
            amplitude * (2.0 * std::f32::consts::PI * hz * n as f32 / sample_rate as f32).sin()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 44_100;

    fn kick() -> FrequencyBand {
        FrequencyBand::new("kick", 50.0, 100.0, RATE).unwrap()
    }

    #[test]
    fn rejects_inverted_and_out_of_range_bands() {
        assert!(FrequencyBand::new("a", 100.0, 50.0, RATE).is_err());
        assert!(FrequencyBand::new("b", 100.0, 100.0, RATE).is_err());
        assert!(FrequencyBand::new("c", 0.0, 100.0, RATE).is_err());
        assert!(FrequencyBand::new("d", 1_000.0, 22_050.0, RATE).is_err());
        assert!(FrequencyBand::new("e", 1_000.0, 30_000.0, RATE).is_err());

        let err = FrequencyBand::new("snare", 300.0, 200.0, RATE).unwrap_err();
        assert!(matches!(err, BeatSyncError::InvalidBandRange { .. }));
        assert!(format!("{err}").contains("snare"));
    }

    #[test]
    fn butterworth_passes_centre_and_rejects_far_frequencies() {
        let filter = BandpassFilter::design(&kick(), RATE, EnergyMeasure::Rms);

        let centre = filter.gain_at(kick().center_hz(), RATE);
        assert!((centre - 1.0).abs() < 1e-3, "centre gain {centre}");

        let edge = filter.gain_at(50.0, RATE);
        assert!((edge - FRAC_1_SQRT_2 as f32).abs() < 0.02, "edge gain {edge}");

        assert!(filter.gain_at(2_000.0, RATE) < 0.01);
        assert!(filter.gain_at(5.0, RATE) < 0.05);
    }

    #[test]
    fn energy_tracks_in_band_content_only() {
        let filter = BandpassFilter::design(&kick(), RATE, EnergyMeasure::Rms);

        let in_band = sine(70.0, 1.0, RATE, 8_192);
        let out_of_band = sine(3_000.0, 1.0, RATE, 8_192);

        let passed = filter.energy(&in_band);
        let rejected = filter.energy(&out_of_band);
        assert!(passed > 0.5, "in-band energy {passed}");
        assert!(rejected < 0.01, "out-of-band energy {rejected}");
    }

    #[test]
    fn energy_is_non_negative_and_leaves_input_untouched() {
        let filter = BandpassFilter::design(&kick(), RATE, EnergyMeasure::MeanAbsolute);
        let samples = sine(80.0, 0.5, RATE, 2_048);
        let copy = samples.clone();

        let energy = filter.energy(&samples);
        assert!(energy >= 0.0);
        assert_eq!(samples, copy);
        assert_eq!(filter.energy(&[]), 0.0);
        assert_eq!(filter.energy(&samples), energy);
    }

    #[test]
    fn spectral_bands_separate_low_and_high_content() {
        let bands = vec![
            FrequencyBand::new("bass", 40.0, 250.0, RATE).unwrap(),
            FrequencyBand::new("high", 4_000.0, 8_000.0, RATE).unwrap(),
        ];
        let mut spectral = SpectralBands::new(bands, RATE, EnergyMeasure::Rms);
        let samples = sine(120.0, 1.0, RATE, 4_096);

        let mut out = [0.0; 2];
        spectral.energies(&samples, &mut out).unwrap();
        assert!((out[0] - FRAC_1_SQRT_2 as f32).abs() < 0.1, "bass {}", out[0]);
        assert!(out[1] < 0.01, "high {}", out[1]);
    }

    #[test]
    fn spectral_bands_reject_mismatched_output() {
        let bands = vec![FrequencyBand::new("bass", 40.0, 250.0, RATE).unwrap()];
        let mut spectral = SpectralBands::new(bands, RATE, EnergyMeasure::Rms);
        let mut out = [0.0; 3];
        assert!(spectral.energies(&[0.0; 64], &mut out).is_err());
    }
}
