use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{
    filter::{BandpassFilter, FilterDesign, FrequencyBand, SpectralBands},
    tracker::{BandEnergyTracker, BandReading, TrackerPolicy},
};
use crate::{config::DetectorConfig, AudioFrame, BeatSyncError, Result};

/// Selects how per-band activity turns into a beat decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// The first active band above its trigger floor decides the beat.
    #[default]
    SingleDominant,
    /// A quorum of simultaneously active bands confirms an undifferentiated beat.
    MultiBandQuorum,
}

/// A confirmed beat. Cheap to clone and handed to every listener.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatEvent {
    /// Band that triggered the beat, `None` for undifferentiated beats.
    pub band_tag: Option<String>,
    /// All bands that qualified in this frame, in declaration order.
    pub triggering_bands: Vec<String>,
    /// Energy of the reported band, or the summed energy of the quorum.
    pub magnitude: f32,
    pub timestamp: Instant,
    pub sequence: u64,
}

impl BeatEvent {
    /// Event for a beat that did not come out of live classification.
    pub fn undifferentiated(timestamp: Instant, sequence: u64) -> Self {
        Self {
            band_tag: None,
            triggering_bands: Vec::new(),
            magnitude: 0.0,
            timestamp,
            sequence,
        }
    }
}

/// Outcome of one analysis pass.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub readings: Vec<BandReading>,
    pub triggering_bands: Vec<String>,
    pub magnitude: f32,
    pub event: Option<BeatEvent>,
}

impl Classification {
    pub fn is_beat(&self) -> bool {
        self.event.is_some()
    }
}

/// Counters kept by the classifier; owned by the consumer thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierStats {
    pub frames: u64,
    pub beats: u64,
    pub debounced: u64,
    pub invalid_energies: u64,
    pub skipped_frames: u64,
}

#[derive(Debug)]
struct BandChannel {
    band: FrequencyBand,
    tracker: BandEnergyTracker,
    trigger_floor: f32,
}

#[derive(Debug)]
enum EnergyEngine {
    Butterworth(Vec<BandpassFilter>),
    Spectral(SpectralBands),
}

/// Runs every declared band through its filter and tracker and decides
/// whether the frame is a beat.
#[derive(Debug)]
pub struct BeatClassifier {
    channels: Vec<BandChannel>,
    engine: EnergyEngine,
    mode: DetectionMode,
    quorum: usize,
    min_beat_interval: Duration,
    last_beat: Option<Instant>,
    next_sequence: u64,
    energies: Vec<f32>,
    stats: ClassifierStats,
}

impl BeatClassifier {
    /// Builds the classifier, validating every band against `sample_rate`.
    pub fn new(config: &DetectorConfig, sample_rate: u32) -> Result<Self> {
        if config.bands.is_empty() {
            return Err(BeatSyncError::config("at least one band must be declared"));
        }

        let mut channels = Vec::with_capacity(config.bands.len());
        for band in &config.bands {
            if channels
                .iter()
                .any(|channel: &BandChannel| channel.band.tag() == band.tag)
            {
                return Err(BeatSyncError::config(format!(
                    "band tag `{}` declared twice",
                    band.tag
                )));
            }
            if !band.trigger_floor.is_finite() || band.trigger_floor < 0.0 {
                return Err(BeatSyncError::config(format!(
                    "trigger floor for `{}` must be >= 0",
                    band.tag
                )));
            }

            let descriptor = FrequencyBand::new(&band.tag, band.low_hz, band.high_hz, sample_rate)?;
            let policy = TrackerPolicy::new(band.margin, band.baseline);
            channels.push(BandChannel {
                band: descriptor,
                tracker: BandEnergyTracker::new(config.history_size, policy)?,
                trigger_floor: band.trigger_floor,
            });
        }

        if config.mode == DetectionMode::MultiBandQuorum
            && (config.quorum == 0 || config.quorum > channels.len())
        {
            return Err(BeatSyncError::config(format!(
                "quorum must be between 1 and {}, got {}",
                channels.len(),
                config.quorum
            )));
        }

        let bands: Vec<FrequencyBand> = channels.iter().map(|c| c.band.clone()).collect();
        let engine = match config.filter {
            FilterDesign::Butterworth => EnergyEngine::Butterworth(
                bands
                    .iter()
                    .map(|band| BandpassFilter::design(band, sample_rate, config.energy))
                    .collect(),
            ),
            FilterDesign::Spectral => {
                EnergyEngine::Spectral(SpectralBands::new(bands, sample_rate, config.energy))
            }
        };

        Ok(Self {
            energies: vec![0.0; channels.len()],
            channels,
            engine,
            mode: config.mode,
            quorum: config.quorum,
            min_beat_interval: config.min_beat_interval(),
            last_beat: None,
            next_sequence: 0,
            stats: ClassifierStats::default(),
        })
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn bands(&self) -> impl Iterator<Item = &FrequencyBand> {
        self.channels.iter().map(|channel| &channel.band)
    }

    pub fn stats(&self) -> ClassifierStats {
        self.stats
    }

    /// Clears every band history and the debounce state.
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.tracker.clear();
        }
        self.last_beat = None;
        self.next_sequence = 0;
    }

    /// Analyses one frame. A frame that cannot be analysed is skipped and
    /// counted; it never touches the band histories.
    pub fn classify(&mut self, frame: &AudioFrame) -> Classification {
        let samples = frame.samples();
        let computed = match &mut self.engine {
            EnergyEngine::Butterworth(filters) => {
                for (slot, filter) in self.energies.iter_mut().zip(filters.iter()) {
                    *slot = filter.energy(samples);
                }
                Ok(())
            }
            EnergyEngine::Spectral(spectral) => spectral.energies(samples, &mut self.energies),
        };

        if let Err(err) = computed {
            self.stats.skipped_frames += 1;
            tracing::debug!(error = %err, "skipping frame");
            return Classification::default();
        }

        let energies = std::mem::take(&mut self.energies);
        let classification = self.classify_energies(&energies, frame.captured_at());
        self.energies = energies;
        classification
    }

    /// Decision step on precomputed band energies, one per declared band.
    pub fn classify_energies(&mut self, energies: &[f32], timestamp: Instant) -> Classification {
        if energies.len() != self.channels.len() {
            self.stats.skipped_frames += 1;
            tracing::debug!(
                expected = self.channels.len(),
                got = energies.len(),
                "energy count does not match declared bands"
            );
            return Classification::default();
        }

        self.stats.frames += 1;

        let mut readings = Vec::with_capacity(self.channels.len());
        for (channel, &raw) in self.channels.iter_mut().zip(energies) {
            let energy = if raw.is_finite() && raw >= 0.0 {
                raw
            } else {
                self.stats.invalid_energies += 1;
                0.0
            };
            readings.push(channel.tracker.observe(energy));
        }

        tracing::trace!(?energies, "band energies");

        let (triggering_bands, magnitude) = match self.mode {
            DetectionMode::SingleDominant => {
                let qualifying: Vec<usize> = self
                    .channels
                    .iter()
                    .zip(&readings)
                    .enumerate()
                    .filter(|(_, (channel, reading))| {
                        reading.active && reading.energy > channel.trigger_floor
                    })
                    .map(|(index, _)| index)
                    .collect();
                let magnitude = qualifying.first().map(|&i| readings[i].energy).unwrap_or(0.0);
                (self.tags(&qualifying), magnitude)
            }
            DetectionMode::MultiBandQuorum => {
                let active: Vec<usize> = readings
                    .iter()
                    .enumerate()
                    .filter(|(_, reading)| reading.active)
                    .map(|(index, _)| index)
                    .collect();
                let magnitude = active.iter().map(|&i| readings[i].energy).sum();
                if active.len() >= self.quorum {
                    (self.tags(&active), magnitude)
                } else {
                    (Vec::new(), 0.0)
                }
            }
        };

        let mut classification = Classification {
            readings,
            triggering_bands,
            magnitude,
            event: None,
        };

        if classification.triggering_bands.is_empty() {
            return classification;
        }

        let debounced = self
            .last_beat
            .map(|last| timestamp.saturating_duration_since(last) < self.min_beat_interval)
            .unwrap_or(false);
        if debounced {
            self.stats.debounced += 1;
            tracing::trace!("beat suppressed by debounce");
            return classification;
        }

        let band_tag = match self.mode {
            DetectionMode::SingleDominant => classification.triggering_bands.first().cloned(),
            DetectionMode::MultiBandQuorum => None,
        };

        self.last_beat = Some(timestamp);
        self.stats.beats += 1;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        classification.event = Some(BeatEvent {
            band_tag,
            triggering_bands: classification.triggering_bands.clone(),
            magnitude: classification.magnitude,
            timestamp,
            sequence,
        });
        classification
    }

    fn tags(&self, indices: &[usize]) -> Vec<String> {
        indices
            .iter()
            .map(|&index| self.channels[index].band.tag().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{filter::sine, EnergyMeasure, ThresholdMargin},
        config::BandConfig,
    };

    const RATE: u32 = 44_100;
    const CHUNK: usize = 2_048;

    fn band(tag: &str, low_hz: f32, high_hz: f32, margin: ThresholdMargin, floor: f32) -> BandConfig {
        BandConfig {
            tag: tag.to_string(),
            low_hz,
            high_hz,
            trigger_floor: floor,
            margin,
            baseline: None,
        }
    }

    fn single_kick() -> DetectorConfig {
        DetectorConfig {
            mode: DetectionMode::SingleDominant,
            bands: vec![band(
                "kick",
                50.0,
                100.0,
                ThresholdMargin::Additive { threshold: 0.05 },
                0.1,
            )],
            min_beat_interval_ms: 200,
            ..DetectorConfig::default()
        }
    }

    fn quorum_config() -> DetectorConfig {
        let margin = ThresholdMargin::Multiplicative { multiplier: 1.3 };
        DetectorConfig {
            mode: DetectionMode::MultiBandQuorum,
            quorum: 2,
            bands: vec![
                band("bass", 40.0, 250.0, margin, 0.0),
                band("mid", 250.0, 2_000.0, margin, 0.0),
                band("high", 2_000.0, 8_000.0, margin, 0.0),
            ],
            min_beat_interval_ms: 100,
            ..DetectorConfig::default()
        }
    }

    fn frame(samples: Vec<f32>, at: Instant) -> AudioFrame {
        AudioFrame::new(samples, RATE, at)
    }

    #[test]
    fn kick_scenario_emits_one_tagged_event() {
        let mut classifier = BeatClassifier::new(&single_kick(), RATE).unwrap();
        let start = Instant::now();
        let step = Duration::from_millis(50);

        let mut events = Vec::new();
        for i in 0..3 {
            let quiet = frame(vec![1e-4; CHUNK], start + step * i);
            events.extend(classifier.classify(&quiet).event);
        }
        let loud = frame(sine(75.0, 1.0, RATE, CHUNK), start + step * 3);
        let classification = classifier.classify(&loud);
        assert!(classification.readings[0].energy > 0.1);
        events.extend(classification.event);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].band_tag.as_deref(), Some("kick"));
        assert_eq!(events[0].sequence, 0);
    }

    #[test]
    fn kick_scenario_on_precomputed_energies() {
        let mut classifier = BeatClassifier::new(&single_kick(), RATE).unwrap();
        let start = Instant::now();

        for i in 0..3 {
            let c = classifier.classify_energies(&[0.001], start + Duration::from_millis(i * 50));
            assert!(!c.is_beat());
        }
        let c = classifier.classify_energies(&[0.5], start + Duration::from_millis(150));
        let event = c.event.expect("beat expected");
        assert_eq!(event.band_tag.as_deref(), Some("kick"));
        assert!((event.magnitude - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn never_beats_during_warm_up() {
        let mut classifier = BeatClassifier::new(&single_kick(), RATE).unwrap();
        let c = classifier.classify_energies(&[100.0], Instant::now());
        assert!(!c.is_beat());
        assert!(!c.readings[0].active);
    }

    #[test]
    fn trigger_floor_blocks_quiet_spikes() {
        let mut classifier = BeatClassifier::new(&single_kick(), RATE).unwrap();
        let start = Instant::now();
        classifier.classify_energies(&[0.0], start);
        classifier.classify_energies(&[0.0], start + Duration::from_millis(50));
        // Active relative to the baseline, but under the 0.1 floor.
        let c = classifier.classify_energies(&[0.09], start + Duration::from_millis(100));
        assert!(c.readings[0].active);
        assert!(!c.is_beat());
    }

    #[test]
    fn debounce_suppresses_second_beat_within_interval() {
        let mut classifier = BeatClassifier::new(&single_kick(), RATE).unwrap();
        let start = Instant::now();
        for i in 0..3 {
            classifier.classify_energies(&[0.0], start + Duration::from_millis(i * 10));
        }

        let first = classifier.classify_energies(&[1.0], start + Duration::from_millis(30));
        let second = classifier.classify_energies(&[5.0], start + Duration::from_millis(80));
        assert!(first.is_beat());
        assert!(!second.is_beat());
        assert_eq!(second.triggering_bands, vec!["kick".to_string()]);
        assert_eq!(classifier.stats().debounced, 1);
        assert_eq!(classifier.stats().beats, 1);

        let third = classifier.classify_energies(&[50.0], start + Duration::from_millis(400));
        assert_eq!(third.event.map(|e| e.sequence), Some(1));
    }

    #[test]
    fn first_declared_band_wins_in_single_mode() {
        let margin = ThresholdMargin::Additive { threshold: 0.05 };
        let config = DetectorConfig {
            bands: vec![
                band("kick", 50.0, 100.0, margin, 0.1),
                band("snare", 150.0, 250.0, margin, 0.1),
            ],
            ..single_kick()
        };
        let mut classifier = BeatClassifier::new(&config, RATE).unwrap();
        let start = Instant::now();
        classifier.classify_energies(&[0.0, 0.0], start);
        classifier.classify_energies(&[0.0, 0.0], start + Duration::from_millis(10));

        let c = classifier.classify_energies(&[0.4, 0.9], start + Duration::from_millis(20));
        let event = c.event.unwrap();
        assert_eq!(event.band_tag.as_deref(), Some("kick"));
        assert_eq!(event.triggering_bands, vec!["kick", "snare"]);
    }

    #[test]
    fn quorum_scenario_requires_two_active_bands() {
        let mut classifier = BeatClassifier::new(&quorum_config(), RATE).unwrap();
        let start = Instant::now();
        let at = |ms: u64| start + Duration::from_millis(ms);

        for i in 0..4 {
            assert!(!classifier.classify_energies(&[1.0, 1.0, 1.0], at(i * 200)).is_beat());
        }

        let lonely = classifier.classify_energies(&[3.0, 1.0, 1.0], at(1_000));
        assert!(lonely.readings[0].active);
        assert!(!lonely.is_beat());
        assert!(lonely.triggering_bands.is_empty());

        let confirmed = classifier.classify_energies(&[1.0, 4.0, 4.0], at(1_200));
        let event = confirmed.event.expect("quorum reached");
        assert_eq!(event.band_tag, None);
        assert_eq!(event.triggering_bands, vec!["mid", "high"]);
        assert!((event.magnitude - 8.0).abs() < 1e-6);
        assert_eq!(classifier.stats().beats, 1);
    }

    #[test]
    fn non_finite_energy_counts_as_zero() {
        let mut classifier = BeatClassifier::new(&single_kick(), RATE).unwrap();
        let start = Instant::now();
        let c = classifier.classify_energies(&[f32::NAN], start);
        assert_eq!(c.readings[0].energy, 0.0);
        classifier.classify_energies(&[f32::INFINITY], start + Duration::from_millis(10));
        assert_eq!(classifier.stats().invalid_energies, 2);

        let nan_frame = frame(vec![f32::NAN; CHUNK], start + Duration::from_millis(20));
        let c = classifier.classify(&nan_frame);
        assert!(!c.is_beat());
        assert_eq!(classifier.stats().invalid_energies, 3);
    }

    #[test]
    fn spectral_design_detects_kick() {
        let config = DetectorConfig {
            filter: FilterDesign::Spectral,
            energy: EnergyMeasure::Rms,
            ..single_kick()
        };
        let mut classifier = BeatClassifier::new(&config, RATE).unwrap();
        let start = Instant::now();
        for i in 0..3 {
            classifier.classify(&frame(vec![0.0; CHUNK], start + Duration::from_millis(i * 50)));
        }
        let c = classifier.classify(&frame(sine(75.0, 1.0, RATE, CHUNK), start + Duration::from_millis(150)));
        assert_eq!(c.event.and_then(|e| e.band_tag).as_deref(), Some("kick"));
    }

    #[test]
    fn construction_rejects_bad_bands_and_quorum() {
        let mut config = single_kick();
        config.bands[0].high_hz = 30_000.0;
        assert!(matches!(
            BeatClassifier::new(&config, RATE),
            Err(BeatSyncError::InvalidBandRange { .. })
        ));

        let mut config = single_kick();
        config.bands[0].low_hz = 200.0;
        assert!(BeatClassifier::new(&config, RATE).is_err());

        let mut config = quorum_config();
        config.quorum = 4;
        assert!(BeatClassifier::new(&config, RATE).is_err());

        let mut config = single_kick();
        config.bands.push(config.bands[0].clone());
        assert!(BeatClassifier::new(&config, RATE).is_err());
    }

    #[test]
    fn reset_restarts_warm_up_and_sequence() {
        let mut classifier = BeatClassifier::new(&single_kick(), RATE).unwrap();
        let start = Instant::now();
        classifier.classify_energies(&[0.0], start);
        classifier.classify_energies(&[1.0], start + Duration::from_millis(10));
        classifier.reset();

        let c = classifier.classify_energies(&[1.0], start + Duration::from_millis(20));
        assert!(!c.is_beat());
    }
}
