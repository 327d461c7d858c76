use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{
        BaselineWindow, BeatClassifier, DetectionMode, EnergyMeasure, FilterDesign,
        ThresholdMargin,
    },
    mapping::Choreography,
    BeatSyncError, Result,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub detector: DetectorConfig,
    pub actuation: ActuationConfig,
    pub lifecycle: LifecycleConfig,
    pub choreography: Choreography,
}

impl AppConfig {
    /// Single-dominant-band routing over kick, snare, hi-hat and toms.
    pub fn drum_defaults() -> Self {
        Self::default()
    }

    /// Undifferentiated beats confirmed by a quorum of broad bands.
    pub fn multi_band_defaults() -> Self {
        Self {
            detector: DetectorConfig::multi_band(),
            ..Self::default()
        }
    }

    /// Loads a JSON configuration file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every capacity and band invariant. Construction of the engine
    /// calls this, so a bad configuration never reaches startup.
    pub fn validate(&self) -> Result<()> {
        self.audio.validate()?;
        self.actuation.validate()?;
        // Building a classifier runs the band and quorum checks.
        BeatClassifier::new(&self.detector, self.audio.sample_rate)?;
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub chunk_size: usize,
    /// Frames buffered between the audio callback and the analysis thread.
    pub queue_capacity: usize,
    pub pop_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            chunk_size: 2048,
            queue_capacity: 10,
            pop_timeout_ms: 100,
        }
    }
}

impl AudioConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(BeatSyncError::config("sample rate must be positive"));
        }
        if self.chunk_size < 2 {
            return Err(BeatSyncError::config("chunk size must be at least 2 samples"));
        }
        if self.queue_capacity == 0 {
            return Err(BeatSyncError::config("audio queue capacity must be at least 1"));
        }
        Ok(())
    }
}

/// One declared band and its trigger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandConfig {
    pub tag: String,
    pub low_hz: f32,
    pub high_hz: f32,
    /// Raw energy the band must exceed in single-dominant mode.
    #[serde(default)]
    pub trigger_floor: f32,
    pub margin: ThresholdMargin,
    /// Overrides the margin's default baseline window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineWindow>,
}

impl BandConfig {
    pub fn drum(tag: &str, low_hz: f32, high_hz: f32, trigger_floor: f32, threshold: f32) -> Self {
        Self {
            tag: tag.to_string(),
            low_hz,
            high_hz,
            trigger_floor,
            margin: ThresholdMargin::Additive { threshold },
            baseline: None,
        }
    }

    pub fn confirmation(tag: &str, low_hz: f32, high_hz: f32, multiplier: f32) -> Self {
        Self {
            tag: tag.to_string(),
            low_hz,
            high_hz,
            trigger_floor: 0.0,
            margin: ThresholdMargin::Multiplicative { multiplier },
            baseline: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub mode: DetectionMode,
    pub filter: FilterDesign,
    pub energy: EnergyMeasure,
    pub history_size: usize,
    /// Active bands needed to confirm a beat in quorum mode.
    pub quorum: usize,
    pub min_beat_interval_ms: u64,
    pub bands: Vec<BandConfig>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::SingleDominant,
            filter: FilterDesign::Butterworth,
            energy: EnergyMeasure::MeanAbsolute,
            history_size: 20,
            quorum: 2,
            min_beat_interval_ms: 200,
            bands: vec![
                BandConfig::drum("kick", 50.0, 100.0, 0.1, 0.05),
                BandConfig::drum("snare", 150.0, 250.0, 0.08, 0.05),
                BandConfig::drum("hihat", 5_000.0, 10_000.0, 0.03, 0.02),
                BandConfig::drum("toms", 100.0, 150.0, 0.08, 0.05),
            ],
        }
    }
}

impl DetectorConfig {
    pub fn multi_band() -> Self {
        Self {
            mode: DetectionMode::MultiBandQuorum,
            energy: EnergyMeasure::Rms,
            min_beat_interval_ms: 100,
            bands: vec![
                BandConfig::confirmation("bass", 40.0, 250.0, 1.3),
                BandConfig::confirmation("mid", 250.0, 2_000.0, 1.3),
                BandConfig::confirmation("high", 2_000.0, 8_000.0, 1.3),
            ],
            ..Self::default()
        }
    }

    pub fn min_beat_interval(&self) -> Duration {
        Duration::from_millis(self.min_beat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuationConfig {
    pub capacity: usize,
    pub min_command_interval_ms: u64,
    /// Total attempts per command, including the first.
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            min_command_interval_ms: 500,
            retry_count: 3,
            retry_backoff_ms: 1_000,
            poll_interval_ms: 100,
        }
    }
}

impl ActuationConfig {
    pub fn min_command_interval(&self) -> Duration {
        Duration::from_millis(self.min_command_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(BeatSyncError::config("actuation queue capacity must be at least 1"));
        }
        if self.retry_count == 0 {
            return Err(BeatSyncError::config("retry count must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on waiting for worker threads during stop.
    pub join_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 1_000,
        }
    }
}

impl LifecycleConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
