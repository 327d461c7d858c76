use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{BeatSyncError, Result};

/// Minimum number of samples a tracker needs before it can report activity.
pub const WARM_UP_SAMPLES: usize = 2;

/// How far above the baseline an energy sample must land to count as active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ThresholdMargin {
    /// `baseline + threshold`, used for drum-type routing.
    Additive { threshold: f32 },
    /// `baseline * multiplier`, used for multi-band confirmation.
    Multiplicative { multiplier: f32 },
}

impl ThresholdMargin {
    /// Activation level for the given baseline.
    pub fn level(&self, baseline: f32) -> f32 {
        match *self {
            Self::Additive { threshold } => baseline + threshold,
            Self::Multiplicative { multiplier } => baseline * multiplier,
        }
    }

    /// Baseline window each margin was tuned against.
    pub fn default_window(&self) -> BaselineWindow {
        match self {
            Self::Additive { .. } => BaselineWindow::IncludeCurrent,
            Self::Multiplicative { .. } => BaselineWindow::ExcludeCurrent,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Additive { threshold } if !threshold.is_finite() || threshold < 0.0 => Err(
                BeatSyncError::config(format!("additive threshold must be >= 0, got {threshold}")),
            ),
            Self::Multiplicative { multiplier } if !multiplier.is_finite() || multiplier <= 0.0 => {
                Err(BeatSyncError::config(format!(
                    "multiplier must be > 0, got {multiplier}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Whether the newest sample takes part in its own baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineWindow {
    IncludeCurrent,
    ExcludeCurrent,
}

/// Margin plus baseline window. The two are chosen independently.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerPolicy {
    pub margin: ThresholdMargin,
    pub window: BaselineWindow,
}

impl TrackerPolicy {
    pub fn new(margin: ThresholdMargin, window: Option<BaselineWindow>) -> Self {
        Self {
            window: window.unwrap_or_else(|| margin.default_window()),
            margin,
        }
    }

    /// Additive margin over a baseline that includes the newest sample.
    pub fn drum(threshold: f32) -> Self {
        Self::new(ThresholdMargin::Additive { threshold }, None)
    }

    /// Multiplicative margin over a baseline that excludes the newest sample.
    pub fn confirmation(multiplier: f32) -> Self {
        Self::new(ThresholdMargin::Multiplicative { multiplier }, None)
    }
}

/// Snapshot produced for every observed energy sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandReading {
    pub energy: f32,
    pub baseline: f32,
    pub level: f32,
    pub active: bool,
}

/// Bounded rolling energy history for one band.
#[derive(Debug, Clone)]
pub struct BandEnergyTracker {
    history: VecDeque<f32>,
    capacity: usize,
    policy: TrackerPolicy,
}

impl BandEnergyTracker {
    pub fn new(capacity: usize, policy: TrackerPolicy) -> Result<Self> {
        if capacity < WARM_UP_SAMPLES {
            return Err(BeatSyncError::config(format!(
                "history size must be at least {WARM_UP_SAMPLES}, got {capacity}"
            )));
        }
        policy.margin.validate()?;

        let mut tracker = Self {
            history: VecDeque::new(),
            capacity,
            policy,
        };
        tracker.history.reserve_exact(tracker.history_limit());
        Ok(tracker)
    }

    /// Samples kept so the baseline always averages `capacity` values. An
    /// exclude-current window needs one extra slot for the newest sample.
    fn history_limit(&self) -> usize {
        match self.policy.window {
            BaselineWindow::IncludeCurrent => self.capacity,
            BaselineWindow::ExcludeCurrent => self.capacity + 1,
        }
    }

    /// Records `energy`, evicting the oldest sample when full, and reports
    /// whether the band is active. Never active during warm-up.
    pub fn observe(&mut self, energy: f32) -> BandReading {
        if self.history.len() >= self.history_limit() {
            self.history.pop_front();
        }
        self.history.push_back(energy);

        let baseline = self.baseline();
        let level = self.policy.margin.level(baseline);
        let active = self.is_warm() && energy > level;

        BandReading {
            energy,
            baseline,
            level,
            active,
        }
    }

    /// Mean of the history, honouring the configured baseline window.
    pub fn baseline(&self) -> f32 {
        let considered = match self.policy.window {
            BaselineWindow::IncludeCurrent => self.history.len(),
            BaselineWindow::ExcludeCurrent => self.history.len().saturating_sub(1),
        };
        if considered == 0 {
            return 0.0;
        }

        self.history.iter().take(considered).sum::<f32>() / considered as f32
    }

    /// Most recent energy sample.
    pub fn current(&self) -> Option<f32> {
        self.history.back().copied()
    }

    pub fn is_warm(&self) -> bool {
        self.history.len() >= WARM_UP_SAMPLES
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> TrackerPolicy {
        self.policy
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
