//! Beat analysis: per-band filtering, rolling energy baselines and the beat
//! decision itself. Everything here runs on the consumer thread only.

mod classifier;
mod filter;
mod tracker;

pub use classifier::{BeatClassifier, BeatEvent, Classification, ClassifierStats, DetectionMode};
pub use filter::{BandpassFilter, EnergyMeasure, FilterDesign, FrequencyBand, SpectralBands};
pub use tracker::{
    BandEnergyTracker, BandReading, BaselineWindow, ThresholdMargin, TrackerPolicy,
    WARM_UP_SAMPLES,
};
