//! Core library for the beat sync engine.
//!
//! Audio frames flow from an [`AudioSource`] through the bounded
//! [`IngestionPipeline`] into the analysis thread, where the
//! [`BeatClassifier`] turns per-band energy into [`BeatEvent`]s. The
//! [`BeatDispatcher`] fans each event out to listeners, one of which maps it
//! to a movement on the rate-limited actuation queue. [`BeatSyncEngine`]
//! owns the whole chain and its start/stop lifecycle.

pub mod actuation;
pub mod analysis;
pub mod audio;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod mapping;
pub mod pipeline;
pub mod timeline;

pub use actuation::{
    ActuationQueue, ActuationRuntime, ActuationStats, Command, CommandSender, Movement,
    MovementExecutor, SimulatedExecutor, TelloExecutor,
};
pub use analysis::{BeatClassifier, BeatEvent, ClassifierStats, DetectionMode};
pub use audio::{AudioFrame, AudioSource, ClickTrackSource, FrameChunker, PollingSource, PullSource};
pub use config::{AppConfig, AudioConfig, DetectorConfig};
pub use dispatch::{BeatDispatcher, BeatListener, LogListener};
pub use error::{BeatSyncError, Result};
pub use lifecycle::{BeatSyncEngine, EngineStats, LifecycleState};
pub use mapping::{Choreography, ChoreographyListener};
pub use pipeline::{FrameConsumer, FrameProducer, IngestionPipeline, PipelineStats};
pub use timeline::{BeatTimeline, PlaybackClock};
