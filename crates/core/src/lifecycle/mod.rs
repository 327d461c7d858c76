//! Start/stop state machine owning the audio source, the analysis thread and
//! the actuation worker.
//!
//! `Idle -> Starting -> Running -> Stopping -> Idle`. A failed start tears
//! down whatever was already running and returns to `Idle`.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::{
    actuation::{ActuationRuntime, ActuationStats, MovementExecutor},
    analysis::{BeatClassifier, ClassifierStats},
    audio::AudioSource,
    config::AppConfig,
    dispatch::{BeatDispatcher, BeatListener, DispatchTotals},
    mapping::ChoreographyListener,
    pipeline::{FrameConsumer, IngestionPipeline, PipelineStats, PopOutcome},
    BeatSyncError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Counters from every stage, taken at one point in time. Pipeline and
/// classifier counters cover the current (or last) run; dispatch and
/// actuation counters cover the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub pipeline: PipelineStats,
    pub classifier: ClassifierStats,
    pub dispatch: DispatchTotals,
    pub actuation: Option<ActuationStats>,
}

/// Waits up to `timeout` for `handle` to finish. A thread that overruns is
/// detached and `None` is returned.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration, name: &str) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, ?timeout, "thread did not stop in time, detaching");
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }

    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(thread = name, "thread panicked");
            None
        }
    }
}

/// Real-time beat detection engine.
pub struct BeatSyncEngine {
    config: AppConfig,
    state: LifecycleState,
    source: Box<dyn AudioSource>,
    pipeline: IngestionPipeline,
    dispatcher: Arc<Mutex<BeatDispatcher>>,
    /// Published by the analysis thread so reading stats never waits on a
    /// listener.
    dispatch_totals: Arc<Mutex<DispatchTotals>>,
    classifier_stats: Arc<Mutex<ClassifierStats>>,
    actuation: Option<ActuationRuntime>,
    /// Replaced on every start; a detached analysis thread keeps the
    /// cleared flag of its own run.
    running: Arc<AtomicBool>,
    consumer: Option<JoinHandle<()>>,
}

impl BeatSyncEngine {
    /// Validates `config` and prepares an idle engine around `source`.
    pub fn new(config: AppConfig, source: Box<dyn AudioSource>) -> Result<Self> {
        config.validate()?;
        let pipeline = IngestionPipeline::from_config(&config.audio)?;

        Ok(Self {
            config,
            state: LifecycleState::Idle,
            source,
            pipeline,
            dispatcher: Arc::new(Mutex::new(BeatDispatcher::new())),
            dispatch_totals: Arc::new(Mutex::new(DispatchTotals::default())),
            classifier_stats: Arc::new(Mutex::new(ClassifierStats::default())),
            actuation: None,
            running: Arc::new(AtomicBool::new(false)),
            consumer: None,
        })
    }

    /// Drives `executor` from detected beats through the configured
    /// choreography and the actuation queue.
    pub fn with_executor(mut self, executor: impl MovementExecutor + 'static) -> Result<Self> {
        let runtime = ActuationRuntime::new(&self.config.actuation, executor)?;
        let listener =
            ChoreographyListener::new(self.config.choreography.clone(), runtime.sender());
        self.add_beat_listener(listener)?;
        self.actuation = Some(runtime);
        Ok(self)
    }

    pub fn add_beat_listener(&mut self, listener: impl BeatListener + 'static) -> Result<()> {
        self.lock_dispatcher()?.add_beat_listener(listener);
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            pipeline: self.pipeline.stats(),
            classifier: self
                .classifier_stats
                .lock()
                .map(|stats| *stats)
                .unwrap_or_default(),
            dispatch: self
                .dispatch_totals
                .lock()
                .map(|totals| *totals)
                .unwrap_or_default(),
            actuation: self.actuation.as_ref().map(ActuationRuntime::stats),
        }
    }

    /// Opens the audio stream and starts processing. No-op while running.
    pub fn start(&mut self) -> Result<()> {
        if self.state == LifecycleState::Running {
            debug!("start ignored, engine already running");
            return Ok(());
        }

        self.state = LifecycleState::Starting;
        info!(source = self.source.name(), "engine starting");

        match self.open() {
            Ok(()) => {
                self.state = LifecycleState::Running;
                info!(
                    mode = ?self.config.detector.mode,
                    bands = self.config.detector.bands.len(),
                    "engine running"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "engine failed to start");
                self.teardown();
                self.state = LifecycleState::Idle;
                Err(err)
            }
        }
    }

    /// Stops the source and waits a bounded time for the worker threads.
    /// No-op while idle.
    pub fn stop(&mut self) {
        if self.state == LifecycleState::Idle {
            return;
        }

        self.state = LifecycleState::Stopping;
        info!("engine stopping");
        self.teardown();
        self.state = LifecycleState::Idle;

        let stats = self.stats();
        info!(
            frames = stats.classifier.frames,
            beats = stats.classifier.beats,
            dropped_frames = stats.pipeline.dropped,
            "engine stopped"
        );
    }

    fn open(&mut self) -> Result<()> {
        // Fresh classifier per run: history and debounce start over.
        let classifier =
            BeatClassifier::new(&self.config.detector, self.config.audio.sample_rate)?;
        // Fresh channel too, so a thread detached by an earlier stop can
        // never pop frames of this run.
        self.pipeline = IngestionPipeline::from_config(&self.config.audio)?;
        self.classifier_stats = Arc::new(Mutex::new(ClassifierStats::default()));
        self.lock_dispatcher()?.reset();

        self.running = Arc::new(AtomicBool::new(true));
        let worker = AnalysisWorker {
            consumer: self.pipeline.consumer(),
            classifier,
            dispatcher: self.dispatcher.clone(),
            dispatch_totals: self.dispatch_totals.clone(),
            stats: self.classifier_stats.clone(),
            running: self.running.clone(),
        };
        let handle = thread::Builder::new()
            .name("beat-analysis".to_string())
            .spawn(move || worker.run())?;
        self.consumer = Some(handle);

        if let Some(actuation) = self.actuation.as_mut() {
            actuation.start()?;
        }

        self.source.start(self.pipeline.producer())
    }

    fn teardown(&mut self) {
        let timeout = self.config.lifecycle.join_timeout();
        self.running.store(false, Ordering::SeqCst);
        self.source.stop();

        if let Some(handle) = self.consumer.take() {
            join_with_timeout(handle, timeout, "beat-analysis");
        }
        if let Some(actuation) = self.actuation.as_mut() {
            actuation.stop(timeout);
        }

        let discarded = self.pipeline.drain();
        if discarded > 0 {
            debug!(discarded, "pending frames discarded");
        }
    }

    fn lock_dispatcher(&self) -> Result<std::sync::MutexGuard<'_, BeatDispatcher>> {
        self.dispatcher
            .lock()
            .map_err(|_| BeatSyncError::InvalidState("beat dispatcher lock poisoned".into()))
    }
}

impl fmt::Debug for BeatSyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatSyncEngine")
            .field("state", &self.state)
            .field("source", &self.source.name())
            .field("pipeline", &self.pipeline)
            .field("actuation", &self.actuation)
            .finish()
    }
}

impl Drop for BeatSyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the analysis thread. Only the dispatcher is shared.
struct AnalysisWorker {
    consumer: FrameConsumer,
    classifier: BeatClassifier,
    dispatcher: Arc<Mutex<BeatDispatcher>>,
    dispatch_totals: Arc<Mutex<DispatchTotals>>,
    stats: Arc<Mutex<ClassifierStats>>,
    running: Arc<AtomicBool>,
}

impl AnalysisWorker {
    fn run(mut self) {
        info!("analysis thread started");
        while self.running.load(Ordering::SeqCst) {
            let frame = match self.consumer.pop() {
                PopOutcome::Frame(frame) => frame,
                PopOutcome::Timeout => continue,
                PopOutcome::Closed => break,
            };
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let classification = self.classifier.classify(&frame);
            if let Ok(mut stats) = self.stats.lock() {
                *stats = self.classifier.stats();
            }

            let Some(event) = classification.event else {
                continue;
            };
            match self.dispatcher.lock() {
                Ok(mut dispatcher) => {
                    let report = dispatcher.dispatch(&event);
                    if let Ok(mut totals) = self.dispatch_totals.lock() {
                        *totals = dispatcher.totals();
                    }
                    debug!(
                        sequence = event.sequence,
                        delivered = report.delivered,
                        failed = report.failed,
                        "beat dispatched"
                    );
                }
                Err(_) => {
                    error!("beat dispatcher lock poisoned, analysis stopping");
                    break;
                }
            }
        }
        info!("analysis thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        actuation::Movement,
        analysis::{DetectionMode, FilterDesign},
        audio::{ClickTrackSource, PollingSource},
        config::BandConfig,
        mapping::Choreography,
        AudioFrame, BeatEvent, FrameProducer,
    };

    struct Unplugged;

    impl AudioSource for Unplugged {
        fn name(&self) -> &str {
            "unplugged"
        }

        fn start(&mut self, _producer: FrameProducer) -> Result<()> {
            Err(BeatSyncError::Device("no input device".into()))
        }

        fn stop(&mut self) {}
    }

    struct Recording {
        moves: Arc<Mutex<Vec<Movement>>>,
    }

    impl MovementExecutor for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn execute(&mut self, movement: &Movement) -> Result<()> {
            self.moves.lock().unwrap().push(*movement);
            Ok(())
        }
    }

    /// Source whose frames are pushed by the test itself.
    #[derive(Default)]
    struct ManualSource {
        producer: Arc<Mutex<Option<FrameProducer>>>,
    }

    impl AudioSource for ManualSource {
        fn name(&self) -> &str {
            "manual"
        }

        fn start(&mut self, producer: FrameProducer) -> Result<()> {
            *self.producer.lock().unwrap() = Some(producer);
            Ok(())
        }

        fn stop(&mut self) {
            self.producer.lock().unwrap().take();
        }
    }

    /// Quiet, quiet, then a loud 75 Hz frame.
    fn push_beat(producer: &Mutex<Option<FrameProducer>>) {
        let loud: Vec<f32> = (0..400)
            .map(|n| 0.8 * (2.0 * std::f32::consts::PI * 75.0 * n as f32 / 8_000.0).sin())
            .collect();
        let frames = [vec![0.0; 400], vec![0.0; 400], loud];
        if let Some(producer) = producer.lock().unwrap().as_ref() {
            for samples in frames {
                producer.push(AudioFrame::new(samples, 8_000, Instant::now()));
            }
        }
    }

    fn click_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 8_000;
        config.audio.chunk_size = 400;
        config.audio.queue_capacity = 64;
        config.audio.pop_timeout_ms = 20;
        config.detector.mode = DetectionMode::SingleDominant;
        config.detector.filter = FilterDesign::Butterworth;
        config.detector.bands = vec![BandConfig::drum("kick", 50.0, 100.0, 0.05, 0.05)];
        config.actuation.min_command_interval_ms = 0;
        config.actuation.poll_interval_ms = 5;
        config.choreography = Choreography::default().bind("kick", Movement::Up { cm: 20 });
        config
    }

    fn click_source(frames: u64) -> Box<dyn AudioSource> {
        // 120 bpm at 8 kHz with 400-sample frames: one click every ten frames.
        Box::new(PollingSource::new(
            ClickTrackSource::new(8_000, 400, 120.0)
                .with_pattern(vec![vec![75.0]])
                .with_click_length(Duration::from_millis(100))
                .limit_frames(frames),
        ))
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn device_failure_returns_to_idle() {
        let mut engine = BeatSyncEngine::new(click_config(), Box::new(Unplugged)).unwrap();
        let err = engine.start().unwrap_err();

        assert!(matches!(err, BeatSyncError::Device(_)));
        assert!(err.is_fatal());
        assert_eq!(engine.state(), LifecycleState::Idle);
        assert!(engine.consumer.is_none());
        assert!(!engine.running.load(Ordering::SeqCst));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = click_config();
        config.detector.bands[0].high_hz = 5_000.0;
        let err = BeatSyncEngine::new(config, click_source(1)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn start_is_reentrant_and_stop_is_idempotent() {
        let mut engine = BeatSyncEngine::new(click_config(), click_source(5)).unwrap();
        engine.stop();
        assert_eq!(engine.state(), LifecycleState::Idle);

        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());

        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), LifecycleState::Idle);
    }

    #[test]
    fn click_track_drives_listeners_and_executor() {
        let moves = Arc::new(Mutex::new(Vec::new()));
        let mut engine = BeatSyncEngine::new(click_config(), click_source(40))
            .unwrap()
            .with_executor(Recording {
                moves: moves.clone(),
            })
            .unwrap();

        let tags = Arc::new(Mutex::new(Vec::new()));
        let sink = tags.clone();
        engine
            .add_beat_listener(move |event: &BeatEvent| -> Result<()> {
                sink.lock().unwrap().push(event.band_tag.clone());
                Ok(())
            })
            .unwrap();

        engine.start().unwrap();
        wait_for(|| engine.stats().classifier.frames == 40);
        wait_for(|| !moves.lock().unwrap().is_empty());
        engine.stop();

        let stats = engine.stats();
        assert_eq!(stats.pipeline.dropped, 0);
        assert!(stats.classifier.beats >= 1);
        assert_eq!(stats.dispatch.failed, 0);

        let tags = tags.lock().unwrap();
        assert!(!tags.is_empty());
        assert!(tags.iter().all(|tag| tag.as_deref() == Some("kick")));
        assert!(moves
            .lock()
            .unwrap()
            .iter()
            .all(|movement| *movement == Movement::Up { cm: 20 }));
    }

    #[test]
    fn join_with_timeout_detaches_slow_threads() {
        let slow = thread::spawn(|| thread::sleep(Duration::from_millis(500)));
        let started = Instant::now();
        assert!(join_with_timeout(slow, Duration::from_millis(20), "slow").is_none());
        assert!(started.elapsed() < Duration::from_millis(400));

        let quick = thread::spawn(|| 7);
        assert_eq!(join_with_timeout(quick, Duration::from_secs(1), "quick"), Some(7));
    }

    #[test]
    fn restart_after_detached_analysis_uses_one_consumer() {
        let mut config = click_config();
        config.audio.queue_capacity = 256;
        config.detector.min_beat_interval_ms = 0;
        config.lifecycle.join_timeout_ms = 30;

        let source = ManualSource::default();
        let producer = source.producer.clone();
        let mut engine = BeatSyncEngine::new(config, Box::new(source)).unwrap();

        let callers = Arc::new(Mutex::new(Vec::new()));
        let sink = callers.clone();
        engine
            .add_beat_listener(move |_event: &BeatEvent| -> Result<()> {
                let first = {
                    let mut callers = sink.lock().unwrap();
                    callers.push(thread::current().id());
                    callers.len() == 1
                };
                if first {
                    thread::sleep(Duration::from_millis(300));
                }
                Ok(())
            })
            .unwrap();

        engine.start().unwrap();
        wait_for(|| {
            push_beat(&producer);
            thread::sleep(Duration::from_millis(10));
            !callers.lock().unwrap().is_empty()
        });
        let started = Instant::now();
        engine.stop();
        assert!(started.elapsed() < Duration::from_millis(250));

        engine.start().unwrap();
        let restarted_at = callers.lock().unwrap().len();
        for _ in 0..20 {
            push_beat(&producer);
        }
        wait_for(|| engine.stats().classifier.frames == 60);
        engine.stop();

        let callers = callers.lock().unwrap();
        let after_restart = &callers[restarted_at..];
        assert!(!after_restart.is_empty());
        assert!(after_restart.iter().all(|id| *id == after_restart[0]));
        assert_ne!(after_restart[0], callers[0]);
        assert_eq!(engine.stats().pipeline.pushed, 60);
    }
}
