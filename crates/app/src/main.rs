use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use beatsync_core::{
    actuation::ActuationRuntime, AppConfig, AudioSource, BeatDispatcher, BeatSyncEngine,
    BeatTimeline, ChoreographyListener, ClickTrackSource, DetectionMode,
    LogListener, MovementExecutor, PlaybackClock, PollingSource, SimulatedExecutor,
    TelloExecutor,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cpal")]
mod capture;

fn main() -> beatsync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            bpm,
            seconds,
            common,
        } => run_simulate(bpm, seconds, &common),
        Commands::Live { seconds, common } => run_live(seconds, &common),
        Commands::Replay {
            beats,
            config,
            tello,
        } => run_replay(&beats, config.as_deref(), tello),
        Commands::Config { preset } => print_preset(preset),
    }
}

fn run_simulate(bpm: f32, seconds: u64, common: &RunArgs) -> beatsync_core::Result<()> {
    let config = common.load_config()?;
    tracing::info!(bpm, seconds, "starting simulation");

    let source = ClickTrackSource::new(config.audio.sample_rate, config.audio.chunk_size, bpm)
        .realtime(true);
    perform(config, Box::new(PollingSource::new(source)), seconds, common)
}

#[cfg(feature = "cpal")]
fn run_live(seconds: u64, common: &RunArgs) -> beatsync_core::Result<()> {
    let config = common.load_config()?;
    tracing::info!(seconds, "starting live detection");

    let source = capture::CpalSource::new(config.audio.sample_rate, config.audio.chunk_size);
    perform(config, Box::new(source), seconds, common)
}

#[cfg(not(feature = "cpal"))]
fn run_live(_seconds: u64, _common: &RunArgs) -> beatsync_core::Result<()> {
    Err(beatsync_core::BeatSyncError::Device(
        "live capture needs a build with the `cpal` feature".to_string(),
    ))
}

fn perform(
    config: AppConfig,
    source: Box<dyn AudioSource>,
    seconds: u64,
    common: &RunArgs,
) -> beatsync_core::Result<()> {
    let mut engine = BeatSyncEngine::new(config, source)?.with_executor(executor(common.tello)?)?;
    engine.add_beat_listener(LogListener::new().with_bell(common.bell))?;

    engine.start()?;
    thread::sleep(Duration::from_secs(seconds));
    engine.stop();

    let stats = engine.stats();
    tracing::info!(
        pushed = stats.pipeline.pushed,
        dropped = stats.pipeline.dropped,
        frames = stats.classifier.frames,
        beats = stats.classifier.beats,
        debounced = stats.classifier.debounced,
        listener_failures = stats.dispatch.failed,
        "detection summary"
    );
    if let Some(actuation) = stats.actuation {
        tracing::info!(
            executed = actuation.executed,
            dropped = actuation.dropped,
            failed = actuation.failed,
            "actuation summary"
        );
    }
    Ok(())
}

fn run_replay(beats: &Path, config: Option<&Path>, tello: bool) -> beatsync_core::Result<()> {
    let config = match config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    let mut timeline = BeatTimeline::from_json_file(beats)?;
    tracing::info!(?beats, count = timeline.len(), duration = ?timeline.duration(), "replaying beats");

    let mut actuation = ActuationRuntime::new(&config.actuation, executor(tello)?)?;
    let mut dispatcher = BeatDispatcher::with_debounce(config.detector.min_beat_interval());
    dispatcher.add_beat_listener(LogListener::new());
    dispatcher.add_beat_listener(ChoreographyListener::new(
        config.choreography.clone(),
        actuation.sender(),
    ));

    actuation.start()?;
    let clock = PlaybackClock::new();
    while let Some(wait) = timeline.until_next(&clock) {
        thread::sleep(wait.min(Duration::from_millis(50)));
        for event in timeline.tick(&clock) {
            dispatcher.dispatch(&event);
        }
    }

    actuation.wait_idle(config.actuation.min_command_interval() * 2);
    actuation.stop(config.lifecycle.join_timeout());

    let stats = actuation.stats();
    tracing::info!(
        dispatched = dispatcher.totals().events,
        debounced = dispatcher.totals().suppressed,
        executed = stats.executed,
        dropped = stats.dropped,
        failed = stats.failed,
        "replay finished"
    );
    Ok(())
}

fn print_preset(preset: Preset) -> beatsync_core::Result<()> {
    let config = match preset {
        Preset::Drums => AppConfig::drum_defaults(),
        Preset::MultiBand => AppConfig::multi_band_defaults(),
    };
    println!("{}", config.to_json_pretty()?);
    Ok(())
}

fn executor(tello: bool) -> beatsync_core::Result<Box<dyn MovementExecutor>> {
    if tello {
        Ok(Box::new(TelloExecutor::with_default_address()?))
    } else {
        Ok(Box::new(SimulatedExecutor::new()))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronised drone choreography", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect beats in a synthetic click track.
    Simulate {
        /// Tempo of the click track.
        #[arg(long, default_value_t = 120.0)]
        bpm: f32,
        /// How long to run before landing.
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[command(flatten)]
        common: RunArgs,
    },
    /// Detect beats from the default microphone.
    Live {
        #[arg(long, default_value_t = 60)]
        seconds: u64,
        #[command(flatten)]
        common: RunArgs,
    },
    /// Replay beat timestamps extracted offline (a JSON array of seconds).
    Replay {
        beats: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Fly a Tello drone instead of the simulator.
        #[arg(long)]
        tello: bool,
    },
    /// Print a preset configuration as JSON.
    Config {
        #[arg(long, value_enum, default_value_t = Preset::Drums)]
        preset: Preset,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON configuration file; defaults to the preset for `--mode`.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Detection mode; overrides the one in the configuration file.
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    /// Fly a Tello drone instead of the simulator.
    #[arg(long)]
    tello: bool,
    /// Ring the terminal bell on every beat.
    #[arg(long)]
    bell: bool,
}

impl RunArgs {
    fn load_config(&self) -> beatsync_core::Result<AppConfig> {
        let mut config = match (&self.config, self.mode) {
            (Some(path), _) => AppConfig::from_json_file(path)?,
            (None, Some(Mode::MultiBand)) => AppConfig::multi_band_defaults(),
            (None, _) => AppConfig::drum_defaults(),
        };
        if let Some(mode) = self.mode {
            config.detector.mode = mode.into();
        }
        Ok(config)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// First active band above its floor decides the beat.
    Single,
    /// A quorum of active bands confirms the beat.
    MultiBand,
}

impl From<Mode> for DetectionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Single => DetectionMode::SingleDominant,
            Mode::MultiBand => DetectionMode::MultiBandQuorum,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Preset {
    Drums,
    MultiBand,
}
