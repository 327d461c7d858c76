use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{BeatEvent, Result};

/// Wall clock anchored at the start of playback.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    origin: Instant,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn starting_at(origin: Instant) -> Self {
        Self { origin }
    }

    pub fn reset(&mut self) {
        self.origin = Instant::now();
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Instant at which `offset` into playback is reached.
    pub fn at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }
}

/// Ordered beat timestamps produced by offline extraction, replayed against
/// a [`PlaybackClock`].
#[derive(Debug, Clone, Default)]
pub struct BeatTimeline {
    beats: Vec<Duration>,
    next: usize,
}

impl BeatTimeline {
    /// Builds a timeline from offsets in seconds. Negative and non-finite
    /// values are discarded; the rest are sorted.
    pub fn from_timestamps(seconds: impl IntoIterator<Item = f64>) -> Self {
        let mut discarded = 0usize;
        let mut beats: Vec<Duration> = seconds
            .into_iter()
            .filter_map(|value| {
                if value.is_finite() && value >= 0.0 {
                    Some(Duration::from_secs_f64(value))
                } else {
                    discarded += 1;
                    None
                }
            })
            .collect();
        beats.sort_unstable();

        if discarded > 0 {
            warn!(discarded, "ignored invalid beat timestamps");
        }
        Self { beats, next: 0 }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let seconds: Vec<f64> = serde_json::from_str(text)?;
        Ok(Self::from_timestamps(seconds))
    }

    /// Loads a JSON array of beat offsets in seconds.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let timeline = Self::from_json_str(&text)?;
        debug!(path = %path.as_ref().display(), beats = timeline.len(), "beat timeline loaded");
        Ok(timeline)
    }

    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.beats.len() - self.next
    }

    pub fn is_finished(&self) -> bool {
        self.next >= self.beats.len()
    }

    /// Offset of the last beat, zero for an empty timeline.
    pub fn duration(&self) -> Duration {
        self.beats.last().copied().unwrap_or_default()
    }

    /// Time until the next pending beat, `None` once finished.
    pub fn until_next(&self, clock: &PlaybackClock) -> Option<Duration> {
        self.beats
            .get(self.next)
            .map(|offset| offset.saturating_sub(clock.elapsed()))
    }

    pub fn rewind(&mut self) {
        self.next = 0;
    }

    pub fn tick(&mut self, clock: &PlaybackClock) -> Vec<BeatEvent> {
        self.tick_at(clock, clock.elapsed())
    }

    /// Returns every beat due at or before `elapsed`, oldest first.
    pub fn tick_at(&mut self, clock: &PlaybackClock, elapsed: Duration) -> Vec<BeatEvent> {
        let mut due = Vec::new();
        while let Some(&offset) = self.beats.get(self.next) {
            if offset > elapsed {
                break;
            }
            due.push(BeatEvent::undifferentiated(clock.at(offset), self.next as u64));
            self.next += 1;
        }
        due
    }
}
