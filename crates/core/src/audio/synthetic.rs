use std::{
    f64::consts::TAU,
    time::{Duration, Instant},
};

use super::{AudioFrame, PullSource};
use crate::Result;

/// Deterministic metronome made of decaying tone bursts.
///
/// Each beat plays the tones of the next pattern step, so a pattern such as
/// `[[75.0], [200.0]]` alternates a kick-like and a snare-like hit. In
/// realtime mode `read_frame` paces itself like a capture device would.
#[derive(Debug, Clone)]
pub struct ClickTrackSource {
    sample_rate: u32,
    chunk_size: usize,
    bpm: f32,
    click: Duration,
    amplitude: f32,
    pattern: Vec<Vec<f32>>,
    realtime: bool,
    max_frames: Option<u64>,
    position: u64,
    frames_emitted: u64,
    origin: Option<Instant>,
}

impl ClickTrackSource {
    pub fn new(sample_rate: u32, chunk_size: usize, bpm: f32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            chunk_size: chunk_size.max(1),
            bpm: if bpm.is_finite() && bpm > 0.0 { bpm } else { 120.0 },
            click: Duration::from_millis(80),
            amplitude: 0.8,
            pattern: vec![vec![75.0], vec![200.0], vec![75.0], vec![200.0, 7_000.0]],
            realtime: false,
            max_frames: None,
            position: 0,
            frames_emitted: 0,
            origin: None,
        }
    }

    /// Tone frequencies per beat, cycled in order. Empty steps are rests.
    pub fn with_pattern(mut self, pattern: Vec<Vec<f32>>) -> Self {
        if !pattern.is_empty() {
            self.pattern = pattern;
        }
        self
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn with_click_length(mut self, click: Duration) -> Self {
        self.click = click;
        self
    }

    /// Stops the stream after `frames` frames.
    pub fn limit_frames(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn beat_period(&self) -> Duration {
        Duration::from_secs_f64(60.0 / self.bpm as f64)
    }

    fn offset_of(&self, samples: u64) -> Duration {
        Duration::from_secs_f64(samples as f64 / self.sample_rate as f64)
    }

    fn render(&self, start: u64) -> Vec<f32> {
        let rate = self.sample_rate as f64;
        let period = rate * 60.0 / self.bpm as f64;
        let click_len = (self.click.as_secs_f64() * rate).max(1.0);

        (start..start + self.chunk_size as u64)
            .map(|n| {
                let beat = (n as f64 / period).floor();
                let offset = n as f64 - beat * period;
                if offset >= click_len {
                    return 0.0;
                }

                let tones = &self.pattern[beat as usize % self.pattern.len()];
                if tones.is_empty() {
                    return 0.0;
                }

                let envelope = (1.0 - offset / click_len).powi(2);
                let t = offset / rate;
                let sum: f64 = tones.iter().map(|&hz| (TAU * hz as f64 * t).sin()).sum();
                (self.amplitude as f64 * envelope * sum / tones.len() as f64) as f32
            })
            .collect()
    }
}

impl PullSource for ClickTrackSource {
    fn name(&self) -> &str {
        "click-track"
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>> {
        if self
            .max_frames
            .map(|max| self.frames_emitted >= max)
            .unwrap_or(false)
        {
            return Ok(None);
        }

        let origin = *self.origin.get_or_insert_with(Instant::now);
        let captured_at = origin + self.offset_of(self.position);

        if self.realtime {
            let complete_at = origin + self.offset_of(self.position + self.chunk_size as u64);
            let now = Instant::now();
            if complete_at > now {
                std::thread::sleep(complete_at - now);
            }
        }

        let samples = self.render(self.position);
        self.position += self.chunk_size as u64;
        self.frames_emitted += 1;

        Ok(Some(AudioFrame::new(samples, self.sample_rate, captured_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_contiguous_fixed_size_frames() {
        let mut source = ClickTrackSource::new(8_000, 400, 120.0).limit_frames(3);
        let first = source.read_frame().unwrap().unwrap();
        let second = source.read_frame().unwrap().unwrap();
        source.read_frame().unwrap().unwrap();

        assert_eq!(first.len(), 400);
        assert_eq!(
            second.captured_at() - first.captured_at(),
            Duration::from_millis(50)
        );
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn clicks_start_on_the_beat_and_decay() {
        // 120 bpm at 8 kHz: one beat every 4000 samples.
        let mut source = ClickTrackSource::new(8_000, 4_000, 120.0)
            .with_pattern(vec![vec![100.0]])
            .with_click_length(Duration::from_millis(100));
        let frame = source.read_frame().unwrap().unwrap();
        let samples = frame.samples();

        let head: f32 = samples[..800].iter().map(|s| s.abs()).sum();
        let tail: f32 = samples[800..].iter().map(|s| s.abs()).sum();
        assert!(head > 10.0);
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn rest_steps_are_silent() {
        let mut source = ClickTrackSource::new(8_000, 4_000, 120.0)
            .with_pattern(vec![vec![100.0], vec![]]);
        source.read_frame().unwrap();
        let rest = source.read_frame().unwrap().unwrap();
        assert!(rest.samples().iter().all(|s| *s == 0.0));
    }
}
