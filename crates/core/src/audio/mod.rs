//! Audio frames and the seams through which external audio sources feed the
//! ingestion pipeline.

mod chunker;
mod source;
mod synthetic;

use std::time::{Duration, Instant};

pub use chunker::FrameChunker;
pub use source::{AudioSource, PollingSource, PullSource};
pub use synthetic::ClickTrackSource;

/// Fixed-length block of mono samples. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
    captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, captured_at: Instant) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Monotonic capture timestamp of the first sample.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Wall time covered by the frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_duration_from_sample_rate() {
        let frame = AudioFrame::new(vec![0.0; 4_410], 44_100, Instant::now());
        assert_eq!(frame.len(), 4_410);
        assert!((frame.duration().as_secs_f64() - 0.1).abs() < 1e-9);

        let degenerate = AudioFrame::new(vec![0.0; 8], 0, Instant::now());
        assert_eq!(degenerate.duration(), Duration::ZERO);
    }
}
