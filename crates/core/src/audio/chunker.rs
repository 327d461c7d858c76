use std::time::{Duration, Instant};

use super::AudioFrame;

/// Regroups arbitrary-length callback buffers into fixed-size frames.
///
/// Audio callbacks rarely deliver exactly one chunk. The chunker keeps the
/// remainder between calls and stamps every emitted frame with the capture
/// time of its first sample.
#[derive(Debug)]
pub struct FrameChunker {
    chunk_size: usize,
    sample_rate: u32,
    buffer: Vec<f32>,
    buffer_started: Option<Instant>,
}

impl FrameChunker {
    pub fn new(chunk_size: usize, sample_rate: u32) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            sample_rate,
            buffer: Vec::with_capacity(chunk_size * 2),
            buffer_started: None,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Samples waiting for the next full frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `samples`, captured at `captured_at`, and calls `emit` once
    /// per completed frame.
    pub fn push(&mut self, samples: &[f32], captured_at: Instant, mut emit: impl FnMut(AudioFrame)) {
        if self.buffer.is_empty() {
            self.buffer_started = Some(captured_at);
        }
        self.buffer.extend_from_slice(samples);

        while self.buffer.len() >= self.chunk_size {
            let started = self.buffer_started.unwrap_or(captured_at);
            let frame: Vec<f32> = self.buffer.drain(..self.chunk_size).collect();
            emit(AudioFrame::new(frame, self.sample_rate, started));
            self.buffer_started = Some(started + self.chunk_duration());
        }
    }

    /// Drops any partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffer_started = None;
    }

    fn chunk_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.chunk_size as f64 / self.sample_rate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_fixed_frames_and_keeps_remainder() {
        let mut chunker = FrameChunker::new(4, 8);
        let start = Instant::now();
        let mut frames = Vec::new();

        chunker.push(&[1.0, 2.0, 3.0], start, |f| frames.push(f));
        assert!(frames.is_empty());
        assert_eq!(chunker.pending(), 3);

        chunker.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], start, |f| frames.push(f));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(frames[1].samples(), &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(chunker.pending(), 1);

        // 4 samples at 8 Hz is half a second.
        assert_eq!(
            frames[1].captured_at() - frames[0].captured_at(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut chunker = FrameChunker::new(4, 8);
        chunker.push(&[1.0, 2.0], Instant::now(), |_| panic!("no frame expected"));
        chunker.reset();
        assert_eq!(chunker.pending(), 0);
    }
}
