//! Bounded frame queue between the audio callback and the analysis thread.
//!
//! The producer side never blocks: when the queue is full the incoming frame
//! is dropped and counted. The consumer waits at most one pop timeout so the
//! processing loop can observe shutdown promptly.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::trace;

use crate::{config::AudioConfig, AudioFrame, BeatSyncError, Result};

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub pushed: u64,
    pub dropped: u64,
    pub consumed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pushed: AtomicU64,
    dropped: AtomicU64,
    consumed: AtomicU64,
}

/// Result of a producer-side push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Queue full; the frame was discarded.
    Dropped,
    /// The consumer side is gone.
    Closed,
}

/// Result of a consumer-side pop.
#[derive(Debug)]
pub enum PopOutcome {
    Frame(AudioFrame),
    Timeout,
    Closed,
}

/// Owner of the bounded frame channel.
#[derive(Debug)]
pub struct IngestionPipeline {
    tx: Sender<AudioFrame>,
    rx: Receiver<AudioFrame>,
    counters: Arc<Counters>,
    capacity: usize,
    pop_timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(capacity: usize, pop_timeout: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(BeatSyncError::config("audio queue capacity must be at least 1"));
        }

        let (tx, rx) = bounded(capacity);
        Ok(Self {
            tx,
            rx,
            counters: Arc::new(Counters::default()),
            capacity,
            pop_timeout,
        })
    }

    pub fn from_config(config: &AudioConfig) -> Result<Self> {
        Self::new(config.queue_capacity, config.pop_timeout())
    }

    /// Handle for the real-time side. Cheap to clone.
    pub fn producer(&self) -> FrameProducer {
        FrameProducer {
            tx: self.tx.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Handle for the processing loop.
    pub fn consumer(&self) -> FrameConsumer {
        FrameConsumer {
            rx: self.rx.clone(),
            counters: self.counters.clone(),
            timeout: self.pop_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Discards queued frames, returning how many were removed.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            consumed: self.counters.consumed.load(Ordering::Relaxed),
        }
    }
}

/// Non-blocking producer handle, safe to call from an audio callback.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    tx: Sender<AudioFrame>,
    counters: Arc<Counters>,
}

impl FrameProducer {
    /// Enqueues `frame`, dropping it when the queue is full.
    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Accepted
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(dropped, "audio queue full, frame dropped");
                PushOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
        }
    }
}

/// Consumer handle used by the processing loop.
#[derive(Debug, Clone)]
pub struct FrameConsumer {
    rx: Receiver<AudioFrame>,
    counters: Arc<Counters>,
    timeout: Duration,
}

impl FrameConsumer {
    /// Waits up to the pop timeout for the next frame.
    pub fn pop(&self) -> PopOutcome {
        match self.rx.recv_timeout(self.timeout) {
            Ok(frame) => {
                self.counters.consumed.fetch_add(1, Ordering::Relaxed);
                PopOutcome::Frame(frame)
            }
            Err(RecvTimeoutError::Timeout) => PopOutcome::Timeout,
            Err(RecvTimeoutError::Disconnected) => PopOutcome::Closed,
        }
    }
}
