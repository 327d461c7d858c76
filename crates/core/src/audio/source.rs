use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, info, warn};

use super::AudioFrame;
use crate::{pipeline::PushOutcome, BeatSyncError, FrameProducer, Result};

/// Push-style audio source. The source owns its callback context and hands
/// every completed frame to the producer, which never blocks.
pub trait AudioSource: Send {
    fn name(&self) -> &str;

    /// Acquires the device and opens the stream. Fails with
    /// [`BeatSyncError::Device`] when no usable input exists.
    fn start(&mut self, producer: FrameProducer) -> Result<()>;

    /// Closes the stream. Calling it on a stopped source is a no-op.
    fn stop(&mut self);
}

/// Pull-style audio source. `read_frame` may block for up to one frame
/// period; `Ok(None)` marks the end of the stream.
pub trait PullSource: Send {
    fn name(&self) -> &str {
        "pull source"
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>>;
}

/// Adapts a [`PullSource`] into an [`AudioSource`] by running a reader thread
/// that forwards frames to the producer.
#[derive(Debug)]
pub struct PollingSource<P: PullSource + 'static> {
    name: String,
    source: Option<P>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<P>>,
}

impl<P: PullSource + 'static> PollingSource<P> {
    pub fn new(source: P) -> Self {
        Self {
            name: source.name().to_string(),
            source: Some(source),
            running: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    /// Returns the wrapped source while the reader is not running.
    pub fn inner(&self) -> Option<&P> {
        self.source.as_ref()
    }
}

impl<P: PullSource + 'static> AudioSource for PollingSource<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, producer: FrameProducer) -> Result<()> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| BeatSyncError::Device(format!("{} is already streaming", self.name)))?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let name = self.name.clone();

        let spawned = thread::Builder::new()
            .name("audio-reader".to_string())
            .spawn(move || {
                info!(source = %name, "audio reader started");
                while running.load(Ordering::SeqCst) {
                    match source.read_frame() {
                        Ok(Some(frame)) => {
                            if producer.push(frame) == PushOutcome::Closed {
                                debug!(source = %name, "pipeline closed");
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(source = %name, "end of stream");
                            break;
                        }
                        Err(err) => {
                            warn!(source = %name, error = %err, "audio read failed");
                            break;
                        }
                    }
                }
                info!(source = %name, "audio reader stopped");
                source
            });

        match spawned {
            Ok(handle) => {
                self.reader = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(BeatSyncError::Device(format!(
                    "failed to spawn audio reader: {err}"
                )))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            match handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => warn!(source = %self.name, "audio reader panicked"),
            }
        }
    }
}

impl<P: PullSource + 'static> Drop for PollingSource<P> {
    fn drop(&mut self) {
        self.stop();
    }
}
