use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use beatsync_core::{AudioSource, BeatSyncError, FrameChunker, FrameProducer, Result};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use tracing::{debug, error, info, warn};

/// Microphone input through the default cpal host.
///
/// cpal streams cannot move between threads, so the stream lives on its own
/// thread for as long as the source is started.
pub struct CpalSource {
    sample_rate: u32,
    chunk_size: usize,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CpalSource {
    pub fn new(sample_rate: u32, chunk_size: usize) -> Self {
        Self {
            sample_rate,
            chunk_size,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl AudioSource for CpalSource {
    fn name(&self) -> &str {
        "microphone"
    }

    fn start(&mut self, producer: FrameProducer) -> Result<()> {
        if self.worker.is_some() {
            return Err(BeatSyncError::Device("microphone already streaming".into()));
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let running = self.running.clone();
        let sample_rate = self.sample_rate;
        let chunk_size = self.chunk_size;
        running.store(true, Ordering::SeqCst);

        let worker = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(sample_rate, chunk_size, producer) {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                while running.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
                debug!("microphone stream closed");
            })
            .map_err(|err| BeatSyncError::Device(format!("failed to spawn capture thread: {err}")))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(BeatSyncError::Device("capture thread exited".into())));
        self.worker = Some(worker);
        if ready.is_err() {
            self.stop();
        }
        ready
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream(sample_rate: u32, chunk_size: usize, producer: FrameProducer) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| BeatSyncError::Device("no input device available".into()))?;
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        "using input device"
    );

    let default = device
        .default_input_config()
        .map_err(|err| BeatSyncError::Device(format!("no default input config: {err}")))?;
    let config = StreamConfig {
        channels: default.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match default.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, chunk_size, producer)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, chunk_size, producer)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, chunk_size, producer)?,
        format => {
            return Err(BeatSyncError::Device(format!(
                "unsupported sample format {format:?}"
            )))
        }
    };

    stream
        .play()
        .map_err(|err| BeatSyncError::Device(format!("failed to start stream: {err}")))?;
    info!(sample_rate, channels = config.channels, "microphone capture started");
    Ok(stream)
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    chunk_size: usize,
    producer: FrameProducer,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut chunker = FrameChunker::new(chunk_size, config.sample_rate.0);
    let mut mono = Vec::with_capacity(chunk_size);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                }));
                chunker.push(&mono, Instant::now(), |frame| {
                    producer.push(frame);
                });
            },
            |err| error!(error = %err, "audio capture error"),
            None,
        )
        .map_err(|err| BeatSyncError::Device(format!("failed to build input stream: {err}")))
}
