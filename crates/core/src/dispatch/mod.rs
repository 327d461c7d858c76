//! Synchronous fan-out of beat events to registered listeners.
//!
//! Listeners run on the classification thread, in registration order. A
//! failing or panicking listener is logged and skipped; the others still run.

use std::{
    io::Write,
    panic::{catch_unwind, AssertUnwindSafe},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{BeatEvent, BeatSyncError, Result};

/// Capability handed to the dispatcher. Implementations must return quickly;
/// long work belongs on the actuation queue.
pub trait BeatListener: Send {
    fn on_beat(&mut self, event: &BeatEvent) -> Result<()>;

    fn name(&self) -> &str {
        "listener"
    }
}

impl<F> BeatListener for F
where
    F: FnMut(&BeatEvent) -> Result<()> + Send,
{
    fn on_beat(&mut self, event: &BeatEvent) -> Result<()> {
        self(event)
    }
}

/// Outcome of one dispatch round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// The event fell inside the dispatcher's debounce window.
    pub suppressed: bool,
}

/// Lifetime totals across all dispatch rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchTotals {
    pub events: u64,
    pub delivered: u64,
    pub failed: u64,
    pub suppressed: u64,
}

struct Registered {
    name: String,
    listener: Box<dyn BeatListener>,
}

/// Ordered collection of listeners with an optional debounce window.
///
/// Live classification already debounces; the window here guards event
/// sources that do not, such as a replayed beat timeline.
#[derive(Default)]
pub struct BeatDispatcher {
    listeners: Vec<Registered>,
    debounce: Option<Duration>,
    last_dispatched: Option<Instant>,
    totals: DispatchTotals,
}

impl BeatDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            debounce: Some(debounce),
            ..Self::default()
        }
    }

    /// Registers a listener; it runs after every listener added before it.
    pub fn add_beat_listener(&mut self, listener: impl BeatListener + 'static) {
        let name = listener.name().to_string();
        debug!(listener = %name, position = self.listeners.len(), "beat listener registered");
        self.listeners.push(Registered {
            name,
            listener: Box::new(listener),
        });
    }

    /// Registers a callable that only cares about the band tag, `None` for
    /// undifferentiated beats.
    pub fn add_tag_listener<F>(&mut self, mut listener: F)
    where
        F: FnMut(Option<&str>) -> Result<()> + Send + 'static,
    {
        self.add_beat_listener(move |event: &BeatEvent| listener(event.band_tag.as_deref()));
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn totals(&self) -> DispatchTotals {
        self.totals
    }

    /// Forgets the debounce reference point.
    pub fn reset(&mut self) {
        self.last_dispatched = None;
    }

    /// Invokes every listener with `event`, isolating failures.
    pub fn dispatch(&mut self, event: &BeatEvent) -> DispatchReport {
        if let (Some(window), Some(last)) = (self.debounce, self.last_dispatched) {
            if event.timestamp.saturating_duration_since(last) < window {
                self.totals.suppressed += 1;
                debug!(sequence = event.sequence, "dispatch debounced");
                return DispatchReport {
                    suppressed: true,
                    ..DispatchReport::default()
                };
            }
        }
        self.last_dispatched = Some(event.timestamp);
        self.totals.events += 1;

        let mut report = DispatchReport::default();
        for registered in &mut self.listeners {
            let listener = &mut registered.listener;
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_beat(event)))
                .unwrap_or_else(|_| Err(BeatSyncError::listener("listener panicked")));

            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        listener = %registered.name,
                        sequence = event.sequence,
                        error = %err,
                        "beat listener failed"
                    );
                }
            }
        }

        self.totals.delivered += report.delivered as u64;
        self.totals.failed += report.failed as u64;
        report
    }
}

impl std::fmt::Debug for BeatDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatDispatcher")
            .field(
                "listeners",
                &self.listeners.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
            )
            .field("debounce", &self.debounce)
            .field("totals", &self.totals)
            .finish()
    }
}

/// Observability hook: logs every beat and can ring the terminal bell.
#[derive(Debug, Default)]
pub struct LogListener {
    bell: bool,
}

impl LogListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bell(mut self, bell: bool) -> Self {
        self.bell = bell;
        self
    }
}

impl BeatListener for LogListener {
    fn on_beat(&mut self, event: &BeatEvent) -> Result<()> {
        info!(
            sequence = event.sequence,
            band = event.band_tag.as_deref().unwrap_or("-"),
            bands = ?event.triggering_bands,
            magnitude = event.magnitude,
            "beat"
        );
        if self.bell {
            let mut stderr = std::io::stderr();
            stderr.write_all(b"\x07")?;
            stderr.flush()?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
