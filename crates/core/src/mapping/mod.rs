use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    actuation::{CommandSender, EnqueueOutcome, Movement},
    dispatch::BeatListener,
    BeatEvent, BeatSyncError, Result,
};

/// Routes one band tag to a movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveBinding {
    pub tag: String,
    pub movement: Movement,
}

impl MoveBinding {
    pub fn new(tag: impl Into<String>, movement: Movement) -> Self {
        Self {
            tag: tag.into(),
            movement,
        }
    }
}

/// Band-to-movement routing table. Beats without a tag, or with a tag that
/// has no binding, fall back to a single default move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Choreography {
    pub bindings: Vec<MoveBinding>,
    pub fallback: Movement,
}

impl Default for Choreography {
    fn default() -> Self {
        Self {
            bindings: Vec::new(),
            fallback: Movement::RotateClockwise { degrees: 30 },
        }
    }
}

impl Choreography {
    pub fn new(fallback: Movement) -> Self {
        Self {
            bindings: Vec::new(),
            fallback,
        }
    }

    /// Adds or replaces the binding for `tag`.
    pub fn bind(mut self, tag: impl Into<String>, movement: Movement) -> Self {
        let tag = tag.into();
        match self.bindings.iter_mut().find(|binding| binding.tag == tag) {
            Some(binding) => binding.movement = movement,
            None => self.bindings.push(MoveBinding::new(tag, movement)),
        }
        self
    }

    pub fn movement_for(&self, tag: Option<&str>) -> Movement {
        tag.and_then(|tag| self.bindings.iter().find(|binding| binding.tag == tag))
            .map(|binding| binding.movement)
            .unwrap_or(self.fallback)
    }
}

/// Beat listener that turns each event into a queued movement command.
#[derive(Debug)]
pub struct ChoreographyListener {
    choreography: Choreography,
    sender: CommandSender,
}

impl ChoreographyListener {
    pub fn new(choreography: Choreography, sender: CommandSender) -> Self {
        Self {
            choreography,
            sender,
        }
    }
}

impl BeatListener for ChoreographyListener {
    fn on_beat(&mut self, event: &BeatEvent) -> Result<()> {
        let movement = self.choreography.movement_for(event.band_tag.as_deref());
        match self.sender.enqueue(movement, event.band_tag.clone()) {
            EnqueueOutcome::Queued => Ok(()),
            // A full queue is normal backpressure, not a listener failure.
            EnqueueOutcome::Dropped => {
                debug!(sequence = event.sequence, command = %movement, "movement skipped");
                Ok(())
            }
            EnqueueOutcome::Closed => Err(BeatSyncError::listener("actuation queue closed")),
        }
    }

    fn name(&self) -> &str {
        "choreography"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{actuation::ActuationQueue, config::ActuationConfig};

    fn beat(tag: Option<&str>) -> BeatEvent {
        BeatEvent {
            band_tag: tag.map(str::to_string),
            ..BeatEvent::undifferentiated(Instant::now(), 0)
        }
    }

    #[test]
    fn bound_tags_route_and_others_fall_back() {
        let choreography = Choreography::default()
            .bind("kick", Movement::Up { cm: 20 })
            .bind("snare", Movement::Back { cm: 20 })
            .bind("kick", Movement::Down { cm: 20 });

        assert_eq!(choreography.bindings.len(), 2);
        assert_eq!(choreography.movement_for(Some("kick")), Movement::Down { cm: 20 });
        assert_eq!(choreography.movement_for(Some("snare")), Movement::Back { cm: 20 });
        assert_eq!(
            choreography.movement_for(Some("hihat")),
            Movement::RotateClockwise { degrees: 30 }
        );
        assert_eq!(
            choreography.movement_for(None),
            Movement::RotateClockwise { degrees: 30 }
        );
    }

    #[test]
    fn parses_from_json_with_default_fallback() {
        let parsed: Choreography = serde_json::from_str(
            r#"{"bindings":[{"tag":"kick","movement":{"move":"flip","direction":"forward"}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.fallback, Movement::RotateClockwise { degrees: 30 });
        assert_eq!(parsed.bindings[0].tag, "kick");
    }

    #[test]
    fn listener_enqueues_and_tolerates_a_full_queue() {
        let queue = ActuationQueue::new(&ActuationConfig {
            capacity: 1,
            ..ActuationConfig::default()
        })
        .unwrap();
        let mut listener = ChoreographyListener::new(
            Choreography::default().bind("snare", Movement::Left { cm: 30 }),
            queue.sender(),
        );

        listener.on_beat(&beat(Some("snare"))).unwrap();
        listener.on_beat(&beat(None)).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn listener_reports_a_closed_queue() {
        let queue = ActuationQueue::new(&ActuationConfig::default()).unwrap();
        let sender = queue.sender();
        drop(queue);

        let mut listener = ChoreographyListener::new(Choreography::default(), sender);
        assert!(listener.on_beat(&beat(None)).is_err());
    }
}
