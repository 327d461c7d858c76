use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipDirection {
    Left,
    Right,
    Forward,
    Back,
}

/// Discrete actuation request: a rotation in degrees, a translation in
/// centimetres, or a parameterless flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "move", rename_all = "snake_case")]
pub enum Movement {
    RotateClockwise { degrees: u32 },
    RotateCounterClockwise { degrees: u32 },
    Up { cm: u32 },
    Down { cm: u32 },
    Left { cm: u32 },
    Right { cm: u32 },
    Forward { cm: u32 },
    Back { cm: u32 },
    Flip { direction: FlipDirection },
}

impl Movement {
    /// Command keyword understood by the drone text SDK.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::RotateClockwise { .. } => "cw",
            Self::RotateCounterClockwise { .. } => "ccw",
            Self::Up { .. } => "up",
            Self::Down { .. } => "down",
            Self::Left { .. } => "left",
            Self::Right { .. } => "right",
            Self::Forward { .. } => "forward",
            Self::Back { .. } => "back",
            Self::Flip { .. } => "flip",
        }
    }

    /// Numeric parameter, absent for flips.
    pub fn parameter(&self) -> Option<u32> {
        match *self {
            Self::RotateClockwise { degrees } | Self::RotateCounterClockwise { degrees } => {
                Some(degrees)
            }
            Self::Up { cm }
            | Self::Down { cm }
            | Self::Left { cm }
            | Self::Right { cm }
            | Self::Forward { cm }
            | Self::Back { cm } => Some(cm),
            Self::Flip { .. } => None,
        }
    }
}

impl fmt::Display for Movement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flip { direction } => {
                let code = match direction {
                    FlipDirection::Left => 'l',
                    FlipDirection::Right => 'r',
                    FlipDirection::Forward => 'f',
                    FlipDirection::Back => 'b',
                };
                write!(f, "flip {code}")
            }
            other => match other.parameter() {
                Some(value) => write!(f, "{} {value}", other.keyword()),
                None => f.write_str(other.keyword()),
            },
        }
    }
}

/// Anything that can carry out movements. The actuation queue only ever
/// talks to this trait, never to a concrete backend.
pub trait MovementExecutor: Send {
    fn name(&self) -> &str;

    /// Connects and takes off. Called once when actuation starts.
    fn begin_performance(&mut self) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, movement: &Movement) -> Result<()>;

    /// Lands. Called once when actuation stops.
    fn end_performance(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<E: MovementExecutor + ?Sized> MovementExecutor for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn begin_performance(&mut self) -> Result<()> {
        (**self).begin_performance()
    }

    fn execute(&mut self, movement: &Movement) -> Result<()> {
        (**self).execute(movement)
    }

    fn end_performance(&mut self) -> Result<()> {
        (**self).end_performance()
    }
}

/// Executor that only logs; used when no hardware is attached.
#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    executed: Vec<Movement>,
    airborne: bool,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> &[Movement] {
        &self.executed
    }

    pub fn is_airborne(&self) -> bool {
        self.airborne
    }
}

impl MovementExecutor for SimulatedExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn begin_performance(&mut self) -> Result<()> {
        info!("[sim] takeoff");
        self.airborne = true;
        Ok(())
    }

    fn execute(&mut self, movement: &Movement) -> Result<()> {
        info!(command = %movement, "[sim] move");
        self.executed.push(*movement);
        Ok(())
    }

    fn end_performance(&mut self) -> Result<()> {
        info!(moves = self.executed.len(), "[sim] land");
        self.airborne = false;
        Ok(())
    }
}
