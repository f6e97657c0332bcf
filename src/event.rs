//! Events surfaced by the engine's poll feed

use std::fmt;

use crate::accel::{AccelSample, Acceleration};
use crate::buttons::ButtonEvent;

/// One entry of the poll feed; `player` is the 1-based registration index
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionEvent {
    /// Device finished initialization
    Connected { player: usize },
    /// Device transport failed; no further events follow for this player
    Disconnected { player: usize },
    /// Core button transition
    Button { player: usize, event: ButtonEvent },
    /// Latest accelerometer reading, with g values when calibration is known
    Accel {
        player: usize,
        sample: AccelSample,
        g: Option<Acceleration>,
    },
}

impl MotionEvent {
    pub fn player(&self) -> usize {
        match self {
            MotionEvent::Connected { player }
            | MotionEvent::Disconnected { player }
            | MotionEvent::Button { player, .. }
            | MotionEvent::Accel { player, .. } => *player,
        }
    }
}

impl fmt::Display for MotionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionEvent::Connected { player } => write!(f, "player {} connected", player),
            MotionEvent::Disconnected { player } => write!(f, "player {} disconnected", player),
            MotionEvent::Button { player, event } => write!(
                f,
                "player {} {} {}",
                player,
                event.button,
                if event.released { "released" } else { "pressed" }
            ),
            MotionEvent::Accel { player, sample, g } => match g {
                Some(g) => write!(
                    f,
                    "player {} accel x={:.2}g y={:.2}g z={:.2}g",
                    player, g.x, g.y, g.z
                ),
                None => write!(
                    f,
                    "player {} accel x={} y={} z={}",
                    player, sample.x, sample.y, sample.z
                ),
            },
        }
    }
}
