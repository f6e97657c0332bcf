//! Core button state and edge detection
//!
//! Every data report carries a full snapshot of the 11 core buttons. The
//! tracker compares consecutive snapshots and queues one press or release
//! event per changed button, in enumeration order.

use std::collections::VecDeque;
use std::fmt;

use bitflags::bitflags;

/// Backlog of undelivered button events kept per device
pub const EVENT_RING_CAPACITY: usize = 32;

bitflags! {
    /// Core button bitmask (button byte 0 in the low byte, byte 1 in the high byte)
    ///
    /// Bits 5-6 of both bytes carry accelerometer precision bits and are not
    /// part of the button set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ButtonState: u16 {
        const LEFT = 1 << 0;
        const RIGHT = 1 << 1;
        const DOWN = 1 << 2;
        const UP = 1 << 3;
        const PLUS = 1 << 4;

        const TWO = 1 << 8;
        const ONE = 1 << 9;
        const B = 1 << 10;
        const A = 1 << 11;
        const MINUS = 1 << 12;

        const HOME = 1 << 15;
    }
}

impl ButtonState {
    /// Build from the two core button bytes of an input report
    pub fn from_report(core: [u8; 2]) -> Self {
        Self::from_bits_truncate(u16::from_le_bytes(core))
    }

    pub fn is_pressed(&self, button: Button) -> bool {
        self.contains(button.mask())
    }
}

/// Named core buttons, in event enumeration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    Left,
    Right,
    Down,
    Up,
    Plus,
    Two,
    One,
    B,
    A,
    Minus,
    Home,
}

impl Button {
    /// All buttons in enumeration order
    pub const ALL: [Button; 11] = [
        Button::Left,
        Button::Right,
        Button::Down,
        Button::Up,
        Button::Plus,
        Button::Two,
        Button::One,
        Button::B,
        Button::A,
        Button::Minus,
        Button::Home,
    ];

    /// Bit of this button in [`ButtonState`]
    pub fn mask(self) -> ButtonState {
        match self {
            Button::Left => ButtonState::LEFT,
            Button::Right => ButtonState::RIGHT,
            Button::Down => ButtonState::DOWN,
            Button::Up => ButtonState::UP,
            Button::Plus => ButtonState::PLUS,
            Button::Two => ButtonState::TWO,
            Button::One => ButtonState::ONE,
            Button::B => ButtonState::B,
            Button::A => ButtonState::A,
            Button::Minus => ButtonState::MINUS,
            Button::Home => ButtonState::HOME,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Button::Left => "left",
            Button::Right => "right",
            Button::Down => "down",
            Button::Up => "up",
            Button::Plus => "plus",
            Button::Two => "two",
            Button::One => "one",
            Button::B => "b",
            Button::A => "a",
            Button::Minus => "minus",
            Button::Home => "home",
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single button transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub button: Button,
    /// false on press, true on release
    pub released: bool,
}

impl ButtonEvent {
    pub fn pressed(button: Button) -> Self {
        Self {
            button,
            released: false,
        }
    }

    pub fn released(button: Button) -> Self {
        Self {
            button,
            released: true,
        }
    }
}

/// Transitions between two snapshots, in enumeration order
pub fn detect_edges(
    previous: ButtonState,
    current: ButtonState,
) -> impl Iterator<Item = ButtonEvent> {
    Button::ALL.into_iter().filter_map(move |button| {
        match (previous.is_pressed(button), current.is_pressed(button)) {
            (false, true) => Some(ButtonEvent::pressed(button)),
            (true, false) => Some(ButtonEvent::released(button)),
            _ => None,
        }
    })
}

// ============================================================================
// Event Ring
// ============================================================================

/// Bounded FIFO that drops its oldest entry when full
#[derive(Debug, Clone)]
pub struct EventRing<T> {
    events: VecDeque<T>,
    capacity: usize,
    /// Entries overwritten before they were read
    dropped: u64,
}

impl<T> EventRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append an entry, returning the oldest one if it had to be dropped
    pub fn push(&mut self, event: T) -> Option<T> {
        let evicted = if self.events.len() == self.capacity {
            self.dropped += 1;
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.events.iter()
    }
}

impl<T> Default for EventRing<T> {
    fn default() -> Self {
        Self::new(EVENT_RING_CAPACITY)
    }
}

// ============================================================================
// Button Tracker
// ============================================================================

/// Edge detector holding the last snapshot and the pending event backlog
#[derive(Debug, Default)]
pub struct ButtonTracker {
    /// Last seen snapshot; None until the first report arrives
    state: Option<ButtonState>,
    pending: EventRing<ButtonEvent>,
}

impl ButtonTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a new snapshot and queue its transitions
    ///
    /// The first snapshot only seeds the baseline, so buttons held at connect
    /// time do not produce press events. Returns the number of events queued.
    pub fn update(&mut self, current: ButtonState) -> usize {
        let previous = match self.state.replace(current) {
            Some(previous) => previous,
            None => {
                tracing::trace!(buttons = format!("0x{:04X}", current.bits()), "Button baseline set");
                return 0;
            }
        };

        let mut queued = 0;
        for event in detect_edges(previous, current) {
            tracing::debug!(button = %event.button, released = event.released, "Button event");
            if let Some(lost) = self.pending.push(event) {
                tracing::debug!(
                    button = %lost.button,
                    released = lost.released,
                    "Button backlog full, dropped oldest event"
                );
            }
            queued += 1;
        }
        queued
    }

    /// Next undelivered event, oldest first
    pub fn next_event(&mut self) -> Option<ButtonEvent> {
        self.pending.pop()
    }

    /// Last seen snapshot
    pub fn state(&self) -> Option<ButtonState> {
        self.state
    }

    pub fn pending(&self) -> &EventRing<ButtonEvent> {
        &self.pending
    }
}

// ============================================================================
// Tests
// ============================================================================
