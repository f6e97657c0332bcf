//! Session registry: the engine's top-level handle
//!
//! Owns the transport and one [`DeviceSession`] per discovered device.
//! Sessions are only ever appended; a session whose transport failed is
//! kept as a tombstone so player numbers stay stable until shutdown.

use std::fmt;

use crate::event::MotionEvent;
use crate::session::{DeviceSession, SessionError, SessionSettings};
use crate::transport::{Transport, TransportError};

/// Owns all device sessions and fans operations out across them
pub struct SessionRegistry<T: Transport> {
    transport: T,
    settings: SessionSettings,
    sessions: Vec<DeviceSession<T::Handle>>,
    initialized: bool,
}

impl<T: Transport> SessionRegistry<T> {
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        Self {
            transport,
            settings,
            sessions: Vec::new(),
            initialized: false,
        }
    }

    /// Discover and initialize devices
    ///
    /// Returns the number of sessions added. Calling this again while
    /// initialized does nothing.
    pub fn init(&mut self) -> Result<usize, EngineError> {
        if self.initialized {
            return Ok(0);
        }
        self.initialized = true;
        tracing::info!("Starting motion engine");
        self.rescan()
    }

    /// Add sessions for devices found since the last scan
    pub fn rescan(&mut self) -> Result<usize, EngineError> {
        if !self.initialized {
            return Ok(0);
        }

        let mut found = Vec::new();
        self.transport
            .discover(&mut |handle| found.push(handle))
            .map_err(EngineError::Transport)?;

        for handle in &found {
            self.add_session(*handle);
        }
        Ok(found.len())
    }

    fn add_session(&mut self, handle: T::Handle) {
        let player = self.sessions.len() + 1;
        let mut session = DeviceSession::new(handle, player, self.settings);

        if let Err(e) = session.initialize(&mut self.transport) {
            tracing::warn!(player, error = %e, "Device initialization failed");
            self.transport.disconnect(handle);
        }
        self.sessions.push(session);
    }

    /// Disconnect every live session and forget them all
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }

        for session in self.sessions.iter().filter(|s| !s.is_terminated()) {
            self.transport.disconnect(session.handle());
        }
        tracing::info!(sessions = self.sessions.len(), "Motion engine shut down");

        self.sessions.clear();
        self.initialized = false;
    }

    /// One non-blocking sweep, then the next pending event
    ///
    /// Each live session gets exactly one receive attempt. Events are
    /// returned in registration order: all of player 1's pending events
    /// come before player 2's.
    pub fn poll(&mut self) -> Option<MotionEvent> {
        for session in self.sessions.iter_mut().filter(|s| !s.is_terminated()) {
            if let Err(e) = session.poll_once(&mut self.transport) {
                tracing::warn!(player = session.player(), error = %e, "Device disconnected");
                self.transport.disconnect(session.handle());
            }
        }

        self.sessions.iter_mut().find_map(|s| s.next_event())
    }

    /// Set the LED mask of a player (1-indexed); bit 0 is LED 1
    pub fn set_leds(&mut self, player: usize, mask: u8) -> Result<(), EngineError> {
        let session = Self::live_session(&mut self.sessions, player)?;
        let result = session.set_leds(&mut self.transport, mask);
        self.settle_command(player, result)
    }

    /// Start or stop rumble on a player (1-indexed)
    pub fn set_rumble(&mut self, player: usize, on: bool) -> Result<(), EngineError> {
        let session = Self::live_session(&mut self.sessions, player)?;
        let result = session.set_rumble(&mut self.transport, on);
        self.settle_command(player, result)
    }

    fn live_session(
        sessions: &mut [DeviceSession<T::Handle>],
        player: usize,
    ) -> Result<&mut DeviceSession<T::Handle>, EngineError> {
        let session = player
            .checked_sub(1)
            .and_then(|index| sessions.get_mut(index))
            .ok_or(EngineError::NoSuchPlayer(player))?;

        if session.is_terminated() {
            return Err(EngineError::SessionTerminated(player));
        }
        Ok(session)
    }

    fn settle_command(
        &mut self,
        player: usize,
        result: Result<(), SessionError>,
    ) -> Result<(), EngineError> {
        match result {
            Ok(()) => Ok(()),
            Err(SessionError::Terminated) => Err(EngineError::SessionTerminated(player)),
            Err(SessionError::Transport(e)) => {
                if let Some(session) = self.sessions.get(player - 1) {
                    self.transport.disconnect(session.handle());
                }
                Err(EngineError::Transport(e))
            }
        }
    }

    /// Session of a player (1-indexed), tombstones included
    pub fn session(&self, player: usize) -> Option<&DeviceSession<T::Handle>> {
        player.checked_sub(1).and_then(|index| self.sessions.get(index))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &DeviceSession<T::Handle>> {
        self.sessions.iter()
    }

    /// Registered sessions, tombstones included
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions whose transport is still up
    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_terminated()).count()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> Drop for SessionRegistry<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Engine error type
#[derive(Debug)]
pub enum EngineError {
    /// No session registered under this player number
    NoSuchPlayer(usize),
    /// The player's device has disconnected
    SessionTerminated(usize),
    /// Transport failure
    Transport(TransportError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NoSuchPlayer(player) => write!(f, "no device for player {}", player),
            EngineError::SessionTerminated(player) => {
                write!(f, "device for player {} has disconnected", player)
            }
            EngineError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
