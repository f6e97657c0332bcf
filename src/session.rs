//! Per-device protocol state
//!
//! A [`DeviceSession`] owns everything the engine knows about one connected
//! Wiimote: the report mode it was told to stream, the rumble and LED state
//! mirrored into every output report, extension detection progress, the
//! button tracker and the latest motion samples. All traffic for a device
//! goes through its session.
//!
//! SPDX-License-Identifier: GPL-3.0

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::accel::{AccelCalibration, AccelSample, CALIBRATION_ADDRESS, CALIBRATION_LEN};
use crate::buttons::{ButtonEvent, ButtonState, ButtonTracker, EventRing};
use crate::config::Config;
use crate::event::MotionEvent;
use crate::extension::{
    ExtensionKind, ExtensionNegotiator, ExtensionStatus, NegotiationAction, SIGNATURE_OFFSET,
};
use crate::protocol::{
    report_mode, AddressSpace, InputReport, MotionPlusSample, OutputReport, MAX_INPUT_REPORT_LEN,
};
use crate::transport::{Transport, TransportError};

// ============================================================================
// Settings
// ============================================================================

/// Session behavior derived from [`Config`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Pause after each control register write
    pub settle_delay: Duration,
    /// Length of the connect rumble pulse
    pub rumble_pulse: Duration,
    /// Wait for one signature read response
    pub signature_timeout: Duration,
    /// Idle sleep while waiting for a response
    pub poll_interval: Duration,
    /// Run extension detection during initialization
    pub detect_extension: bool,
    /// Signature reads before detection gives up
    pub max_attempts: u32,
    /// Surface accelerometer samples as events
    pub emit_accel: bool,
    /// Attach calibrated g values to accelerometer events
    pub apply_calibration: bool,
    /// Light LED n for player n
    pub player_leds: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            settle_delay: Duration::from_millis(config.timing.settle_delay_ms),
            rumble_pulse: Duration::from_millis(config.timing.rumble_pulse_ms),
            signature_timeout: Duration::from_millis(config.timing.signature_timeout_ms),
            poll_interval: Duration::from_millis(config.timing.poll_interval_ms),
            detect_extension: config.extension.enabled,
            max_attempts: config.extension.max_attempts,
            emit_accel: config.events.emit_accel,
            apply_calibration: config.events.apply_calibration,
            player_leds: config.leds.player_leds,
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, initialization sequence not finished
    Initializing,
    /// Initialized and dispatching reports
    Active,
    /// Transport failed; the session accepts no more traffic
    Terminated,
}

// ============================================================================
// Device Session
// ============================================================================

/// Protocol state of one connected device
#[derive(Debug)]
pub struct DeviceSession<H> {
    handle: H,
    /// 1-based registration index
    player: usize,
    settings: SessionSettings,
    state: SessionState,

    report_mode: u8,
    rumble: bool,
    /// 4-bit LED mask, bit 0 = LED 1
    leds: u8,

    negotiator: ExtensionNegotiator,
    buttons: ButtonTracker,

    last_accel: Option<AccelSample>,
    /// `last_accel` changed since the last accel event
    accel_changed: bool,
    calibration: Option<AccelCalibration>,
    battery: Option<u8>,
    extension_connected: bool,
    last_motion_plus: Option<MotionPlusSample>,

    connected_pending: bool,
    disconnected_pending: bool,

    unrecognized: u64,
    malformed: u64,
}

impl<H: Copy + Eq + fmt::Debug> DeviceSession<H> {
    pub fn new(handle: H, player: usize, settings: SessionSettings) -> Self {
        Self {
            handle,
            player,
            settings,
            state: SessionState::Initializing,
            report_mode: report_mode::BUTTONS,
            rumble: false,
            leds: 0,
            negotiator: ExtensionNegotiator::new(settings.max_attempts),
            buttons: ButtonTracker::new(),
            last_accel: None,
            accel_changed: false,
            calibration: None,
            battery: None,
            extension_connected: false,
            last_motion_plus: None,
            connected_pending: false,
            disconnected_pending: false,
            unrecognized: 0,
            malformed: 0,
        }
    }

    /// LED mask shown for this player after initialization
    fn default_leds(&self) -> u8 {
        if self.settings.player_leds && self.player > 0 {
            1 << ((self.player - 1) % 4)
        } else {
            0x01
        }
    }

    /// Run the connect sequence
    ///
    /// Report mode, player LED, status request, calibration read and a rumble
    /// pulse, followed by extension detection. Detection failure is not an
    /// error; the session stays usable in its current report mode.
    pub fn initialize<T>(&mut self, transport: &mut T) -> Result<(), SessionError>
    where
        T: Transport<Handle = H>,
    {
        if self.state != SessionState::Initializing {
            return Ok(());
        }

        tracing::info!(player = self.player, handle = ?self.handle, "Initializing device");

        self.set_report_mode(transport, report_mode::BUTTONS_ACCEL_EXT16)?;
        self.set_leds(transport, self.default_leds())?;
        self.send(transport, &OutputReport::StatusRequest { rumble: self.rumble })?;
        self.send(
            transport,
            &OutputReport::ReadMemory {
                space: AddressSpace::Eeprom,
                address: CALIBRATION_ADDRESS,
                size: CALIBRATION_LEN,
            },
        )?;

        self.set_rumble(transport, true)?;
        std::thread::sleep(self.settings.rumble_pulse);
        self.set_rumble(transport, false)?;

        if self.settings.detect_extension {
            self.negotiate_extension(transport)?;
        } else {
            self.negotiator.skip();
        }

        self.state = SessionState::Active;
        self.connected_pending = true;

        tracing::info!(
            player = self.player,
            extension_status = %self.negotiator.status(),
            extension = %self.negotiator.kind().unwrap_or_default(),
            "Device initialized"
        );
        Ok(())
    }

    /// Drive the extension negotiator until it settles or gives up
    fn negotiate_extension<T>(&mut self, transport: &mut T) -> Result<(), SessionError>
    where
        T: Transport<Handle = H>,
    {
        let mut actions: VecDeque<NegotiationAction> = self.negotiator.begin().into();

        while let Some(action) = actions.pop_front() {
            match action {
                NegotiationAction::Send(report) => self.send(transport, &report)?,
                NegotiationAction::Settle => std::thread::sleep(self.settings.settle_delay),
                NegotiationAction::EnterExtendedMode => {
                    self.set_report_mode(transport, report_mode::BUTTONS_ACCEL_EXT16)?
                }
                NegotiationAction::AwaitSignature => {
                    self.await_signature(transport)?;
                    match self.negotiator.advance() {
                        Ok(next) => actions.extend(next),
                        Err(e) => {
                            tracing::warn!(player = self.player, error = %e, "Extension detection failed");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Poll until the signature read is answered or the attempt times out
    ///
    /// Every report received meanwhile goes through normal dispatch.
    fn await_signature<T>(&mut self, transport: &mut T) -> Result<(), SessionError>
    where
        T: Transport<Handle = H>,
    {
        let deadline = Instant::now() + self.settings.signature_timeout;

        while !self.negotiator.has_response() {
            if Instant::now() >= deadline {
                break;
            }
            if !self.poll_once(transport)? {
                std::thread::sleep(self.settings.poll_interval);
            }
        }
        Ok(())
    }

    /// Attempt one non-blocking receive and dispatch what arrived
    ///
    /// Returns whether a packet was received. A transport failure terminates
    /// the session.
    pub fn poll_once<T>(&mut self, transport: &mut T) -> Result<bool, SessionError>
    where
        T: Transport<Handle = H>,
    {
        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }

        let mut buf = [0u8; MAX_INPUT_REPORT_LEN];
        let len = transport
            .receive(self.handle, &mut buf)
            .map_err(|e| self.fail(e))?;

        if len == 0 {
            return Ok(false);
        }

        self.dispatch(transport, &buf[..len])?;
        Ok(true)
    }

    /// Route one inbound packet
    pub fn dispatch<T>(&mut self, transport: &mut T, packet: &[u8]) -> Result<(), SessionError>
    where
        T: Transport<Handle = H>,
    {
        let report = match InputReport::parse(packet) {
            Ok(report) => report,
            Err(e) => {
                self.malformed += 1;
                tracing::warn!(player = self.player, error = %e, "Dropping malformed packet");
                return Ok(());
            }
        };

        tracing::trace!(
            player = self.player,
            code = format!("0x{:02X}", report.code()),
            len = packet.len(),
            "Input report"
        );

        match report {
            InputReport::StatusInfo(status) => {
                self.track_buttons(status.buttons);
                self.battery = Some(status.battery);
                self.extension_connected = status.extension_connected();
                tracing::debug!(
                    player = self.player,
                    battery = status.battery,
                    extension_connected = self.extension_connected,
                    "Status report"
                );
                // The device drops back to buttons-only after a status report
                self.set_report_mode(transport, report_mode::BUTTONS_ACCEL_EXT16)?;
            }
            InputReport::MemoryRead(response) => {
                self.track_buttons(response.buttons);
                self.on_memory_read(response.offset, response.error, response.payload());
            }
            InputReport::Acknowledge(ack) => {
                self.track_buttons(ack.buttons);
                if ack.error != 0 {
                    tracing::warn!(
                        player = self.player,
                        report = format!("0x{:02X}", ack.report),
                        error = ack.error,
                        "Output report rejected"
                    );
                }
            }
            InputReport::ButtonsOnly { buttons } => self.track_buttons(buttons),
            InputReport::ButtonsAccel { buttons, accel } => {
                self.track_buttons(buttons);
                self.track_accel(accel);
            }
            InputReport::ButtonsAccelExt16 {
                buttons,
                accel,
                extension,
            } => {
                self.track_buttons(buttons);
                self.track_accel(accel);
                if self.negotiator.kind() == Some(ExtensionKind::ActiveMotionPlus) {
                    if let Some(sample) = MotionPlusSample::parse(&extension) {
                        self.last_motion_plus = Some(sample);
                    }
                }
            }
            InputReport::Unrecognized { code, len } => {
                self.unrecognized += 1;
                tracing::debug!(
                    player = self.player,
                    code = format!("0x{:02X}", code),
                    len,
                    "Unhandled report"
                );
            }
        }
        Ok(())
    }

    fn on_memory_read(&mut self, offset: u16, error: u8, payload: &[u8]) {
        if offset == SIGNATURE_OFFSET && !self.negotiator.status().is_settled() {
            if error != 0 {
                self.negotiator.accept_read_error(offset, error);
            } else {
                self.negotiator.accept_signature(offset, payload);
            }
            return;
        }

        if error != 0 {
            tracing::warn!(
                player = self.player,
                offset = format!("0x{:04X}", offset),
                error,
                "Memory read failed"
            );
            return;
        }

        if offset == CALIBRATION_ADDRESS as u16 {
            match AccelCalibration::parse(payload) {
                Ok(calibration) => {
                    tracing::debug!(player = self.player, ?calibration, "Accelerometer calibration read");
                    self.calibration = Some(calibration);
                }
                Err(e) => {
                    tracing::warn!(player = self.player, error = %e, "Ignoring accelerometer calibration");
                }
            }
            return;
        }

        tracing::debug!(
            player = self.player,
            offset = format!("0x{:04X}", offset),
            "Unsolicited memory read response"
        );
    }

    fn track_buttons(&mut self, buttons: ButtonState) {
        self.buttons.update(buttons);
    }

    fn track_accel(&mut self, sample: AccelSample) {
        if self.last_accel != Some(sample) {
            self.last_accel = Some(sample);
            self.accel_changed = true;
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn send<T>(&mut self, transport: &mut T, report: &OutputReport) -> Result<(), SessionError>
    where
        T: Transport<Handle = H>,
    {
        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }

        let bytes = report.encode();
        tracing::trace!(
            player = self.player,
            code = format!("0x{:02X}", report.code()),
            data = format!("{:02X?}", bytes),
            "Output report"
        );
        transport.send(self.handle, &bytes).map_err(|e| self.fail(e))
    }

    fn fail(&mut self, error: TransportError) -> SessionError {
        tracing::warn!(player = self.player, error = %error, "Transport failure, terminating session");
        if self.state == SessionState::Active {
            self.disconnected_pending = true;
        }
        self.state = SessionState::Terminated;
        SessionError::Transport(error)
    }

    /// Select the data report layout; carries the current rumble state
    pub fn set_report_mode<T>(&mut self, transport: &mut T, mode: u8) -> Result<(), SessionError>
    where
        T: Transport<Handle = H>,
    {
        self.send(
            transport,
            &OutputReport::SetReportMode {
                mode,
                continuous: false,
                rumble: self.rumble,
            },
        )?;
        self.report_mode = mode;
        Ok(())
    }

    /// Light the player LEDs; `mask` bit 0 is LED 1
    pub fn set_leds<T>(&mut self, transport: &mut T, mask: u8) -> Result<(), SessionError>
    where
        T: Transport<Handle = H>,
    {
        let leds = mask & 0x0F;
        self.send(
            transport,
            &OutputReport::SetLed {
                leds,
                rumble: self.rumble,
            },
        )?;
        self.leds = leds;
        Ok(())
    }

    /// Start or stop the rumble motor
    ///
    /// Every output report carries the rumble bit, so stopping is done by
    /// re-sending the LED state with the bit clear.
    pub fn set_rumble<T>(&mut self, transport: &mut T, on: bool) -> Result<(), SessionError>
    where
        T: Transport<Handle = H>,
    {
        self.rumble = on;
        if on {
            self.send(transport, &OutputReport::Rumble)
        } else {
            self.send(
                transport,
                &OutputReport::SetLed {
                    leds: self.leds,
                    rumble: false,
                },
            )
        }
    }

    // ------------------------------------------------------------------------
    // Event feed
    // ------------------------------------------------------------------------

    /// Next event for this device
    ///
    /// Connected first, then queued button events, then the latest
    /// accelerometer sample if it changed, then Disconnected.
    pub fn next_event(&mut self) -> Option<MotionEvent> {
        let player = self.player;

        if self.connected_pending {
            self.connected_pending = false;
            return Some(MotionEvent::Connected { player });
        }

        if let Some(event) = self.buttons.next_event() {
            return Some(MotionEvent::Button { player, event });
        }

        if self.accel_changed {
            self.accel_changed = false;
            if let (true, Some(sample)) = (self.settings.emit_accel, self.last_accel) {
                let g = if self.settings.apply_calibration {
                    self.calibration.map(|c| c.apply(&sample))
                } else {
                    None
                };
                return Some(MotionEvent::Accel { player, sample, g });
            }
        }

        if self.disconnected_pending {
            self.disconnected_pending = false;
            return Some(MotionEvent::Disconnected { player });
        }

        None
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn handle(&self) -> H {
        self.handle
    }

    pub fn player(&self) -> usize {
        self.player
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    pub fn report_mode(&self) -> u8 {
        self.report_mode
    }

    pub fn rumble(&self) -> bool {
        self.rumble
    }

    pub fn leds(&self) -> u8 {
        self.leds
    }

    pub fn extension_status(&self) -> ExtensionStatus {
        self.negotiator.status()
    }

    /// Negotiated extension; None until detection found one
    pub fn extension_kind(&self) -> Option<ExtensionKind> {
        self.negotiator.kind()
    }

    pub fn button_state(&self) -> Option<ButtonState> {
        self.buttons.state()
    }

    pub fn pending_events(&self) -> &EventRing<ButtonEvent> {
        self.buttons.pending()
    }

    pub fn last_accel(&self) -> Option<AccelSample> {
        self.last_accel
    }

    pub fn calibration(&self) -> Option<AccelCalibration> {
        self.calibration
    }

    /// Raw battery level from the last status report
    pub fn battery(&self) -> Option<u8> {
        self.battery
    }

    pub fn extension_connected(&self) -> bool {
        self.extension_connected
    }

    pub fn last_motion_plus(&self) -> Option<MotionPlusSample> {
        self.last_motion_plus
    }

    pub fn unrecognized_count(&self) -> u64 {
        self.unrecognized
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Session error type
#[derive(Debug)]
pub enum SessionError {
    /// The transport failed; the session is now terminated
    Transport(TransportError),
    /// The session was already terminated
    Terminated,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "transport failure: {}", e),
            SessionError::Terminated => write!(f, "session terminated"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transport(e) => Some(e),
            SessionError::Terminated => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e)
    }
}

// ============================================================================
// Tests
// ============================================================================
