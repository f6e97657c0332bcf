//! Extension detection and MotionPlus activation
//!
//! After baseline initialization a session disables extension encryption,
//! reads the 6-byte identity signature from the extension control registers
//! and, depending on what it finds, activates a MotionPlus before resuming
//! normal reporting.
//!
//! The negotiator does no I/O. It hands the session a list of
//! [`NegotiationAction`]s to perform and is fed the signature responses that
//! arrive through normal report dispatch.

use std::fmt;

use crate::protocol::{AddressSpace, OutputReport};

// ============================================================================
// Constants
// ============================================================================

/// Control register addresses used during negotiation
pub mod register {
    /// Extension init register, written 0x55 to disable encryption
    pub const EXTENSION_INIT: u32 = 0xA400F0;
    /// Extension type register, written 0x00 to finish disabling encryption
    pub const EXTENSION_TYPE: u32 = 0xA400FB;
    /// Start of the 6-byte extension identity signature
    pub const EXTENSION_SIGNATURE: u32 = 0xA600FA;
    /// MotionPlus init register (first register)
    pub const MOTION_PLUS_INIT: u32 = 0xA600F0;
    /// MotionPlus activation register (second register)
    pub const MOTION_PLUS_ACTIVATE: u32 = 0xA600FE;
}

/// Low 16 bits of the signature address, as echoed by memory read responses
pub const SIGNATURE_OFFSET: u16 = (register::EXTENSION_SIGNATURE & 0xFFFF) as u16;

/// Signature length in bytes
pub const SIGNATURE_LEN: u16 = 6;

/// Identifier byte of a Nunchuck
pub const EXT_ID_NUNCHUCK: u8 = 0x00;

/// Identifier byte of a MotionPlus
pub const EXT_ID_MOTION_PLUS: u8 = 0x05;

/// Signature base of a MotionPlus that has not been initialized yet
pub const MOTION_PLUS_INACTIVE_BASE: u16 = 0xA620;

/// Value written to disable encryption / initialize an extension
const INIT_BYTE: u8 = 0x55;

/// Value written to activate a MotionPlus
const ACTIVATE_BYTE: u8 = 0x04;

/// Default retry cap for signature reads
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ============================================================================
// Types
// ============================================================================

/// Extension detection progress; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ExtensionStatus {
    /// Detection hasn't begun yet
    #[default]
    Unknown,
    /// Detection is in progress
    InProgress,
    /// Extension kind is available
    Found,
    /// Detection gave up after the retry cap
    Failed,
}

impl ExtensionStatus {
    /// Detection has reached a terminal state
    pub fn is_settled(self) -> bool {
        matches!(self, ExtensionStatus::Found | ExtensionStatus::Failed)
    }
}

impl fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionStatus::Unknown => write!(f, "unknown"),
            ExtensionStatus::InProgress => write!(f, "in progress"),
            ExtensionStatus::Found => write!(f, "found"),
            ExtensionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Kind of peripheral attached to the extension port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtensionKind {
    #[default]
    None,
    Nunchuck,
    InactiveMotionPlus,
    ActiveMotionPlus,
    ActiveMotionPlusNunchuckPassthrough,
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionKind::None => write!(f, "none"),
            ExtensionKind::Nunchuck => write!(f, "Nunchuck"),
            ExtensionKind::InactiveMotionPlus => write!(f, "MotionPlus (inactive)"),
            ExtensionKind::ActiveMotionPlus => write!(f, "MotionPlus"),
            ExtensionKind::ActiveMotionPlusNunchuckPassthrough => {
                write!(f, "MotionPlus (Nunchuck pass-through)")
            }
        }
    }
}

/// Extension identity signature read from the control registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionSignature {
    bytes: [u8; 6],
}

impl ExtensionSignature {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    /// Parse from a memory read payload; None if fewer than 6 bytes
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = payload.get(..6)?.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Build a signature from its base and identifier fields
    pub fn new(base: u16, state: u8, id: u8) -> Self {
        let [hi, lo] = base.to_be_bytes();
        Self {
            bytes: [0x00, 0x00, hi, lo, state, id],
        }
    }

    /// Base address field (big-endian, bytes 2-3)
    pub fn base(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn state(&self) -> u8 {
        self.bytes[4]
    }

    pub fn id(&self) -> u8 {
        self.bytes[5]
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.bytes
    }

    /// Classify the attached peripheral
    ///
    /// Only the MotionPlus is driven; any other identifier, a bare Nunchuck
    /// included, is reported as [`ExtensionKind::None`].
    pub fn classify(&self) -> ExtensionKind {
        match self.id() {
            EXT_ID_MOTION_PLUS => {}
            EXT_ID_NUNCHUCK => {
                tracing::info!(
                    signature = format!("{:02X?}", self.bytes),
                    "Nunchuck attached without MotionPlus, continuing without extension"
                );
                return ExtensionKind::None;
            }
            id => {
                tracing::warn!(
                    id = format!("0x{:02X}", id),
                    signature = format!("{:02X?}", self.bytes),
                    "Unknown extension id, continuing without extension"
                );
                return ExtensionKind::None;
            }
        }

        if self.base() == MOTION_PLUS_INACTIVE_BASE {
            ExtensionKind::InactiveMotionPlus
        } else {
            ExtensionKind::ActiveMotionPlus
        }
    }
}

/// Step the session must perform on behalf of the negotiator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationAction {
    /// Send this report
    Send(OutputReport),
    /// Wait the configured settle delay
    Settle,
    /// Poll (dispatching everything received) until a signature arrives or the attempt times out
    AwaitSignature,
    /// Re-send the data report mode so extension bytes are streamed
    EnterExtendedMode,
}

// ============================================================================
// Negotiator
// ============================================================================

/// Extension detection state machine for one session
#[derive(Debug, Clone)]
pub struct ExtensionNegotiator {
    status: ExtensionStatus,
    kind: ExtensionKind,
    /// Signature reads issued so far
    attempts: u32,
    max_attempts: u32,
    /// A signature read is outstanding
    awaiting: bool,
    /// Signature received for the outstanding read
    signature: Option<ExtensionSignature>,
    /// The outstanding read came back with an error flag
    read_failed: bool,
}

impl ExtensionNegotiator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            status: ExtensionStatus::Unknown,
            kind: ExtensionKind::None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            awaiting: false,
            signature: None,
            read_failed: false,
        }
    }

    pub fn status(&self) -> ExtensionStatus {
        self.status
    }

    /// Negotiated kind; only meaningful once the status is `Found`
    pub fn kind(&self) -> Option<ExtensionKind> {
        (self.status == ExtensionStatus::Found).then_some(self.kind)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The outstanding read has been answered, with data or an error
    pub fn has_response(&self) -> bool {
        self.signature.is_some() || self.read_failed
    }

    /// Start detection: disable encryption, then read the signature
    ///
    /// Returns no actions if detection already started.
    pub fn begin(&mut self) -> Vec<NegotiationAction> {
        if self.status != ExtensionStatus::Unknown {
            return Vec::new();
        }
        self.status = ExtensionStatus::InProgress;

        let mut actions = vec![
            write_register(register::EXTENSION_INIT, INIT_BYTE),
            NegotiationAction::Settle,
            write_register(register::EXTENSION_TYPE, 0x00),
            NegotiationAction::Settle,
        ];
        actions.extend(self.request_signature());
        actions
    }

    /// Mark detection as finished without an extension (detection disabled)
    pub fn skip(&mut self) {
        if !self.status.is_settled() {
            self.kind = ExtensionKind::None;
            self.status = ExtensionStatus::Found;
            self.awaiting = false;
        }
    }

    /// Accept a memory read response for the signature window
    ///
    /// Returns true if the payload was taken as the signature of the
    /// outstanding read. Responses for other offsets, duplicates and late
    /// arrivals after detection settled are ignored.
    pub fn accept_signature(&mut self, offset: u16, payload: &[u8]) -> bool {
        if self.status.is_settled() || !self.awaiting || offset != SIGNATURE_OFFSET {
            return false;
        }

        match ExtensionSignature::parse(payload) {
            Some(signature) => {
                tracing::debug!(
                    signature = format!("{:02X?}", signature.as_bytes()),
                    attempt = self.attempts,
                    "Extension signature received"
                );
                self.signature = Some(signature);
                self.awaiting = false;
                true
            }
            None => {
                tracing::warn!(len = payload.len(), "Short extension signature ignored");
                false
            }
        }
    }

    /// Accept an error response for the signature window
    ///
    /// The device answers with an error flag when nothing is plugged into
    /// the extension port.
    pub fn accept_read_error(&mut self, offset: u16, error: u8) -> bool {
        if self.status.is_settled() || !self.awaiting || offset != SIGNATURE_OFFSET {
            return false;
        }
        tracing::debug!(error, attempt = self.attempts, "Extension signature read failed");
        self.read_failed = true;
        self.awaiting = false;
        true
    }

    /// Decide the next steps once the outstanding read resolved or timed out
    pub fn advance(&mut self) -> Result<Vec<NegotiationAction>, ExtensionError> {
        if self.status.is_settled() {
            return Ok(Vec::new());
        }

        let classified = self.signature.take().map(|s| s.classify());
        let read_failed = std::mem::take(&mut self.read_failed);
        self.awaiting = false;

        if read_failed {
            self.finish(ExtensionKind::None);
            return Ok(Vec::new());
        }

        match classified {
            Some(ExtensionKind::ActiveMotionPlus) => {
                self.finish(ExtensionKind::ActiveMotionPlus);
                Ok(vec![
                    write_register(register::MOTION_PLUS_ACTIVATE, ACTIVATE_BYTE),
                    NegotiationAction::Settle,
                    NegotiationAction::EnterExtendedMode,
                ])
            }
            Some(ExtensionKind::InactiveMotionPlus) => {
                tracing::debug!(attempt = self.attempts, "Inactive MotionPlus, initializing");
                let mut actions = vec![
                    write_register(register::MOTION_PLUS_INIT, INIT_BYTE),
                    NegotiationAction::Settle,
                ];
                actions.extend(self.retry()?);
                Ok(actions)
            }
            Some(kind) => {
                self.finish(kind);
                Ok(Vec::new())
            }
            None => {
                tracing::debug!(attempt = self.attempts, "Extension signature read timed out");
                self.retry()
            }
        }
    }

    fn retry(&mut self) -> Result<Vec<NegotiationAction>, ExtensionError> {
        if self.attempts >= self.max_attempts {
            self.status = ExtensionStatus::Failed;
            self.kind = ExtensionKind::None;
            return Err(ExtensionError::ExceededRetries {
                attempts: self.attempts,
            });
        }
        Ok(self.request_signature())
    }

    fn request_signature(&mut self) -> Vec<NegotiationAction> {
        self.attempts += 1;
        self.awaiting = true;
        self.signature = None;
        self.read_failed = false;
        vec![
            NegotiationAction::Send(OutputReport::ReadMemory {
                space: AddressSpace::ControlRegister,
                address: register::EXTENSION_SIGNATURE,
                size: SIGNATURE_LEN,
            }),
            NegotiationAction::AwaitSignature,
        ]
    }

    fn finish(&mut self, kind: ExtensionKind) {
        self.kind = kind;
        self.status = ExtensionStatus::Found;
        tracing::info!(extension = %kind, attempts = self.attempts, "Extension detection complete");
    }
}

impl Default for ExtensionNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

fn write_register(address: u32, value: u8) -> NegotiationAction {
    NegotiationAction::Send(OutputReport::write_chunk(
        AddressSpace::ControlRegister,
        address,
        &[value],
    ))
}

// ============================================================================
// Error Types
// ============================================================================

/// Extension negotiation error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// The device kept reporting an inactive MotionPlus or never answered
    ExceededRetries { attempts: u32 },
}

impl fmt::Display for ExtensionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionError::ExceededRetries { attempts } => write!(
                f,
                "extension detection failed after {} signature reads",
                attempts
            ),
        }
    }
}

impl std::error::Error for ExtensionError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn inactive() -> [u8; 6] {
        [0x00, 0x00, 0xA6, 0x20, 0x00, 0x05]
    }

    fn active() -> [u8; 6] {
        [0x00, 0x00, 0xA4, 0x20, 0x04, 0x05]
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            ExtensionSignature::new(0xA620, 0x00, 0x05).classify(),
            ExtensionKind::InactiveMotionPlus
        );
        assert_eq!(
            ExtensionSignature::new(0x0000, 0x00, 0x05).classify(),
            ExtensionKind::ActiveMotionPlus
        );
        assert_eq!(
            ExtensionSignature::new(0xA620, 0x00, 0x01).classify(),
            ExtensionKind::None
        );
        assert_eq!(
            ExtensionSignature::new(0x1234, 0x00, 0xFF).classify(),
            ExtensionKind::None
        );
    }

    #[test]
    fn test_bare_nunchuck_is_not_driven() {
        // Nunchuck signature: A4 20 00 00
        let sig = ExtensionSignature::from_bytes([0x00, 0x00, 0xA4, 0x20, 0x00, EXT_ID_NUNCHUCK]);
        assert_eq!(sig.id(), EXT_ID_NUNCHUCK);
        assert_eq!(sig.classify(), ExtensionKind::None);

        let mut neg = ExtensionNegotiator::default();
        neg.begin();
        neg.accept_signature(SIGNATURE_OFFSET, sig.as_bytes());
        assert_eq!(neg.advance().unwrap(), vec![]);
        assert_eq!(neg.status(), ExtensionStatus::Found);
        assert_eq!(neg.kind(), Some(ExtensionKind::None));
    }

    #[test]
    fn test_signature_fields() {
        let sig = ExtensionSignature::from_bytes(active());
        assert_eq!(sig.base(), 0xA420);
        assert_eq!(sig.state(), 0x04);
        assert_eq!(sig.id(), EXT_ID_MOTION_PLUS);
        assert!(ExtensionSignature::parse(&[0x00, 0x05]).is_none());
    }

    #[test]
    fn test_begin_disables_encryption_then_reads() {
        let mut neg = ExtensionNegotiator::default();
        let actions = neg.begin();

        assert_eq!(neg.status(), ExtensionStatus::InProgress);
        assert_eq!(actions.len(), 6);
        assert_eq!(
            actions[0],
            NegotiationAction::Send(OutputReport::write_chunk(
                AddressSpace::ControlRegister,
                0xA400F0,
                &[0x55]
            ))
        );
        assert_eq!(actions[1], NegotiationAction::Settle);
        assert_eq!(
            actions[2],
            NegotiationAction::Send(OutputReport::write_chunk(
                AddressSpace::ControlRegister,
                0xA400FB,
                &[0x00]
            ))
        );
        assert_eq!(
            actions[4],
            NegotiationAction::Send(OutputReport::ReadMemory {
                space: AddressSpace::ControlRegister,
                address: 0xA600FA,
                size: 6,
            })
        );
        assert_eq!(actions[5], NegotiationAction::AwaitSignature);
        assert_eq!(neg.attempts(), 1);

        // Second begin is a no-op
        assert!(neg.begin().is_empty());
    }

    #[test]
    fn test_active_motion_plus_activates() {
        let mut neg = ExtensionNegotiator::default();
        neg.begin();
        assert!(neg.accept_signature(SIGNATURE_OFFSET, &active()));

        let actions = neg.advance().unwrap();
        assert_eq!(neg.status(), ExtensionStatus::Found);
        assert_eq!(neg.kind(), Some(ExtensionKind::ActiveMotionPlus));
        assert_eq!(
            actions,
            vec![
                NegotiationAction::Send(OutputReport::write_chunk(
                    AddressSpace::ControlRegister,
                    0xA600FE,
                    &[0x04]
                )),
                NegotiationAction::Settle,
                NegotiationAction::EnterExtendedMode,
            ]
        );
    }

    #[test]
    fn test_inactive_motion_plus_retries_then_activates() {
        let mut neg = ExtensionNegotiator::default();
        neg.begin();
        assert!(neg.accept_signature(SIGNATURE_OFFSET, &inactive()));

        let actions = neg.advance().unwrap();
        assert_eq!(neg.status(), ExtensionStatus::InProgress);
        assert_eq!(neg.kind(), None);
        assert_eq!(actions.len(), 4);
        assert_eq!(
            actions[0],
            NegotiationAction::Send(OutputReport::write_chunk(
                AddressSpace::ControlRegister,
                0xA600F0,
                &[0x55]
            ))
        );
        assert_eq!(actions[3], NegotiationAction::AwaitSignature);
        assert_eq!(neg.attempts(), 2);

        assert!(neg.accept_signature(SIGNATURE_OFFSET, &active()));
        neg.advance().unwrap();
        assert_eq!(neg.kind(), Some(ExtensionKind::ActiveMotionPlus));
    }

    #[test]
    fn test_unknown_id_finishes_without_extension() {
        let mut neg = ExtensionNegotiator::default();
        neg.begin();
        neg.accept_signature(SIGNATURE_OFFSET, &[0, 0, 0xA4, 0x20, 0, 0x00]);

        assert!(neg.advance().unwrap().is_empty());
        assert_eq!(neg.status(), ExtensionStatus::Found);
        assert_eq!(neg.kind(), Some(ExtensionKind::None));
    }

    #[test]
    fn test_retry_cap_on_repeated_inactive() {
        let mut neg = ExtensionNegotiator::new(3);
        neg.begin();

        let mut result = Ok(Vec::new());
        for _ in 0..10 {
            assert!(neg.accept_signature(SIGNATURE_OFFSET, &inactive()));
            result = neg.advance();
            if result.is_err() {
                break;
            }
        }

        assert_eq!(result, Err(ExtensionError::ExceededRetries { attempts: 3 }));
        assert_eq!(neg.status(), ExtensionStatus::Failed);
        assert_eq!(neg.kind(), None);
        assert!(!neg.accept_signature(SIGNATURE_OFFSET, &active()));
    }

    #[test]
    fn test_timeouts_count_toward_cap() {
        let mut neg = ExtensionNegotiator::new(2);
        neg.begin();
        assert!(neg.advance().is_ok());
        assert_eq!(
            neg.advance(),
            Err(ExtensionError::ExceededRetries { attempts: 2 })
        );
    }

    #[test]
    fn test_ignores_other_offsets_and_unsolicited() {
        let mut neg = ExtensionNegotiator::default();
        assert!(!neg.accept_signature(SIGNATURE_OFFSET, &active()));

        neg.begin();
        assert!(!neg.accept_signature(0x0016, &active()));
        assert!(neg.accept_signature(SIGNATURE_OFFSET, &active()));
        // Duplicate response for the same read
        assert!(!neg.accept_signature(SIGNATURE_OFFSET, &inactive()));
    }

    #[test]
    fn test_status_never_regresses() {
        let mut neg = ExtensionNegotiator::default();
        neg.begin();
        neg.accept_signature(SIGNATURE_OFFSET, &active());
        neg.advance().unwrap();

        neg.skip();
        assert!(neg.begin().is_empty());
        assert!(neg.advance().unwrap().is_empty());
        assert_eq!(neg.status(), ExtensionStatus::Found);
        assert_eq!(neg.kind(), Some(ExtensionKind::ActiveMotionPlus));
    }

    #[test]
    fn test_read_error_means_no_extension() {
        let mut neg = ExtensionNegotiator::default();
        neg.begin();
        assert!(!neg.accept_read_error(0x0016, 8));
        assert!(neg.accept_read_error(SIGNATURE_OFFSET, 7));
        assert!(neg.has_response());

        assert!(neg.advance().unwrap().is_empty());
        assert_eq!(neg.kind(), Some(ExtensionKind::None));
    }

    #[test]
    fn test_skip_marks_found_none() {
        let mut neg = ExtensionNegotiator::default();
        neg.skip();
        assert_eq!(neg.status(), ExtensionStatus::Found);
        assert_eq!(neg.kind(), Some(ExtensionKind::None));
    }

    #[test]
    fn test_status_ordering() {
        assert!(ExtensionStatus::Unknown < ExtensionStatus::InProgress);
        assert!(ExtensionStatus::InProgress < ExtensionStatus::Found);
        assert!(!ExtensionStatus::InProgress.is_settled());
        assert!(ExtensionStatus::Failed.is_settled());
    }
}
