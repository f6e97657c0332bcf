//! Wiimote wire protocol
//!
//! Encodes output reports and decodes input reports exchanged over the
//! Bluetooth HID data channel. Every packet starts with the HID transaction
//! byte (0xA2 outbound, 0xA1 inbound) followed by the report code.
//!
//! Layouts are handled with explicit byte offsets and bit masks. Nothing in
//! this module depends on struct layout or host byte order.
//!
//! SPDX-License-Identifier: GPL-3.0

use std::fmt;

use bitflags::bitflags;

use crate::accel::AccelSample;
use crate::buttons::ButtonState;

// ============================================================================
// Constants
// ============================================================================

/// HID transaction byte prefixed to every inbound packet
pub const HID_INPUT_REPORT: u8 = 0xA1;

/// HID transaction byte prefixed to every outbound packet
pub const HID_OUTPUT_REPORT: u8 = 0xA2;

/// Output report codes (host to device)
pub mod output_code {
    pub const RUMBLE: u8 = 0x10;
    pub const LED: u8 = 0x11;
    pub const DATA_REPORT_MODE: u8 = 0x12;
    pub const IR_CAMERA_ENABLE: u8 = 0x13;
    pub const SPEAKER_ENABLE: u8 = 0x14;
    pub const STATUS_REQUEST: u8 = 0x15;
    pub const WRITE_MEMORY: u8 = 0x16;
    pub const READ_MEMORY: u8 = 0x17;
    pub const SPEAKER_DATA: u8 = 0x18;
    pub const SPEAKER_MUTE: u8 = 0x19;
    pub const IR_CAMERA_ENABLE_2: u8 = 0x1A;
}

/// Input report codes (device to host)
pub mod input_code {
    pub const STATUS_INFO: u8 = 0x20;
    pub const READ_MEMORY_DATA: u8 = 0x21;
    pub const ACKNOWLEDGE: u8 = 0x22;
    pub const BUTTONS: u8 = 0x30;
    pub const BUTTONS_ACCEL: u8 = 0x31;
    pub const BUTTONS_EXT8: u8 = 0x32;
    pub const BUTTONS_ACCEL_IR12: u8 = 0x33;
    pub const BUTTONS_EXT19: u8 = 0x34;
    pub const BUTTONS_ACCEL_EXT16: u8 = 0x35;
    pub const BUTTONS_IR10_EXT6: u8 = 0x36;
    pub const BUTTONS_ACCEL_IR10_EXT6: u8 = 0x37;
    pub const EXT21: u8 = 0x3D;
    pub const BUTTONS_ACCEL_IR36_INTERLEAVED_0: u8 = 0x3E;
    pub const BUTTONS_ACCEL_IR36_INTERLEAVED_1: u8 = 0x3F;
}

/// Data report modes selectable with [`OutputReport::SetReportMode`]
///
/// A report mode is the input report code the device will stream.
pub mod report_mode {
    use super::input_code;

    /// Core buttons only (power-on default)
    pub const BUTTONS: u8 = input_code::BUTTONS;
    /// Core buttons and accelerometer
    pub const BUTTONS_ACCEL: u8 = input_code::BUTTONS_ACCEL;
    /// Core buttons, accelerometer and 16 extension bytes
    pub const BUTTONS_ACCEL_EXT16: u8 = input_code::BUTTONS_ACCEL_EXT16;
}

/// Player LED bits as they appear in the LED control byte
pub mod led {
    pub const LED_1: u8 = 0x10;
    pub const LED_2: u8 = 0x20;
    pub const LED_3: u8 = 0x40;
    pub const LED_4: u8 = 0x80;
}

/// Rumble bit, shared by the first payload byte of most output reports
pub const FLAG_RUMBLE: u8 = 0x01;

/// Continuous reporting bit of the data report mode flags
pub const FLAG_CONTINUOUS: u8 = 0x04;

/// Maximum payload of a single memory write
pub const MEMORY_WRITE_CHUNK: usize = 16;

/// Highest address reachable in either memory space (24-bit)
pub const MAX_MEMORY_ADDRESS: u32 = 0x00FF_FFFF;

/// Largest inbound packet the engine reads in one go
pub const MAX_INPUT_REPORT_LEN: usize = 128;

/// Device address spaces reachable with memory reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    /// On-board EEPROM (calibration, Mii data)
    Eeprom,
    /// Control registers (speaker, extension, IR camera)
    ControlRegister,
}

impl AddressSpace {
    /// Wire value of the address space byte
    pub fn to_byte(self) -> u8 {
        match self {
            AddressSpace::Eeprom => 0x00,
            AddressSpace::ControlRegister => 0x04,
        }
    }

    /// Parse the address space byte, ignoring the rumble bit
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & !FLAG_RUMBLE {
            0x00 => Some(AddressSpace::Eeprom),
            0x04 | 0x08 => Some(AddressSpace::ControlRegister),
            _ => None,
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Eeprom => write!(f, "eeprom"),
            AddressSpace::ControlRegister => write!(f, "ctlreg"),
        }
    }
}

// ============================================================================
// Output Reports
// ============================================================================

/// Command packet sent to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputReport {
    /// Player LEDs, `leds` is a 4-bit mask (bit 0 = LED 1)
    SetLed { leds: u8, rumble: bool },
    /// Select the input report layout the device streams
    SetReportMode {
        mode: u8,
        continuous: bool,
        rumble: bool,
    },
    /// Ask for a status information report (0x20)
    StatusRequest { rumble: bool },
    /// Read `size` bytes starting at `address` (24-bit)
    ReadMemory {
        space: AddressSpace,
        address: u32,
        size: u16,
    },
    /// Write up to 16 bytes at `address` (24-bit)
    WriteMemory {
        space: AddressSpace,
        address: u32,
        len: u8,
        data: [u8; MEMORY_WRITE_CHUNK],
    },
    /// Start the rumble motor
    Rumble,
}

impl OutputReport {
    /// Report code placed after the transaction byte
    pub fn code(&self) -> u8 {
        match self {
            OutputReport::SetLed { .. } => output_code::LED,
            OutputReport::SetReportMode { .. } => output_code::DATA_REPORT_MODE,
            OutputReport::StatusRequest { .. } => output_code::STATUS_REQUEST,
            OutputReport::ReadMemory { .. } => output_code::READ_MEMORY,
            OutputReport::WriteMemory { .. } => output_code::WRITE_MEMORY,
            OutputReport::Rumble => output_code::RUMBLE,
        }
    }

    /// Build a single memory write; `data` longer than 16 bytes is truncated
    ///
    /// Only the low 24 bits of `address` go on the wire. Use
    /// [`write_memory`] for arbitrary lengths.
    pub fn write_chunk(space: AddressSpace, address: u32, data: &[u8]) -> Self {
        let len = data.len().min(MEMORY_WRITE_CHUNK);
        let mut block = [0u8; MEMORY_WRITE_CHUNK];
        block[..len].copy_from_slice(&data[..len]);
        OutputReport::WriteMemory {
            space,
            address,
            len: len as u8,
            data: block,
        }
    }

    /// Convert to bytes for sending, header included
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![HID_OUTPUT_REPORT, self.code()];

        match self {
            OutputReport::SetLed { leds, rumble } => {
                bytes.push(((leds & 0x0F) << 4) | rumble_bit(*rumble));
            }
            OutputReport::SetReportMode {
                mode,
                continuous,
                rumble,
            } => {
                let continuous = if *continuous { FLAG_CONTINUOUS } else { 0 };
                bytes.push(continuous | rumble_bit(*rumble));
                bytes.push(*mode);
            }
            OutputReport::StatusRequest { rumble } => {
                bytes.push(rumble_bit(*rumble));
            }
            OutputReport::ReadMemory {
                space,
                address,
                size,
            } => {
                bytes.push(space.to_byte());
                bytes.extend_from_slice(&encode_address(*address));
                bytes.extend_from_slice(&size.to_be_bytes());
            }
            OutputReport::WriteMemory {
                space,
                address,
                len,
                data,
            } => {
                bytes.push(space.to_byte());
                bytes.extend_from_slice(&encode_address(*address));
                bytes.push(*len);
                bytes.extend_from_slice(data);
            }
            OutputReport::Rumble => {
                bytes.push(FLAG_RUMBLE);
            }
        }

        bytes
    }

    /// Parse an encoded output report
    ///
    /// The device never sends these; this exists for transports that log or
    /// replay outbound traffic.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 || bytes[0] != HID_OUTPUT_REPORT {
            return None;
        }
        let payload = &bytes[2..];

        match bytes[1] {
            output_code::LED => Some(OutputReport::SetLed {
                leds: payload[0] >> 4,
                rumble: payload[0] & FLAG_RUMBLE != 0,
            }),
            output_code::DATA_REPORT_MODE if payload.len() >= 2 => {
                Some(OutputReport::SetReportMode {
                    mode: payload[1],
                    continuous: payload[0] & FLAG_CONTINUOUS != 0,
                    rumble: payload[0] & FLAG_RUMBLE != 0,
                })
            }
            output_code::STATUS_REQUEST => Some(OutputReport::StatusRequest {
                rumble: payload[0] & FLAG_RUMBLE != 0,
            }),
            output_code::READ_MEMORY if payload.len() >= 6 => Some(OutputReport::ReadMemory {
                space: AddressSpace::from_byte(payload[0])?,
                address: decode_address([payload[1], payload[2], payload[3]]),
                size: u16::from_be_bytes([payload[4], payload[5]]),
            }),
            output_code::WRITE_MEMORY if payload.len() >= 5 + MEMORY_WRITE_CHUNK => {
                let mut data = [0u8; MEMORY_WRITE_CHUNK];
                data.copy_from_slice(&payload[5..5 + MEMORY_WRITE_CHUNK]);
                Some(OutputReport::WriteMemory {
                    space: AddressSpace::from_byte(payload[0])?,
                    address: decode_address([payload[1], payload[2], payload[3]]),
                    len: payload[4],
                    data,
                })
            }
            output_code::RUMBLE => Some(OutputReport::Rumble),
            _ => None,
        }
    }
}

fn rumble_bit(rumble: bool) -> u8 {
    if rumble {
        FLAG_RUMBLE
    } else {
        0
    }
}

/// Split a 24-bit address into hi/mid/lo bytes
fn encode_address(address: u32) -> [u8; 3] {
    [
        ((address >> 16) & 0xFF) as u8,
        ((address >> 8) & 0xFF) as u8,
        (address & 0xFF) as u8,
    ]
}

fn decode_address(bytes: [u8; 3]) -> u32 {
    ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32)
}

/// Split a write of any length into 16-byte memory write commands
///
/// Chunks go to sequential addresses. The last chunk carries the true
/// remaining length and a zero-padded data block. A write that would run
/// past [`MAX_MEMORY_ADDRESS`] is rejected as a whole.
pub fn write_memory(
    space: AddressSpace,
    address: u32,
    data: &[u8],
) -> Result<Vec<OutputReport>, AddressError> {
    let out_of_range = AddressError::OutOfRange {
        address,
        len: data.len(),
    };
    let len = u32::try_from(data.len()).map_err(|_| out_of_range.clone())?;
    match address.checked_add(len.saturating_sub(1)) {
        Some(last) if address <= MAX_MEMORY_ADDRESS && last <= MAX_MEMORY_ADDRESS => {}
        _ => return Err(out_of_range),
    }

    Ok(data
        .chunks(MEMORY_WRITE_CHUNK)
        .enumerate()
        .map(|(i, chunk)| {
            let chunk_address = address + (i * MEMORY_WRITE_CHUNK) as u32;
            OutputReport::write_chunk(space, chunk_address, chunk)
        })
        .collect())
}

// ============================================================================
// Input Reports
// ============================================================================

bitflags! {
    /// Flags byte of the status information report
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const BATTERY_LOW = 0b0000_0001;
        const EXTENSION_CONNECTED = 0b0000_0010;
        const SPEAKER_ENABLED = 0b0000_0100;
        const IR_CAMERA_ENABLED = 0b0000_1000;
        const LED_1 = 0b0001_0000;
        const LED_2 = 0b0010_0000;
        const LED_3 = 0b0100_0000;
        const LED_4 = 0b1000_0000;
    }
}

/// Status information report (0x20)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    pub buttons: ButtonState,
    pub flags: StatusFlags,
    /// Raw battery level (0-255)
    pub battery: u8,
}

impl StatusInfo {
    /// LED mask currently lit on the device (bit 0 = LED 1)
    pub fn leds(&self) -> u8 {
        self.flags.bits() >> 4
    }

    pub fn extension_connected(&self) -> bool {
        self.flags.contains(StatusFlags::EXTENSION_CONNECTED)
    }
}

/// Memory read response (0x21)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReadResponse {
    pub buttons: ButtonState,
    /// Number of valid bytes in `data` (1-16)
    pub size: u8,
    /// Error flag; 0 = success, 7 = write-only register, 8 = bad address
    pub error: u8,
    /// Low 16 bits of the address of `data[0]`
    pub offset: u16,
    pub data: [u8; 16],
}

impl MemoryReadResponse {
    /// The valid part of the data block
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.size as usize).min(self.data.len())]
    }
}

/// Output report acknowledgement (0x22)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    pub buttons: ButtonState,
    /// Code of the output report being acknowledged
    pub report: u8,
    pub error: u8,
}

/// Decoded view of an inbound packet
#[derive(Debug, Clone, PartialEq)]
pub enum InputReport {
    StatusInfo(StatusInfo),
    MemoryRead(MemoryReadResponse),
    Acknowledge(Acknowledge),
    ButtonsOnly {
        buttons: ButtonState,
    },
    ButtonsAccel {
        buttons: ButtonState,
        accel: AccelSample,
    },
    ButtonsAccelExt16 {
        buttons: ButtonState,
        accel: AccelSample,
        extension: [u8; 16],
    },
    /// A report code this engine does not decode
    Unrecognized {
        code: u8,
        len: usize,
    },
}

impl InputReport {
    /// Decode one inbound packet, header included
    ///
    /// Unknown report codes are not an error; they come back as
    /// [`InputReport::Unrecognized`]. A known code with too few bytes is
    /// rejected with [`DecodeError::Truncated`].
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::TooShort { len: bytes.len() });
        }
        if bytes[0] != HID_INPUT_REPORT {
            return Err(DecodeError::NotInputReport(bytes[0]));
        }

        let code = bytes[1];
        let needed = match expected_len(code) {
            Some(needed) => needed,
            None => {
                return Ok(InputReport::Unrecognized {
                    code,
                    len: bytes.len(),
                })
            }
        };

        if bytes.len() < needed {
            return Err(DecodeError::Truncated {
                code,
                len: bytes.len(),
                needed,
            });
        }

        let core = [bytes[2], bytes[3]];
        let buttons = ButtonState::from_report(core);

        let report = match code {
            input_code::STATUS_INFO => InputReport::StatusInfo(StatusInfo {
                buttons,
                flags: StatusFlags::from_bits_retain(bytes[4]),
                battery: bytes[7],
            }),
            input_code::READ_MEMORY_DATA => {
                let mut data = [0u8; 16];
                data.copy_from_slice(&bytes[7..23]);
                InputReport::MemoryRead(MemoryReadResponse {
                    buttons,
                    size: (bytes[4] >> 4) + 1,
                    error: bytes[4] & 0x0F,
                    offset: u16::from_be_bytes([bytes[5], bytes[6]]),
                    data,
                })
            }
            input_code::ACKNOWLEDGE => InputReport::Acknowledge(Acknowledge {
                buttons,
                report: bytes[4],
                error: bytes[5],
            }),
            input_code::BUTTONS => InputReport::ButtonsOnly { buttons },
            input_code::BUTTONS_ACCEL => InputReport::ButtonsAccel {
                buttons,
                accel: AccelSample::from_report(core, [bytes[4], bytes[5], bytes[6]]),
            },
            input_code::BUTTONS_ACCEL_EXT16 => {
                let mut extension = [0u8; 16];
                extension.copy_from_slice(&bytes[7..23]);
                InputReport::ButtonsAccelExt16 {
                    buttons,
                    accel: AccelSample::from_report(core, [bytes[4], bytes[5], bytes[6]]),
                    extension,
                }
            }
            _ => {
                return Ok(InputReport::Unrecognized {
                    code,
                    len: bytes.len(),
                })
            }
        };

        Ok(report)
    }

    /// Report code of this view
    pub fn code(&self) -> u8 {
        match self {
            InputReport::StatusInfo(_) => input_code::STATUS_INFO,
            InputReport::MemoryRead(_) => input_code::READ_MEMORY_DATA,
            InputReport::Acknowledge(_) => input_code::ACKNOWLEDGE,
            InputReport::ButtonsOnly { .. } => input_code::BUTTONS,
            InputReport::ButtonsAccel { .. } => input_code::BUTTONS_ACCEL,
            InputReport::ButtonsAccelExt16 { .. } => input_code::BUTTONS_ACCEL_EXT16,
            InputReport::Unrecognized { code, .. } => *code,
        }
    }
}

/// Minimum packet length (header included) for each decoded report code
fn expected_len(code: u8) -> Option<usize> {
    match code {
        input_code::STATUS_INFO => Some(8),
        input_code::READ_MEMORY_DATA => Some(23),
        input_code::ACKNOWLEDGE => Some(6),
        input_code::BUTTONS => Some(4),
        input_code::BUTTONS_ACCEL => Some(7),
        input_code::BUTTONS_ACCEL_EXT16 => Some(23),
        _ => None,
    }
}

// ============================================================================
// MotionPlus Payload
// ============================================================================

/// Gyroscope sample carried in the first 6 extension bytes by an active MotionPlus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionPlusSample {
    /// Yaw angular speed (14-bit)
    pub yaw: u16,
    /// Roll angular speed (14-bit)
    pub roll: u16,
    /// Pitch angular speed (14-bit)
    pub pitch: u16,
    pub yaw_slow: bool,
    pub roll_slow: bool,
    pub pitch_slow: bool,
    /// Another extension is plugged into the MotionPlus pass-through port
    pub extension_connected: bool,
}

impl MotionPlusSample {
    /// Parse MotionPlus data; returns None if the marker bit is not set
    pub fn parse(ext: &[u8]) -> Option<Self> {
        if ext.len() < 6 || ext[5] & 0x02 == 0 {
            return None;
        }

        let speed = |lo: u8, hi: u8| (lo as u16) | (((hi >> 2) as u16) << 8);

        Some(Self {
            yaw: speed(ext[0], ext[3]),
            roll: speed(ext[1], ext[4]),
            pitch: speed(ext[2], ext[5]),
            yaw_slow: ext[3] & 0x02 != 0,
            roll_slow: ext[4] & 0x02 != 0,
            pitch_slow: ext[3] & 0x01 != 0,
            extension_connected: ext[4] & 0x01 != 0,
        })
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Inbound packet that cannot be decoded safely
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Packet is too short to carry a header
    TooShort { len: usize },
    /// First byte is not the HID input transaction byte
    NotInputReport(u8),
    /// Packet is shorter than its report code requires
    Truncated { code: u8, len: usize, needed: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort { len } => write!(f, "packet too short for header ({} bytes)", len),
            DecodeError::NotInputReport(byte) => {
                write!(f, "not an input report (transaction byte 0x{:02X})", byte)
            }
            DecodeError::Truncated { code, len, needed } => write!(
                f,
                "report 0x{:02X} truncated: {} bytes, need {}",
                code, len, needed
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Memory write that does not fit the 24-bit address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    OutOfRange { address: u32, len: usize },
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::OutOfRange { address, len } => write!(
                f,
                "write of {} bytes at 0x{:06X} exceeds address space (max 0x{:06X})",
                len, address, MAX_MEMORY_ADDRESS
            ),
        }
    }
}

impl std::error::Error for AddressError {}

// ============================================================================
// Tests
// ============================================================================
