//! Accelerometer sample reconstruction and calibration
//!
//! The three axes arrive as 8-bit values. The extra precision bits live in
//! the core button bytes of the same report: bits 6..5 of byte 0 hold X bits
//! 1..0, bit 5 of byte 1 holds Y bit 1 and bit 6 of byte 1 holds Z bit 1.
//! All axes are reconstructed on the same 10-bit scale.

/// Raw accelerometer sample, 10-bit scale per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelSample {
    pub x: u16,
    pub y: u16,
    pub z: u16,
}

impl AccelSample {
    /// Combine 8-bit axis values with their low-order bits
    ///
    /// `x_lo` carries X bits 1..0; `y_lo` and `z_lo` carry a single bit that
    /// lands in bit 1 of their axis.
    pub fn reconstruct(axes: [u8; 3], x_lo: u8, y_lo: u8, z_lo: u8) -> Self {
        Self {
            x: ((axes[0] as u16) << 2) | (x_lo & 0x03) as u16,
            y: ((axes[1] as u16) << 2) | (((y_lo & 0x01) as u16) << 1),
            z: ((axes[2] as u16) << 2) | (((z_lo & 0x01) as u16) << 1),
        }
    }

    /// Reconstruct from the core button bytes and the axis bytes of a report
    pub fn from_report(core: [u8; 2], axes: [u8; 3]) -> Self {
        let x_lo = (core[0] >> 5) & 0x03;
        let y_lo = (core[1] >> 5) & 0x01;
        let z_lo = (core[1] >> 6) & 0x01;
        Self::reconstruct(axes, x_lo, y_lo, z_lo)
    }
}

/// Acceleration in units of g
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Acceleration {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

// ============================================================================
// Calibration
// ============================================================================

/// EEPROM address of the accelerometer calibration block
pub const CALIBRATION_ADDRESS: u32 = 0x000016;

/// Size of the calibration block in bytes
pub const CALIBRATION_LEN: u16 = 10;

/// Factory calibration read from EEPROM, 10-bit scale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelCalibration {
    pub zero_g: AccelSample,
    pub one_g: AccelSample,
}

impl AccelCalibration {
    /// Parse the 10-byte calibration block
    ///
    /// Layout: X0 Y0 Z0 (high 8 bits), low bits (X 5..4, Y 3..2, Z 1..0),
    /// then the same for 1g, one unused byte and a checksum.
    pub fn parse(block: &[u8]) -> Result<Self, CalibrationError> {
        if block.len() < CALIBRATION_LEN as usize {
            return Err(CalibrationError::TooShort(block.len()));
        }

        let expected = block[..9]
            .iter()
            .fold(0x55u8, |sum, b| sum.wrapping_add(*b));
        if expected != block[9] {
            return Err(CalibrationError::Checksum {
                expected,
                actual: block[9],
            });
        }

        let point = |hi: &[u8], lo: u8| AccelSample {
            x: ((hi[0] as u16) << 2) | ((lo >> 4) & 0x03) as u16,
            y: ((hi[1] as u16) << 2) | ((lo >> 2) & 0x03) as u16,
            z: ((hi[2] as u16) << 2) | (lo & 0x03) as u16,
        };

        Ok(Self {
            zero_g: point(&block[0..3], block[3]),
            one_g: point(&block[4..7], block[7]),
        })
    }

    /// Convert a raw sample to g; axes with a degenerate range read as 0
    pub fn apply(&self, sample: &AccelSample) -> Acceleration {
        let axis = |raw: u16, zero: u16, one: u16| {
            let range = one as f32 - zero as f32;
            if range.abs() < f32::EPSILON {
                0.0
            } else {
                (raw as f32 - zero as f32) / range
            }
        };

        Acceleration {
            x: axis(sample.x, self.zero_g.x, self.one_g.x),
            y: axis(sample.y, self.zero_g.y, self.one_g.y),
            z: axis(sample.z, self.zero_g.z, self.one_g.z),
        }
    }
}

/// Calibration block that cannot be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    TooShort(usize),
    Checksum { expected: u8, actual: u8 },
}

impl std::fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationError::TooShort(len) => {
                write!(f, "calibration block too short ({} bytes)", len)
            }
            CalibrationError::Checksum { expected, actual } => write!(
                f,
                "calibration checksum mismatch (expected 0x{:02X}, got 0x{:02X})",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for CalibrationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with_checksum(bytes: [u8; 9]) -> [u8; 10] {
        let mut block = [0u8; 10];
        block[..9].copy_from_slice(&bytes);
        block[9] = bytes.iter().fold(0x55u8, |sum, b| sum.wrapping_add(*b));
        block
    }

    #[test]
    fn test_reconstruct_x_extra_bits() {
        let sample = AccelSample::reconstruct([0x80, 0x00, 0x00], 0b10, 0, 0);
        assert_eq!(sample.x, (0x80 << 2) | 0b10);
    }

    #[test]
    fn test_reconstruct_is_deterministic() {
        let a = AccelSample::reconstruct([0x7F, 0x81, 0x9A], 0b11, 1, 0);
        let b = AccelSample::reconstruct([0x7F, 0x81, 0x9A], 0b11, 1, 0);
        assert_eq!(a, b);
        assert_eq!(a.y, (0x81 << 2) | 0b10);
        assert_eq!(a.z, 0x9A << 2);
    }

    #[test]
    fn test_from_report_bit_positions() {
        // X bits in byte 0 bits 6..5, Y in byte 1 bit 5, Z in byte 1 bit 6
        let sample = AccelSample::from_report([0b0110_0000, 0b0100_0000], [1, 2, 3]);
        assert_eq!(sample, AccelSample { x: (1 << 2) | 3, y: 2 << 2, z: (3 << 2) | 2 });

        let sample = AccelSample::from_report([0b0010_0000, 0b0010_0000], [1, 2, 3]);
        assert_eq!(sample, AccelSample { x: (1 << 2) | 1, y: (2 << 2) | 2, z: 3 << 2 });
    }

    #[test]
    fn test_reconstruct_ignores_stray_bits() {
        let sample = AccelSample::reconstruct([0xFF, 0xFF, 0xFF], 0xFF, 0xFF, 0xFF);
        assert_eq!(sample, AccelSample { x: 0x3FF, y: 0x3FE, z: 0x3FE });
    }

    #[test]
    fn test_calibration_parse() {
        let block = block_with_checksum([0x80, 0x80, 0x80, 0b0001_1011, 0x9A, 0x9A, 0x9A, 0x00, 0x40]);
        let cal = AccelCalibration::parse(&block).unwrap();
        assert_eq!(cal.zero_g, AccelSample { x: (0x80 << 2) | 1, y: (0x80 << 2) | 2, z: (0x80 << 2) | 3 });
        assert_eq!(cal.one_g, AccelSample { x: 0x9A << 2, y: 0x9A << 2, z: 0x9A << 2 });
    }

    #[test]
    fn test_calibration_bad_checksum() {
        let mut block = block_with_checksum([0x80, 0x80, 0x80, 0, 0x9A, 0x9A, 0x9A, 0, 0]);
        block[9] = block[9].wrapping_add(1);
        assert!(matches!(
            AccelCalibration::parse(&block),
            Err(CalibrationError::Checksum { .. })
        ));
        assert_eq!(
            AccelCalibration::parse(&block[..4]),
            Err(CalibrationError::TooShort(4))
        );
    }

    #[test]
    fn test_calibration_apply() {
        let cal = AccelCalibration {
            zero_g: AccelSample { x: 512, y: 512, z: 512 },
            one_g: AccelSample { x: 612, y: 612, z: 512 },
        };

        let g = cal.apply(&AccelSample { x: 612, y: 462, z: 700 });
        assert!((g.x - 1.0).abs() < 1e-6);
        assert!((g.y + 0.5).abs() < 1e-6);
        assert_eq!(g.z, 0.0);
    }
}
