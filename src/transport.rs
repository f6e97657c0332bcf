//! Packet transport boundary
//!
//! The engine never talks to a Bluetooth socket or a device node directly.
//! It sees devices through this trait: discovery hands out opaque handles,
//! and each handle supports whole-packet send and non-blocking receive.
//! Packets crossing this boundary always carry the HID transaction byte
//! (0xA2 outbound, 0xA1 inbound).

use std::fmt;
use std::io;

/// Raw packet I/O for a set of devices
pub trait Transport {
    /// Opaque connection identifier; the engine only passes it back
    type Handle: Copy + Eq + fmt::Debug;

    /// Report every device found since the last call
    fn discover(&mut self, found: &mut dyn FnMut(Self::Handle)) -> Result<(), TransportError>;

    /// Write one complete outbound packet
    fn send(&mut self, handle: Self::Handle, packet: &[u8]) -> Result<(), TransportError>;

    /// Read one inbound packet without blocking
    ///
    /// Returns `Ok(0)` when nothing is pending.
    fn receive(&mut self, handle: Self::Handle, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Release the handle; it must not be used afterwards
    fn disconnect(&mut self, handle: Self::Handle);
}

/// Transport error type
#[derive(Debug)]
pub enum TransportError {
    /// No matching device present
    DeviceNotFound,
    /// Permission denied opening a device node
    PermissionDenied,
    /// Handle is unknown or already disconnected
    InvalidHandle,
    /// I/O error
    IoError(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::DeviceNotFound => write!(f, "Wiimote device not found"),
            TransportError::PermissionDenied => write!(
                f,
                "Permission denied. Ensure udev rules are installed."
            ),
            TransportError::InvalidHandle => write!(f, "invalid or closed device handle"),
            TransportError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => TransportError::PermissionDenied,
            io::ErrorKind::NotFound => TransportError::DeviceNotFound,
            _ => TransportError::IoError(e),
        }
    }
}

// ============================================================================
// Scripted transport for tests
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::{HashMap, HashSet, VecDeque};

    use super::{Transport, TransportError};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct MockHandle(pub u32);

    type Responder = Box<dyn FnMut(MockHandle, &[u8]) -> Vec<Vec<u8>>>;

    /// In-memory transport with per-device inbound queues
    ///
    /// Every sent packet is logged. An optional responder sees each sent
    /// packet and may queue replies for the same device.
    #[derive(Default)]
    pub struct MockTransport {
        next_id: u32,
        undiscovered: Vec<MockHandle>,
        inbound: HashMap<MockHandle, VecDeque<Vec<u8>>>,
        sent: Vec<(MockHandle, Vec<u8>)>,
        failing: HashSet<MockHandle>,
        disconnected: Vec<MockHandle>,
        responder: Option<Responder>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Plug in a device; it is reported by the next `discover`
        pub fn add_device(&mut self) -> MockHandle {
            self.next_id += 1;
            let handle = MockHandle(self.next_id);
            self.undiscovered.push(handle);
            self.inbound.entry(handle).or_default();
            handle
        }

        pub fn push_inbound(&mut self, handle: MockHandle, packet: Vec<u8>) {
            self.inbound.entry(handle).or_default().push_back(packet);
        }

        pub fn set_responder<F>(&mut self, responder: F)
        where
            F: FnMut(MockHandle, &[u8]) -> Vec<Vec<u8>> + 'static,
        {
            self.responder = Some(Box::new(responder));
        }

        /// Make every later send/receive on this handle fail
        pub fn fail(&mut self, handle: MockHandle) {
            self.failing.insert(handle);
        }

        pub fn sent_to(&self, handle: MockHandle) -> Vec<Vec<u8>> {
            self.sent
                .iter()
                .filter(|(h, _)| *h == handle)
                .map(|(_, p)| p.clone())
                .collect()
        }

        pub fn clear_sent(&mut self) {
            self.sent.clear();
        }

        pub fn pending_inbound(&self, handle: MockHandle) -> usize {
            self.inbound.get(&handle).map_or(0, |q| q.len())
        }

        pub fn disconnected(&self) -> &[MockHandle] {
            &self.disconnected
        }

        fn check(&self, handle: MockHandle) -> Result<(), TransportError> {
            if self.disconnected.contains(&handle) || !self.inbound.contains_key(&handle) {
                return Err(TransportError::InvalidHandle);
            }
            if self.failing.contains(&handle) {
                return Err(TransportError::IoError(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "device gone",
                )));
            }
            Ok(())
        }
    }

    impl Transport for MockTransport {
        type Handle = MockHandle;

        fn discover(&mut self, found: &mut dyn FnMut(MockHandle)) -> Result<(), TransportError> {
            for handle in self.undiscovered.drain(..) {
                found(handle);
            }
            Ok(())
        }

        fn send(&mut self, handle: MockHandle, packet: &[u8]) -> Result<(), TransportError> {
            self.check(handle)?;
            self.sent.push((handle, packet.to_vec()));

            if let Some(responder) = self.responder.as_mut() {
                let replies = responder(handle, packet);
                let queue = self.inbound.entry(handle).or_default();
                queue.extend(replies);
            }
            Ok(())
        }

        fn receive(&mut self, handle: MockHandle, buf: &mut [u8]) -> Result<usize, TransportError> {
            self.check(handle)?;
            match self.inbound.get_mut(&handle).and_then(|q| q.pop_front()) {
                Some(packet) => {
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    Ok(len)
                }
                None => Ok(0),
            }
        }

        fn disconnect(&mut self, handle: MockHandle) {
            if !self.disconnected.contains(&handle) {
                self.disconnected.push(handle);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound packet builders
    // ------------------------------------------------------------------------

    pub fn status_report(buttons: u16, flags: u8, battery: u8) -> Vec<u8> {
        let [lo, hi] = buttons.to_le_bytes();
        vec![0xA1, 0x20, lo, hi, flags, 0x00, 0x00, battery]
    }

    pub fn memory_read_response(buttons: u16, offset: u16, error: u8, data: &[u8]) -> Vec<u8> {
        let size = data.len().clamp(1, 16) as u8;
        let [lo, hi] = buttons.to_le_bytes();
        let [off_hi, off_lo] = offset.to_be_bytes();
        let mut packet = vec![0xA1, 0x21, lo, hi, ((size - 1) << 4) | (error & 0x0F), off_hi, off_lo];
        let mut block = [0u8; 16];
        let n = data.len().min(16);
        block[..n].copy_from_slice(&data[..n]);
        packet.extend_from_slice(&block);
        packet
    }

    pub fn buttons_report(buttons: u16) -> Vec<u8> {
        let [lo, hi] = buttons.to_le_bytes();
        vec![0xA1, 0x30, lo, hi]
    }

    pub fn accel_ext16_report(buttons: u16, axes: [u8; 3], extension: [u8; 16]) -> Vec<u8> {
        let [lo, hi] = buttons.to_le_bytes();
        let mut packet = vec![0xA1, 0x35, lo, hi, axes[0], axes[1], axes[2]];
        packet.extend_from_slice(&extension);
        packet
    }

    /// Responder answering every signature read with the given bytes
    pub fn signature_responder(signature: [u8; 6]) -> impl FnMut(MockHandle, &[u8]) -> Vec<Vec<u8>> {
        move |_, packet| {
            if packet.len() >= 8 && packet[1] == 0x17 && packet[3..6] == [0xA6, 0x00, 0xFA] {
                vec![memory_read_response(0x0000, 0x00FA, 0, &signature)]
            } else {
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn test_mock_receive_returns_zero_when_idle() {
        let mut transport = MockTransport::new();
        let handle = transport.add_device();
        let mut buf = [0u8; 32];
        assert_eq!(transport.receive(handle, &mut buf).unwrap(), 0);

        transport.push_inbound(handle, buttons_report(0x0800));
        assert_eq!(transport.receive(handle, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0xA1, 0x30, 0x00, 0x08]);
    }

    #[test]
    fn test_mock_discover_reports_once() {
        let mut transport = MockTransport::new();
        let a = transport.add_device();
        let b = transport.add_device();

        let mut found = Vec::new();
        transport.discover(&mut |h| found.push(h)).unwrap();
        assert_eq!(found, vec![a, b]);

        found.clear();
        transport.discover(&mut |h| found.push(h)).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_mock_failure_and_disconnect() {
        let mut transport = MockTransport::new();
        let handle = transport.add_device();
        transport.fail(handle);
        assert!(matches!(
            transport.send(handle, &[0xA2, 0x15, 0x00]),
            Err(TransportError::IoError(_))
        ));

        let other = transport.add_device();
        transport.disconnect(other);
        assert!(matches!(
            transport.receive(other, &mut [0u8; 8]),
            Err(TransportError::InvalidHandle)
        ));
    }

    #[test]
    fn test_memory_read_response_builder() {
        let packet = memory_read_response(0x0800, 0x00FA, 0, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(packet.len(), 23);
        assert_eq!(&packet[2..4], &[0x00, 0x08]);
        assert_eq!(packet[4], 0x50);
        assert_eq!(&packet[5..7], &[0x00, 0xFA]);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: TransportError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, TransportError::PermissionDenied));
        let err: TransportError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(err.to_string().starts_with("I/O error"));
    }
}
