//! Linux hidraw transport
//!
//! A Wiimote paired through BlueZ shows up as a `/dev/hidrawN` node. The
//! kernel strips the HID transaction byte: writes start with the report
//! code and reads return the report code first. This transport adds and
//! removes that byte so the engine always sees full packets.
//!
//! SPDX-License-Identifier: GPL-3.0

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::protocol::{HID_INPUT_REPORT, HID_OUTPUT_REPORT};
use crate::transport::{Transport, TransportError};

/// Nintendo vendor ID
pub const NINTENDO_VENDOR_ID: u16 = 0x057E;

/// Original Wiimote (RVL-CNT-01)
pub const WIIMOTE_PID: u16 = 0x0306;

/// Wiimote with built-in MotionPlus (RVL-CNT-01-TR)
pub const WIIMOTE_PLUS_PID: u16 = 0x0330;

/// Default sysfs directory listing hidraw nodes
pub const SYSFS_HIDRAW_DIR: &str = "/sys/class/hidraw";

/// Directory holding the hidraw device nodes
pub const DEV_DIR: &str = "/dev";

/// A Wiimote hidraw node found in sysfs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device node, e.g. `/dev/hidraw3`
    pub path: PathBuf,
    pub product_id: u16,
    /// HID_NAME from uevent, if present
    pub name: Option<String>,
}

/// Extract `(bus, vendor, product)` from the HID_ID line of a uevent file
///
/// The line looks like `HID_ID=0005:0000057E:00000306`.
pub fn parse_hid_id(uevent: &str) -> Option<(u16, u16, u16)> {
    let value = uevent
        .lines()
        .find_map(|line| line.strip_prefix("HID_ID="))?;

    let mut fields = value.trim().split(':');
    let bus = u32::from_str_radix(fields.next()?, 16).ok()?;
    let vendor = u32::from_str_radix(fields.next()?, 16).ok()?;
    let product = u32::from_str_radix(fields.next()?, 16).ok()?;

    Some((bus as u16, vendor as u16, product as u16))
}

fn parse_hid_name(uevent: &str) -> Option<String> {
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("HID_NAME="))
        .map(|name| name.trim().to_string())
}

fn is_wiimote(vendor: u16, product: u16) -> bool {
    vendor == NINTENDO_VENDOR_ID && (product == WIIMOTE_PID || product == WIIMOTE_PLUS_PID)
}

/// Scan a sysfs hidraw directory for Wiimotes, sorted by node name
///
/// Node paths are built by joining the sysfs entry name onto `dev_dir`.
pub fn scan(sysfs_dir: &Path, dev_dir: &Path) -> Result<Vec<DeviceInfo>, TransportError> {
    if !sysfs_dir.exists() {
        return Err(TransportError::DeviceNotFound);
    }

    let mut devices = Vec::new();

    for entry in std::fs::read_dir(sysfs_dir).map_err(TransportError::IoError)? {
        let entry = entry.map_err(TransportError::IoError)?;
        let path = entry.path();

        let uevent = match std::fs::read_to_string(path.join("device/uevent")) {
            Ok(uevent) => uevent,
            Err(_) => continue,
        };

        let (_, vendor, product) = match parse_hid_id(&uevent) {
            Some(id) => id,
            None => continue,
        };
        if !is_wiimote(vendor, product) {
            continue;
        }

        if let Some(name) = path.file_name() {
            devices.push(DeviceInfo {
                path: dev_dir.join(name),
                product_id: product,
                name: parse_hid_name(&uevent),
            });
        }
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// List Wiimotes currently visible to the system
pub fn list_devices() -> Result<Vec<DeviceInfo>, TransportError> {
    scan(Path::new(SYSFS_HIDRAW_DIR), Path::new(DEV_DIR))
}

/// Index of an opened hidraw node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HidrawHandle(usize);

struct OpenDevice {
    path: PathBuf,
    file: File,
}

/// Transport over Linux hidraw device nodes
pub struct HidrawTransport {
    sysfs_dir: PathBuf,
    dev_dir: PathBuf,
    /// Slot per handle; None once disconnected
    devices: Vec<Option<OpenDevice>>,
    /// Nodes currently open
    open_paths: HashSet<PathBuf>,
}

impl HidrawTransport {
    pub fn new() -> Self {
        Self::with_sysfs_dir(SYSFS_HIDRAW_DIR)
    }

    pub fn with_sysfs_dir(sysfs_dir: impl Into<PathBuf>) -> Self {
        Self::with_dirs(sysfs_dir, DEV_DIR)
    }

    /// Discover through `sysfs_dir` and open nodes under `dev_dir`
    pub fn with_dirs(sysfs_dir: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_dir: sysfs_dir.into(),
            dev_dir: dev_dir.into(),
            devices: Vec::new(),
            open_paths: HashSet::new(),
        }
    }

    /// Open a hidraw node read/write and non-blocking
    fn open(path: &Path) -> Result<File, TransportError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    tracing::error!(
                        "Permission denied opening {:?}. Make sure udev rules are installed.",
                        path
                    );
                    TransportError::PermissionDenied
                } else {
                    TransportError::IoError(e)
                }
            })
    }

    fn device(&mut self, handle: HidrawHandle) -> Result<&mut OpenDevice, TransportError> {
        self.devices
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(TransportError::InvalidHandle)
    }

    /// Number of nodes currently open
    pub fn open_count(&self) -> usize {
        self.open_paths.len()
    }
}

impl Default for HidrawTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HidrawTransport {
    type Handle = HidrawHandle;

    fn discover(&mut self, found: &mut dyn FnMut(HidrawHandle)) -> Result<(), TransportError> {
        for info in scan(&self.sysfs_dir, &self.dev_dir)? {
            if self.open_paths.contains(&info.path) {
                continue;
            }

            // One unreadable node must not hide the others
            let file = match Self::open(&info.path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %info.path.display(), error = %e, "Skipping hidraw device");
                    continue;
                }
            };

            tracing::info!(
                path = %info.path.display(),
                product = format!("0x{:04X}", info.product_id),
                name = info.name.as_deref().unwrap_or("unknown"),
                "Found Wiimote hidraw device"
            );

            let handle = HidrawHandle(self.devices.len());
            self.open_paths.insert(info.path.clone());
            self.devices.push(Some(OpenDevice {
                path: info.path,
                file,
            }));
            found(handle);
        }
        Ok(())
    }

    fn send(&mut self, handle: HidrawHandle, packet: &[u8]) -> Result<(), TransportError> {
        let device = self.device(handle)?;
        let payload = match packet.split_first() {
            Some((&HID_OUTPUT_REPORT, rest)) => rest,
            _ => packet,
        };

        tracing::trace!(
            path = %device.path.display(),
            data = format!("{:02X?}", payload),
            "hidraw write"
        );
        device.file.write_all(payload).map_err(TransportError::IoError)
    }

    fn receive(&mut self, handle: HidrawHandle, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.len() < 2 {
            return Ok(0);
        }
        let device = self.device(handle)?;

        match device.file.read(&mut buf[1..]) {
            Ok(0) => Ok(0),
            Ok(len) => {
                buf[0] = HID_INPUT_REPORT;
                Ok(len + 1)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                tracing::error!(path = %device.path.display(), error = %e, "Error reading hidraw device");
                Err(TransportError::IoError(e))
            }
        }
    }

    fn disconnect(&mut self, handle: HidrawHandle) {
        if let Some(device) = self.devices.get_mut(handle.0).and_then(|slot| slot.take()) {
            tracing::info!(path = %device.path.display(), "Closed hidraw device");
            self.open_paths.remove(&device.path);
        }
    }
}
