//! wiimoted library
//!
//! Wiimote protocol engine: wire codec, button edge detection, accelerometer
//! reconstruction, extension negotiation and per-device sessions behind a
//! pluggable packet transport.

pub mod accel;
pub mod buttons;
pub mod config;
pub mod event;
pub mod extension;
pub mod hidraw;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

/// Re-export commonly used types
pub use accel::{AccelCalibration, AccelSample, Acceleration};
pub use buttons::{Button, ButtonEvent, ButtonState, EventRing};
pub use config::{Config, ConfigError};
pub use event::MotionEvent;
pub use extension::{ExtensionKind, ExtensionStatus};
pub use hidraw::{list_devices, DeviceInfo, HidrawTransport};
pub use protocol::{InputReport, OutputReport};
pub use registry::{EngineError, SessionRegistry};
pub use session::{DeviceSession, SessionError, SessionSettings};
pub use transport::{Transport, TransportError};
