//! BLE heart-rate session daemon.
//!
//! Maintains live connections to peripherals exposing the Heart Rate
//! service (0x180D), decodes measurement notifications (0x2A37) into a
//! normalized bpm stream, and writes one JSON object per reading to an
//! append-only log.
//!
//! The heart of the crate is [`manager`]: a per-device connection state
//! machine plus reconnect scheduler, driven entirely through the abstract
//! [`transport`] port so it can be exercised without radio hardware. The
//! BlueZ implementation of the port lives in [`ble`].

pub mod ble;
pub mod blocklist;
pub mod config;
pub mod debug_server;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod sink;
pub mod transport;

pub use config::Settings;
pub use manager::{Manager, StatusSnapshot};
pub use sink::HrSample;
pub use transport::{DeviceId, PeripheralHandle, Transport, TransportEvent};
