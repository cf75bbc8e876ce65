//! Transport port: the boundary between the lifecycle manager and the
//! underlying BLE stack.
//!
//! The manager issues fire-and-forget requests through the [`Transport`]
//! trait; results arrive later as [`TransportEvent`]s on the manager's
//! event channel. The production implementation lives in `ble.rs`; tests
//! drive the manager with a fake.

use std::fmt;

use uuid::Uuid;

/// Opaque stable identifier for a peripheral. The BlueZ driver uses the
/// device address string; a fake transport can use anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque connect token minted by the transport when a peripheral is
/// discovered or retrieved. The transport owns the real stack object; the
/// registry only caches this token so a reconnect can name the peripheral
/// without a fresh scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command surface of the underlying BLE stack. Every call is a
/// fire-and-forget request; outcomes arrive as [`TransportEvent`]s.
pub trait Transport {
    /// Begin discovery, optionally filtered to one advertised service.
    fn start_scan(&mut self, service: Option<Uuid>);

    /// End discovery.
    fn stop_scan(&mut self);

    /// Request a connection to a previously discovered peripheral.
    fn connect(&mut self, handle: &PeripheralHandle);

    /// Request disconnection.
    fn disconnect(&mut self, handle: &PeripheralHandle);

    /// Enumerate the peripheral's services, looking for `service`.
    fn discover_services(&mut self, handle: &PeripheralHandle, service: Uuid);

    /// Enumerate the characteristics of `service`, looking for
    /// `characteristic`.
    fn discover_characteristics(
        &mut self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    );

    /// Enable or disable value notifications for `characteristic`.
    fn set_notify(&mut self, handle: &PeripheralHandle, characteristic: Uuid, enabled: bool);
}

/// Asynchronous events from the BLE stack, delivered to the manager in
/// arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Radio availability changed. `true` means powered on and usable.
    RadioReady(bool),
    /// The stack already held a connection to this peripheral when it
    /// initialized (for example, bonded devices reconnected by the OS).
    AlreadyConnected {
        id: DeviceId,
        handle: PeripheralHandle,
        name: Option<String>,
    },
    /// A peripheral was seen during discovery.
    Discovered {
        id: DeviceId,
        handle: PeripheralHandle,
        name: Option<String>,
        adv_name: Option<String>,
    },
    /// A connect request succeeded.
    Connected { id: DeviceId },
    /// A connect request failed.
    ConnectFailed { id: DeviceId, error: String },
    /// The link to a connected peripheral dropped, or a requested
    /// disconnect completed.
    Disconnected { id: DeviceId },
    /// Service enumeration finished. `error` is set if the call itself
    /// failed, in which case `services` is empty.
    ServicesDiscovered {
        id: DeviceId,
        services: Vec<Uuid>,
        error: Option<String>,
    },
    /// Characteristic enumeration for one service finished.
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<String>,
    },
    /// A subscribed characteristic pushed a new value.
    Notification { id: DeviceId, data: Vec<u8> },
}
