//! Device registry: every peripheral ever discovered, its best-known name,
//! cached connect token, and current lifecycle state.
//!
//! Entries are never evicted; realistic peripheral counts keep this small.

use std::collections::HashMap;
use std::time::Instant;

use crate::transport::{DeviceId, PeripheralHandle};

/// Per-device lifecycle state. Exactly one state per device at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribed,
    Disconnected,
    Blocked,
}

impl ConnectionState {
    /// A connect request is in flight.
    pub fn is_connecting(self) -> bool {
        self == ConnectionState::Connecting
    }

    /// The link is up, whether or not the subscription is established yet.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
                | ConnectionState::Subscribed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::DiscoveringServices => "discovering-services",
            ConnectionState::DiscoveringCharacteristics => "discovering-characteristics",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Blocked => "blocked",
        }
    }
}

/// Everything we know about one peripheral.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: DeviceId,
    /// Name reported by the stack for the device itself.
    pub device_name: Option<String>,
    /// Local name from the most recent advertisement. Preferred over
    /// `device_name` when labeling, since it is more current.
    pub adv_name: Option<String>,
    /// Cached connect token. The transport owns the real peripheral.
    pub handle: Option<PeripheralHandle>,
    pub last_seen: Instant,
    pub state: ConnectionState,
    /// Most recent decoded reading, for status display.
    pub last_bpm: Option<u16>,
}

impl DeviceRecord {
    /// Advertised name if known, else device name, else the raw id.
    pub fn label(&self) -> String {
        self.adv_name
            .clone()
            .or_else(|| self.device_name.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a record. A handle or name passed as `Some` always
    /// replaces the cached value; `None` leaves the cached value alone.
    pub fn upsert(
        &mut self,
        id: &DeviceId,
        handle: Option<&PeripheralHandle>,
        device_name: Option<&str>,
        adv_name: Option<&str>,
        now: Instant,
    ) -> &mut DeviceRecord {
        let record = self.devices.entry(id.clone()).or_insert_with(|| DeviceRecord {
            id: id.clone(),
            device_name: None,
            adv_name: None,
            handle: None,
            last_seen: now,
            state: ConnectionState::Idle,
            last_bpm: None,
        });
        if let Some(handle) = handle {
            record.handle = Some(handle.clone());
        }
        if let Some(name) = device_name {
            if !name.is_empty() {
                record.device_name = Some(name.to_string());
            }
        }
        if let Some(name) = adv_name {
            if !name.is_empty() {
                record.adv_name = Some(name.to_string());
            }
        }
        record.last_seen = now;
        record
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(id)
    }

    pub fn set_state(&mut self, id: &DeviceId, state: ConnectionState) {
        if let Some(record) = self.devices.get_mut(id) {
            record.state = state;
        }
    }

    pub fn state(&self, id: &DeviceId) -> ConnectionState {
        self.devices
            .get(id)
            .map(|r| r.state)
            .unwrap_or(ConnectionState::Idle)
    }

    /// Best-known label for a device, falling back to the raw id for
    /// devices we have never seen.
    pub fn label(&self, id: &DeviceId) -> String {
        self.devices
            .get(id)
            .map(|r| r.label())
            .unwrap_or_else(|| id.to_string())
    }

    /// Devices currently connected or connecting, for the capacity check.
    pub fn active_count(&self) -> usize {
        self.devices
            .values()
            .filter(|r| r.state.is_connecting() || r.state.is_connected())
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s)
    }

    #[test]
    fn test_upsert_creates_idle_record() {
        let mut reg = DeviceRegistry::new();
        let now = Instant::now();
        reg.upsert(&id("aa"), None, None, None, now);
        let record = reg.get(&id("aa")).unwrap();
        assert_eq!(record.state, ConnectionState::Idle);
        assert!(record.handle.is_none());
    }

    #[test]
    fn test_label_precedence() {
        let mut reg = DeviceRegistry::new();
        let now = Instant::now();

        // Nothing known: raw id.
        assert_eq!(reg.label(&id("aa")), "aa");

        reg.upsert(&id("aa"), None, Some("Device Name"), None, now);
        assert_eq!(reg.label(&id("aa")), "Device Name");

        // Advertised name wins over device name.
        reg.upsert(&id("aa"), None, None, Some("Adv Name"), now);
        assert_eq!(reg.label(&id("aa")), "Adv Name");

        // A later device name does not displace the advertised name.
        reg.upsert(&id("aa"), None, Some("Renamed"), None, now);
        assert_eq!(reg.label(&id("aa")), "Adv Name");
    }

    #[test]
    fn test_advertised_name_refreshes() {
        let mut reg = DeviceRegistry::new();
        let now = Instant::now();
        reg.upsert(&id("aa"), None, None, Some("Old Adv"), now);
        reg.upsert(&id("aa"), None, None, Some("New Adv"), now);
        assert_eq!(reg.label(&id("aa")), "New Adv");
    }

    #[test]
    fn test_empty_names_ignored() {
        let mut reg = DeviceRegistry::new();
        let now = Instant::now();
        reg.upsert(&id("aa"), None, Some(""), Some(""), now);
        assert_eq!(reg.label(&id("aa")), "aa");
    }

    #[test]
    fn test_handle_kept_when_not_provided() {
        let mut reg = DeviceRegistry::new();
        let now = Instant::now();
        let handle = PeripheralHandle::new("aa");
        reg.upsert(&id("aa"), Some(&handle), None, None, now);
        reg.upsert(&id("aa"), None, Some("Name"), None, now);
        assert_eq!(reg.get(&id("aa")).unwrap().handle, Some(handle));
    }

    #[test]
    fn test_active_count() {
        let mut reg = DeviceRegistry::new();
        let now = Instant::now();
        for (name, state) in [
            ("a", ConnectionState::Connecting),
            ("b", ConnectionState::Subscribed),
            ("c", ConnectionState::Disconnected),
            ("d", ConnectionState::Blocked),
            ("e", ConnectionState::DiscoveringServices),
        ] {
            reg.upsert(&id(name), None, None, None, now);
            reg.set_state(&id(name), state);
        }
        assert_eq!(reg.active_count(), 3);
    }

    #[test]
    fn test_state_for_unknown_device() {
        let reg = DeviceRegistry::new();
        assert_eq!(reg.state(&id("nope")), ConnectionState::Idle);
    }
}
