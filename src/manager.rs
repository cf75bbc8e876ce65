//! Device connection lifecycle manager.
//!
//! Turns the transport's discovery/connection/disconnection events into a
//! managed set of labeled, reconnecting sessions, subject to capacity
//! limits, source preference, and failure cooldowns. Decoded readings are
//! pushed to the sample channel feeding the JSONL sink.
//!
//! All state lives on one task: [`run`] multiplexes the transport event
//! channel and a 100ms reconnect tick with `tokio::select!`, so event
//! handling and ticks never race. The rest of the daemon sees only channel
//! endpoints and the published [`StatusSnapshot`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use uuid::Uuid;

use crate::blocklist::Blocklist;
use crate::config::Settings;
use crate::protocol::{parse_hr_measurement, HR_MEASUREMENT_UUID, HR_SERVICE_UUID};
use crate::registry::{ConnectionState, DeviceRegistry};
use crate::sink::HrSample;
use crate::transport::{DeviceId, Transport, TransportEvent};

/// Poll granularity of the reconnect scheduler.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Global scan state. Only the scan controller methods mutate it.
#[derive(Debug, Default)]
struct ScanWindow {
    active: bool,
    started: Option<Instant>,
}

/// Point-in-time view of the manager, published for the debug server.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub radio_ready: bool,
    pub scanning: bool,
    pub pending_reconnects: usize,
    pub blocked: usize,
    pub devices: Vec<DeviceStatus>,
}

#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub id: String,
    pub label: String,
    pub state: &'static str,
    pub bpm: Option<u16>,
}

pub struct Manager<T: Transport> {
    transport: T,
    registry: DeviceRegistry,
    blocklist: Blocklist,
    /// Next attempt time per device eligible for retry.
    pending: HashMap<DeviceId, Instant>,
    scan: ScanWindow,
    radio_ready: bool,
    samples: mpsc::UnboundedSender<HrSample>,
    name_filters: Vec<String>,
    id_filters: Vec<String>,
    preferred_names: Vec<String>,
    preferred_grace: Duration,
    max_devices: Option<usize>,
    scan_all: bool,
    backoff: Duration,
}

impl<T: Transport> Manager<T> {
    pub fn new(transport: T, settings: &Settings, samples: mpsc::UnboundedSender<HrSample>) -> Self {
        let lower = |v: &[String]| -> Vec<String> {
            v.iter()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase())
                .collect()
        };
        Self {
            transport,
            registry: DeviceRegistry::new(),
            blocklist: Blocklist::new(settings.block_ttl),
            pending: HashMap::new(),
            scan: ScanWindow::default(),
            radio_ready: false,
            samples,
            name_filters: lower(&settings.name_filters),
            id_filters: lower(&settings.id_filters),
            preferred_names: lower(&settings.preferred_names),
            preferred_grace: settings.preferred_grace,
            max_devices: settings.max_devices,
            scan_all: settings.scan_all,
            backoff: settings.reconnect_backoff,
        }
    }

    /// Apply one transport event. Called only from the manager task.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::RadioReady(ready) => self.on_radio_state(ready, now),
            TransportEvent::AlreadyConnected { id, handle, name } => {
                self.registry
                    .upsert(&id, Some(&handle), name.as_deref(), None, now);
                if self.at_capacity() {
                    return;
                }
                if !self.passes_filters(&id, now) {
                    return;
                }
                self.try_connect(&id);
            }
            TransportEvent::Discovered {
                id,
                handle,
                name,
                adv_name,
            } => {
                self.registry
                    .upsert(&id, Some(&handle), name.as_deref(), adv_name.as_deref(), now);
                if !self.passes_filters(&id, now) {
                    return;
                }
                if !self.is_preferred(&id) && self.should_defer(now) {
                    debug!(
                        "Deferring non-preferred device during grace window ({})",
                        self.registry.label(&id)
                    );
                    return;
                }
                if self.at_capacity() {
                    return;
                }
                self.try_connect(&id);
            }
            TransportEvent::Connected { id } => self.on_connected(&id),
            TransportEvent::ConnectFailed { id, error } => self.on_connect_failed(&id, &error, now),
            TransportEvent::Disconnected { id } => self.on_disconnected(&id, now),
            TransportEvent::ServicesDiscovered {
                id,
                services,
                error,
            } => self.on_services_discovered(&id, &services, error, now),
            TransportEvent::CharacteristicsDiscovered {
                id,
                characteristics,
                error,
                ..
            } => self.on_characteristics_discovered(&id, &characteristics, error, now),
            TransportEvent::Notification { id, data } => self.on_notification(&id, &data),
        }
    }

    /// Reconnect scheduler. Runs on a fixed tick, independent of event
    /// arrival, and shares this task's state with `handle_event`.
    pub fn tick(&mut self, now: Instant) {
        if self.pending.is_empty() {
            return;
        }

        if !self.radio_ready {
            let backoff = self.backoff;
            for (id, due) in self.pending.iter_mut() {
                *due = now + backoff;
                warn!(
                    "Bluetooth not ready. Reconnecting in {:.1}s... ({})",
                    backoff.as_secs_f64(),
                    self.registry.label(id)
                );
            }
            return;
        }

        let mut due: Vec<DeviceId> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();

        for id in due {
            let state = self.registry.state(&id);
            if state.is_connected() || state == ConnectionState::Blocked {
                self.pending.remove(&id);
                continue;
            }
            if state.is_connecting() {
                // Attempt already in flight; just re-arm.
                self.pending.insert(id, now + self.backoff);
                continue;
            }

            let handle = self.registry.get(&id).and_then(|r| r.handle.clone());
            match handle {
                Some(handle) if !self.at_capacity() => {
                    self.registry.set_state(&id, ConnectionState::Connecting);
                    info!("Reconnect attempt: connect {}", self.registry.label(&id));
                    self.transport.connect(&handle);
                }
                Some(_) => {}
                None => {
                    // Only rediscovery can produce a fresh handle. Restart
                    // the scan so discovery fires again for known devices.
                    info!("Reconnect attempt: scan");
                    self.stop_scan();
                    self.start_scan(now);
                }
            }
            // Forward progress even under repeated failures.
            self.pending.insert(id, now + self.backoff);
        }
    }

    fn on_radio_state(&mut self, ready: bool, now: Instant) {
        self.radio_ready = ready;
        if ready {
            info!("Bluetooth powered on");
            self.start_scan(now);
        } else {
            warn!("Bluetooth unavailable");
            // The stack invalidates any running scan with the radio.
            self.scan = ScanWindow::default();
        }
    }

    fn on_connected(&mut self, id: &DeviceId) {
        if self.registry.get(id).is_none() {
            return;
        }
        self.pending.remove(id);
        self.registry.set_state(id, ConnectionState::Connected);
        info!("Connected. ({})", self.registry.label(id));

        let handle = self.registry.get(id).and_then(|r| r.handle.clone());
        if let Some(handle) = handle {
            self.registry.set_state(id, ConnectionState::DiscoveringServices);
            self.transport.discover_services(&handle, HR_SERVICE_UUID);
        }
    }

    fn on_connect_failed(&mut self, id: &DeviceId, error: &str, now: Instant) {
        warn!("Failed to connect: {} ({})", error, self.registry.label(id));
        if self.blocklist.is_blocked(id, now) {
            self.registry.set_state(id, ConnectionState::Blocked);
            return;
        }
        self.registry.set_state(id, ConnectionState::Disconnected);
        self.schedule_reconnect(id, now, "Connect failed.");
    }

    fn on_disconnected(&mut self, id: &DeviceId, now: Instant) {
        if self.blocklist.is_blocked(id, now) {
            // Cleanup after a block, not a failure to recover from.
            self.registry.set_state(id, ConnectionState::Blocked);
            info!("Disconnected. ({})", self.registry.label(id));
            return;
        }
        self.registry.set_state(id, ConnectionState::Disconnected);
        self.schedule_reconnect(id, now, "Disconnected.");
    }

    fn on_services_discovered(
        &mut self,
        id: &DeviceId,
        services: &[Uuid],
        error: Option<String>,
        now: Instant,
    ) {
        if let Some(error) = error {
            warn!(
                "Service discovery failed: {} ({})",
                error,
                self.registry.label(id)
            );
            self.schedule_reconnect(id, now, "Service discovery failed.");
            return;
        }
        if services.contains(&HR_SERVICE_UUID) {
            let handle = self.registry.get(id).and_then(|r| r.handle.clone());
            if let Some(handle) = handle {
                self.registry
                    .set_state(id, ConnectionState::DiscoveringCharacteristics);
                self.transport
                    .discover_characteristics(&handle, HR_SERVICE_UUID, HR_MEASUREMENT_UUID);
            }
        } else {
            self.block_device(id, now, "No Heart Rate service.");
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        id: &DeviceId,
        characteristics: &[Uuid],
        error: Option<String>,
        now: Instant,
    ) {
        if let Some(error) = error {
            warn!(
                "Characteristic discovery failed: {} ({})",
                error,
                self.registry.label(id)
            );
            self.schedule_reconnect(id, now, "Characteristic discovery failed.");
            return;
        }
        if characteristics.contains(&HR_MEASUREMENT_UUID) {
            let handle = self.registry.get(id).and_then(|r| r.handle.clone());
            if let Some(handle) = handle {
                self.transport.set_notify(&handle, HR_MEASUREMENT_UUID, true);
                self.registry.set_state(id, ConnectionState::Subscribed);
                info!("Subscribed to notifications ({})", self.registry.label(id));
            }
        } else {
            self.block_device(id, now, "No Heart Rate characteristic.");
        }
    }

    fn on_notification(&mut self, id: &DeviceId, data: &[u8]) {
        let Some(record) = self.registry.get(id) else { return };
        if record.state != ConnectionState::Subscribed {
            debug!(
                "Dropping notification from {} device {}",
                record.state.as_str(),
                id
            );
            return;
        }
        let Some(bpm) = parse_hr_measurement(data) else {
            warn!(
                "Failed to parse HR measurement from {}: {:?}",
                self.registry.label(id),
                data
            );
            return;
        };

        let label = self.registry.label(id);
        if let Some(record) = self.registry.get_mut(id) {
            record.last_bpm = Some(bpm);
        }
        info!("{} HR={} bpm", label, bpm);
        let _ = self.samples.send(HrSample {
            ts: epoch_secs(),
            bpm,
            source: label,
            id: id.to_string(),
        });
    }

    /// Issue a connect for a known, idle device. No-op while a connection
    /// attempt or session is already in progress.
    fn try_connect(&mut self, id: &DeviceId) {
        let Some(record) = self.registry.get(id) else { return };
        if record.state.is_connecting() || record.state.is_connected() {
            return;
        }
        let Some(handle) = record.handle.clone() else { return };
        self.registry.set_state(id, ConnectionState::Connecting);
        debug!("Connecting to {}", self.registry.label(id));
        self.transport.connect(&handle);
    }

    fn schedule_reconnect(&mut self, id: &DeviceId, now: Instant, reason: &str) {
        if self.blocklist.is_blocked(id, now) {
            return;
        }
        if self.pending.contains_key(id) {
            return;
        }
        self.pending.insert(id.clone(), now + self.backoff);
        warn!(
            "{} Reconnecting in {:.1}s... ({})",
            reason,
            self.backoff.as_secs_f64(),
            self.registry.label(id)
        );
    }

    /// Cool a disqualified device down and tear its session down. Removing
    /// the pending entry here keeps blocked devices out of the scheduler
    /// for the whole window.
    fn block_device(&mut self, id: &DeviceId, now: Instant, reason: &str) {
        self.blocklist.block(id, now);
        self.pending.remove(id);
        self.registry.set_state(id, ConnectionState::Blocked);
        if let Some(handle) = self.registry.get(id).and_then(|r| r.handle.clone()) {
            self.transport.disconnect(&handle);
        }
        warn!(
            "{} Ignoring {} for {:.0}s.",
            reason,
            self.registry.label(id),
            self.blocklist.ttl().as_secs_f64()
        );
    }

    fn start_scan(&mut self, now: Instant) {
        if self.scan.active {
            return;
        }
        let filter = if self.scan_all {
            None
        } else {
            Some(HR_SERVICE_UUID)
        };
        self.transport.start_scan(filter);
        self.scan.active = true;
        self.scan.started = Some(now);
        info!("Scanning for heart rate peripherals...");
    }

    fn stop_scan(&mut self) {
        if !self.scan.active {
            return;
        }
        self.transport.stop_scan();
        self.scan.active = false;
        self.scan.started = None;
    }

    /// Blocklist, id-substring, and name-substring admission checks, in the
    /// order a discovery callback applies them. Matching is
    /// case-insensitive on both the device name and the advertised name.
    fn passes_filters(&mut self, id: &DeviceId, now: Instant) -> bool {
        if self.blocklist.is_blocked(id, now) {
            return false;
        }
        let Some(record) = self.registry.get(id) else {
            return false;
        };
        if !self.id_filters.is_empty() {
            let hay = id.as_str().to_lowercase();
            if !self.id_filters.iter().any(|want| hay.contains(want)) {
                return false;
            }
        }
        if !self.name_filters.is_empty() {
            let name = record.device_name.as_deref().unwrap_or("").to_lowercase();
            let adv = record.adv_name.as_deref().unwrap_or("").to_lowercase();
            if !self
                .name_filters
                .iter()
                .any(|want| name.contains(want) || adv.contains(want))
            {
                return false;
            }
        }
        true
    }

    fn is_preferred(&self, id: &DeviceId) -> bool {
        if self.preferred_names.is_empty() {
            return false;
        }
        let Some(record) = self.registry.get(id) else {
            return false;
        };
        let name = record.device_name.as_deref().unwrap_or("").to_lowercase();
        let adv = record.adv_name.as_deref().unwrap_or("").to_lowercase();
        self.preferred_names
            .iter()
            .any(|want| name.contains(want) || adv.contains(want))
    }

    /// While true, non-preferred discoveries are observed but not acted on,
    /// letting a preferred device win the race for limited slots.
    fn should_defer(&self, now: Instant) -> bool {
        if self.preferred_names.is_empty() || !self.scan.active {
            return false;
        }
        self.scan
            .started
            .map(|started| now.saturating_duration_since(started) < self.preferred_grace)
            .unwrap_or(false)
    }

    fn at_capacity(&self) -> bool {
        self.max_devices
            .map(|max| self.registry.active_count() >= max)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let mut devices: Vec<DeviceStatus> = self
            .registry
            .iter()
            .map(|r| DeviceStatus {
                id: r.id.to_string(),
                label: r.label(),
                state: r.state.as_str(),
                bpm: r.last_bpm,
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        StatusSnapshot {
            radio_ready: self.radio_ready,
            scanning: self.scan.active,
            pending_reconnects: self.pending.len(),
            blocked: self.blocklist.len(),
            devices,
        }
    }

    pub fn device_state(&self, id: &DeviceId) -> Option<ConnectionState> {
        self.registry.get(id).map(|r| r.state)
    }

    pub fn reconnect_due(&self, id: &DeviceId) -> Option<Instant> {
        self.pending.get(id).copied()
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.active
    }

    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Run the manager loop: transport events and the reconnect tick,
/// serialized on one task. Publishes a fresh status snapshot after every
/// step for the debug server.
pub async fn run<T: Transport>(
    mut manager: Manager<T>,
    mut events: mpsc::Receiver<TransportEvent>,
    status: Arc<Mutex<StatusSnapshot>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut tick = interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => manager.handle_event(event, Instant::now()),
                    None => {
                        info!("Transport event channel closed");
                        return Ok(());
                    }
                }
            }
            _ = tick.tick() => {
                manager.tick(Instant::now());
            }
        }
        *status.lock().await = manager.snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeripheralHandle;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        StartScan(Option<Uuid>),
        StopScan,
        Connect(String),
    }

    #[derive(Clone, Default)]
    struct FakeTransport {
        ops: Arc<StdMutex<Vec<Op>>>,
    }

    impl FakeTransport {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    impl Transport for FakeTransport {
        fn start_scan(&mut self, service: Option<Uuid>) {
            self.ops.lock().unwrap().push(Op::StartScan(service));
        }
        fn stop_scan(&mut self) {
            self.ops.lock().unwrap().push(Op::StopScan);
        }
        fn connect(&mut self, handle: &PeripheralHandle) {
            self.ops
                .lock()
                .unwrap()
                .push(Op::Connect(handle.as_str().to_string()));
        }
        fn disconnect(&mut self, _handle: &PeripheralHandle) {}
        fn discover_services(&mut self, _handle: &PeripheralHandle, _service: Uuid) {}
        fn discover_characteristics(
            &mut self,
            _handle: &PeripheralHandle,
            _service: Uuid,
            _characteristic: Uuid,
        ) {
        }
        fn set_notify(&mut self, _handle: &PeripheralHandle, _characteristic: Uuid, _enabled: bool) {
        }
    }

    fn manager_with(settings: Settings) -> (Manager<FakeTransport>, FakeTransport) {
        let fake = FakeTransport::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = Manager::new(fake.clone(), &settings, tx);
        (manager, fake)
    }

    #[test]
    fn test_reconnect_without_handle_rearms_scan() {
        let (mut manager, fake) = manager_with(Settings::default());
        let t0 = Instant::now();
        manager.radio_ready = true;

        // A pending device whose connect token was never cached: only a
        // rediscovery can bring it back.
        let id = DeviceId::new("lost");
        manager.registry.upsert(&id, None, Some("Strap"), None, t0);
        manager
            .registry
            .set_state(&id, ConnectionState::Disconnected);
        manager.pending.insert(id.clone(), t0);

        manager.tick(t0 + Duration::from_millis(1));

        assert_eq!(fake.ops(), vec![Op::StartScan(Some(HR_SERVICE_UUID))]);
        assert!(manager.reconnect_due(&id).unwrap() > t0);
    }

    #[test]
    fn test_reconnect_scan_restart_reopens_grace_window() {
        let mut settings = Settings::default();
        settings.preferred_names = vec!["watch".to_string()];
        let (mut manager, fake) = manager_with(settings);
        let t0 = Instant::now();
        manager.radio_ready = true;
        manager.start_scan(t0);

        let id = DeviceId::new("lost");
        manager.registry.upsert(&id, None, None, None, t0);
        manager
            .registry
            .set_state(&id, ConnectionState::Disconnected);
        manager.pending.insert(id.clone(), t0);

        // Past the first grace window, the rearm restarts the scan and
        // with it the preference window.
        let later = t0 + Duration::from_secs(10);
        assert!(!manager.should_defer(later));
        manager.tick(later);
        assert!(manager.should_defer(later + Duration::from_secs(2)));

        let ops = fake.ops();
        assert_eq!(
            ops,
            vec![
                Op::StartScan(Some(HR_SERVICE_UUID)),
                Op::StopScan,
                Op::StartScan(Some(HR_SERVICE_UUID)),
            ]
        );
    }

    #[test]
    fn test_should_defer() {
        let mut settings = Settings::default();
        settings.preferred_names = vec!["watch".to_string()];
        let (mut manager, _fake) = manager_with(settings);
        let t0 = Instant::now();

        // No scan yet.
        assert!(!manager.should_defer(t0));

        manager.start_scan(t0);
        assert!(manager.should_defer(t0 + Duration::from_secs(2)));
        assert!(!manager.should_defer(t0 + Duration::from_secs(6)));

        manager.stop_scan();
        assert!(!manager.should_defer(t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_should_defer_empty_preferred_set() {
        let (mut manager, _fake) = manager_with(Settings::default());
        let t0 = Instant::now();
        manager.start_scan(t0);
        assert!(!manager.should_defer(t0));
        assert!(!manager.should_defer(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_scan_start_and_stop_are_idempotent() {
        let (mut manager, fake) = manager_with(Settings::default());
        let t0 = Instant::now();

        manager.start_scan(t0);
        manager.start_scan(t0 + Duration::from_secs(1));
        manager.stop_scan();
        manager.stop_scan();

        assert_eq!(
            fake.ops(),
            vec![Op::StartScan(Some(HR_SERVICE_UUID)), Op::StopScan]
        );
    }

    #[test]
    fn test_scan_all_drops_service_filter() {
        let mut settings = Settings::default();
        settings.scan_all = true;
        let (mut manager, fake) = manager_with(settings);

        manager.start_scan(Instant::now());
        assert_eq!(fake.ops(), vec![Op::StartScan(None)]);
    }

    #[test]
    fn test_tick_at_capacity_rearms_without_connecting() {
        let mut settings = Settings::default();
        settings.max_devices = Some(1);
        let (mut manager, fake) = manager_with(settings);
        let t0 = Instant::now();
        manager.radio_ready = true;

        let busy = DeviceId::new("busy");
        manager
            .registry
            .upsert(&busy, Some(&PeripheralHandle::new("busy")), None, None, t0);
        manager.registry.set_state(&busy, ConnectionState::Subscribed);

        let waiting = DeviceId::new("waiting");
        manager.registry.upsert(
            &waiting,
            Some(&PeripheralHandle::new("waiting")),
            None,
            None,
            t0,
        );
        manager
            .registry
            .set_state(&waiting, ConnectionState::Disconnected);
        manager.pending.insert(waiting.clone(), t0);

        manager.tick(t0 + Duration::from_millis(1));

        assert!(fake.ops().is_empty());
        assert!(manager.reconnect_due(&waiting).unwrap() > t0);
        assert_eq!(
            manager.device_state(&waiting),
            Some(ConnectionState::Disconnected)
        );
    }
}
