//! BlueZ-backed transport driver.
//!
//! Implements the [`Transport`] port over a request channel: the manager's
//! fire-and-forget calls become [`Request`]s, and a driver task owning the
//! bluer session translates them into BLE operations, emitting
//! [`TransportEvent`]s as results arrive. Connection attempts, GATT
//! enumeration, and notification streaming run in spawned tasks so the
//! driver loop never blocks on a slow peripheral.

use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;

use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DiscoveryFilter};
use futures::{Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::HR_SERVICE_UUID;
use crate::transport::{DeviceId, PeripheralHandle, Transport, TransportEvent};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type DiscoveryStream = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// Requests from the manager to the driver task.
#[derive(Debug, Clone)]
pub enum Request {
    StartScan(Option<Uuid>),
    StopScan,
    Connect(PeripheralHandle),
    Disconnect(PeripheralHandle),
    DiscoverServices(PeripheralHandle, Uuid),
    DiscoverCharacteristics(PeripheralHandle, Uuid, Uuid),
    SetNotify(PeripheralHandle, Uuid, bool),
}

/// Channel-backed [`Transport`] handed to the manager.
#[derive(Debug, Clone)]
pub struct BleTransport {
    requests: mpsc::UnboundedSender<Request>,
}

/// Create the manager-side transport and the driver-side request receiver.
pub fn transport() -> (BleTransport, mpsc::UnboundedReceiver<Request>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BleTransport { requests: tx }, rx)
}

impl BleTransport {
    fn send(&self, request: Request) {
        // A closed channel means the driver is gone and the daemon is
        // shutting down; requests can only be dropped.
        let _ = self.requests.send(request);
    }
}

impl Transport for BleTransport {
    fn start_scan(&mut self, service: Option<Uuid>) {
        self.send(Request::StartScan(service));
    }

    fn stop_scan(&mut self) {
        self.send(Request::StopScan);
    }

    fn connect(&mut self, handle: &PeripheralHandle) {
        self.send(Request::Connect(handle.clone()));
    }

    fn disconnect(&mut self, handle: &PeripheralHandle) {
        self.send(Request::Disconnect(handle.clone()));
    }

    fn discover_services(&mut self, handle: &PeripheralHandle, service: Uuid) {
        self.send(Request::DiscoverServices(handle.clone(), service));
    }

    fn discover_characteristics(
        &mut self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
    ) {
        self.send(Request::DiscoverCharacteristics(
            handle.clone(),
            service,
            characteristic,
        ));
    }

    fn set_notify(&mut self, handle: &PeripheralHandle, characteristic: Uuid, enabled: bool) {
        self.send(Request::SetNotify(handle.clone(), characteristic, enabled));
    }
}

enum Step {
    Request(Option<Request>),
    Discovery(Option<AdapterEvent>),
}

/// Run the driver until the request channel closes.
pub async fn run(
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<(), BoxError> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    info!("Using BLE adapter: {}", adapter.name());

    adapter.set_powered(true).await?;
    let _ = events.send(TransportEvent::RadioReady(true)).await;

    report_already_connected(&adapter, &events).await;

    let mut discovery: Option<DiscoveryStream> = None;

    loop {
        let step = tokio::select! {
            request = requests.recv() => Step::Request(request),
            event = next_discovery(&mut discovery) => Step::Discovery(event),
        };

        match step {
            Step::Request(None) => {
                info!("Request channel closed, stopping BLE driver");
                return Ok(());
            }
            Step::Request(Some(Request::StartScan(filter))) => {
                if discovery.is_some() {
                    continue;
                }
                let uuids = match filter {
                    Some(uuid) => HashSet::from([uuid]),
                    None => HashSet::new(),
                };
                if let Err(e) = adapter
                    .set_discovery_filter(DiscoveryFilter {
                        uuids,
                        ..Default::default()
                    })
                    .await
                {
                    warn!("Failed to set discovery filter: {}", e);
                }
                match adapter.discover_devices().await {
                    Ok(stream) => discovery = Some(Box::pin(stream)),
                    Err(e) => error!("Failed to start discovery: {}", e),
                }
            }
            Step::Request(Some(Request::StopScan)) => {
                // Dropping the stream ends discovery.
                discovery = None;
            }
            Step::Request(Some(request)) => {
                let adapter = adapter.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    handle_request(request, adapter, events).await;
                });
            }
            Step::Discovery(Some(AdapterEvent::DeviceAdded(addr))) => {
                emit_discovered(&adapter, addr, &events).await;
            }
            Step::Discovery(Some(_)) => {}
            Step::Discovery(None) => {
                debug!("Discovery stream ended");
                discovery = None;
            }
        }
    }
}

/// Poll the active discovery stream, or park until one exists.
async fn next_discovery(discovery: &mut Option<DiscoveryStream>) -> Option<AdapterEvent> {
    match discovery {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn handle_request(request: Request, adapter: Adapter, events: mpsc::Sender<TransportEvent>) {
    match request {
        Request::Connect(handle) => {
            let id = DeviceId::new(handle.as_str());
            match connect_device(&adapter, &handle).await {
                Ok(()) => {
                    let _ = events.send(TransportEvent::Connected { id }).await;
                }
                Err(e) => {
                    let _ = events
                        .send(TransportEvent::ConnectFailed {
                            id,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }
        Request::Disconnect(handle) => {
            if let Ok(device) = device_for(&adapter, &handle) {
                let _ = device.disconnect().await;
            }
        }
        Request::DiscoverServices(handle, _service) => {
            // BlueZ resolves the whole service tree at once; the manager
            // checks membership in the returned list.
            let id = DeviceId::new(handle.as_str());
            let event = match list_services(&adapter, &handle).await {
                Ok(services) => TransportEvent::ServicesDiscovered {
                    id,
                    services,
                    error: None,
                },
                Err(e) => TransportEvent::ServicesDiscovered {
                    id,
                    services: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            let _ = events.send(event).await;
        }
        Request::DiscoverCharacteristics(handle, service, _characteristic) => {
            let id = DeviceId::new(handle.as_str());
            let event = match list_characteristics(&adapter, &handle, service).await {
                Ok(characteristics) => TransportEvent::CharacteristicsDiscovered {
                    id,
                    service,
                    characteristics,
                    error: None,
                },
                Err(e) => TransportEvent::CharacteristicsDiscovered {
                    id,
                    service,
                    characteristics: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            let _ = events.send(event).await;
        }
        Request::SetNotify(handle, characteristic, enabled) => {
            if enabled {
                notify_loop(adapter, handle, characteristic, events).await;
            }
        }
        Request::StartScan(_) | Request::StopScan => {
            // Handled in the driver loop; never reaches here.
        }
    }
}

/// Surface peripherals the stack already holds connections to, so bonded
/// devices reconnected by the OS are adopted without a scan.
async fn report_already_connected(adapter: &Adapter, events: &mpsc::Sender<TransportEvent>) {
    let addresses = match adapter.device_addresses().await {
        Ok(addresses) => addresses,
        Err(e) => {
            warn!("Failed to enumerate known devices: {}", e);
            return;
        }
    };
    for addr in addresses {
        let Ok(device) = adapter.device(addr) else { continue };
        if !device.is_connected().await.unwrap_or(false) {
            continue;
        }
        let has_hr = matches!(
            device.uuids().await,
            Ok(Some(uuids)) if uuids.contains(&HR_SERVICE_UUID)
        );
        if !has_hr {
            continue;
        }
        let name = device.name().await.ok().flatten();
        info!("Adopting already-connected device {} ({:?})", addr, name);
        let _ = events
            .send(TransportEvent::AlreadyConnected {
                id: DeviceId::new(addr.to_string()),
                handle: PeripheralHandle::new(addr.to_string()),
                name,
            })
            .await;
    }
}

async fn emit_discovered(adapter: &Adapter, addr: Address, events: &mpsc::Sender<TransportEvent>) {
    let Ok(device) = adapter.device(addr) else { return };
    let name = device.name().await.ok().flatten();
    let rssi = device.rssi().await.ok().flatten().unwrap_or(0);
    debug!("Discovered {} ({:?}) RSSI={}", addr, name, rssi);
    let _ = events
        .send(TransportEvent::Discovered {
            id: DeviceId::new(addr.to_string()),
            handle: PeripheralHandle::new(addr.to_string()),
            name,
            // BlueZ folds the advertised local name into the name property.
            adv_name: None,
        })
        .await;
}

fn device_for(adapter: &Adapter, handle: &PeripheralHandle) -> Result<Device, BoxError> {
    let address: Address = handle
        .as_str()
        .parse()
        .map_err(|e| format!("invalid address '{}': {}", handle, e))?;
    Ok(adapter.device(address)?)
}

async fn connect_device(adapter: &Adapter, handle: &PeripheralHandle) -> Result<(), BoxError> {
    let device = device_for(adapter, handle)?;
    if !device.is_connected().await? {
        debug!("Connecting to {}...", handle);
        device.connect().await?;
    }
    Ok(())
}

/// Wait for service resolution and return every service UUID on the device.
async fn list_services(adapter: &Adapter, handle: &PeripheralHandle) -> Result<Vec<Uuid>, BoxError> {
    let device = device_for(adapter, handle)?;

    for _ in 0..20 {
        if device.is_services_resolved().await? {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let mut uuids = Vec::new();
    for service in device.services().await? {
        uuids.push(service.uuid().await?);
    }
    Ok(uuids)
}

/// Return the characteristic UUIDs of one service, or an empty list if the
/// service has vanished since service discovery.
async fn list_characteristics(
    adapter: &Adapter,
    handle: &PeripheralHandle,
    service: Uuid,
) -> Result<Vec<Uuid>, BoxError> {
    let device = device_for(adapter, handle)?;
    let mut uuids = Vec::new();
    for svc in device.services().await? {
        if svc.uuid().await? != service {
            continue;
        }
        for characteristic in svc.characteristics().await? {
            uuids.push(characteristic.uuid().await?);
        }
    }
    Ok(uuids)
}

async fn find_characteristic(
    device: &Device,
    characteristic: Uuid,
) -> Result<Characteristic, BoxError> {
    for service in device.services().await? {
        for chr in service.characteristics().await? {
            if chr.uuid().await? == characteristic {
                return Ok(chr);
            }
        }
    }
    Err(format!("characteristic {} not found", characteristic).into())
}

/// Stream notifications until the peripheral drops the link, then report
/// the disconnect. Subscription failures are reported the same way so the
/// manager schedules a retry.
async fn notify_loop(
    adapter: Adapter,
    handle: PeripheralHandle,
    characteristic: Uuid,
    events: mpsc::Sender<TransportEvent>,
) {
    let id = DeviceId::new(handle.as_str());

    let stream = async {
        let device = device_for(&adapter, &handle)?;
        let chr = find_characteristic(&device, characteristic).await?;
        Ok::<_, BoxError>(chr.notify().await?)
    }
    .await;

    match stream {
        Ok(stream) => {
            debug!("Subscribed to notifications on {}", handle);
            let mut stream = Box::pin(stream);
            while let Some(data) = stream.next().await {
                let event = TransportEvent::Notification {
                    id: id.clone(),
                    data,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            debug!("Notification stream ended for {}", handle);
            let _ = events.send(TransportEvent::Disconnected { id }).await;
        }
        Err(e) => {
            warn!("Failed to subscribe on {}: {}", handle, e);
            let _ = events.send(TransportEvent::Disconnected { id }).await;
        }
    }
}
