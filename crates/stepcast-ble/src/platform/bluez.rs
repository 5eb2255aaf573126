//! Linux peripheral backend using bluer (BlueZ)
//!
//! BlueZ owns the GATT database and the advertising set; the raw HCI socket is
//! used only for controller commands such as the address query. Every request
//! BlueZ forwards is turned into a [`TransportEvent`] and answered through the
//! event's responder.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, Session};
use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use stepcast_core::gatt::CharacteristicDescriptor;
use stepcast_core::{
    AdvertisementPacket, AttStatus, ConnHandle, DeviceConfig, DeviceOpenError, DeviceState,
    HciError, HciTransport, Notifier, PeerId, PeripheralTransport, RawCommand, ReadRequest,
    ServiceDescriptor, TransportError, TransportEvent, Uuid16, WriteRequest,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::hci_socket::{HciSocket, SharedHciSocket};
use super::EVENT_BUFFER;

/// First connection handle assigned to a central
const FIRST_CONN_HANDLE: ConnHandle = 0x0040;

// ----------------------------------------------------------------------------
// Link Table
// ----------------------------------------------------------------------------

/// Connected centrals as seen through BlueZ device properties
#[derive(Debug)]
struct LinkTable {
    next_handle: ConnHandle,
    connected: HashMap<Address, ConnHandle>,
    last_connected: Option<PeerId>,
}

impl Default for LinkTable {
    fn default() -> Self {
        Self {
            next_handle: FIRST_CONN_HANDLE,
            connected: HashMap::new(),
            last_connected: None,
        }
    }
}

impl LinkTable {
    /// Record a new link. Returns `None` if the device was already connected.
    fn link_up(&mut self, address: Address) -> Option<ConnHandle> {
        if self.connected.contains_key(&address) {
            return None;
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(FIRST_CONN_HANDLE);
        self.connected.insert(address, handle);
        self.last_connected = Some(peer_id(address));
        Some(handle)
    }

    fn link_down(&mut self, address: Address) -> Option<ConnHandle> {
        let handle = self.connected.remove(&address)?;
        if self.last_connected.as_ref() == Some(&peer_id(address)) {
            self.last_connected = None;
        }
        Some(handle)
    }
}

fn peer_id(address: Address) -> PeerId {
    PeerId::new(address.to_string())
}

fn req_error(status: AttStatus) -> ReqError {
    match status {
        AttStatus::ReadNotPermitted | AttStatus::WriteNotPermitted => ReqError::NotPermitted,
        AttStatus::RequestNotSupported => ReqError::NotSupported,
        AttStatus::InvalidOffset => ReqError::InvalidOffset,
        AttStatus::InvalidPayload => ReqError::InvalidValueLength,
        _ => ReqError::Failed,
    }
}

/// Translate an encoded advertising payload into BlueZ's advertisement
/// object. BlueZ sets the flags field itself.
fn to_bluez_advertisement(packet: &AdvertisementPacket) -> Result<Advertisement, TransportError> {
    packet
        .fields()
        .map_err(|e| TransportError::Advertising(e.to_string()))?;

    let mut service_uuids: BTreeSet<uuid::Uuid> = packet
        .service_uuids()
        .into_iter()
        .map(Uuid16::to_uuid)
        .collect();
    service_uuids.extend(packet.service_uuids_128());

    let manufacturer_data: BTreeMap<u16, Vec<u8>> =
        packet.manufacturer_data().into_iter().collect();

    Ok(Advertisement {
        advertisement_type: AdvertisementType::Peripheral,
        service_uuids,
        manufacturer_data,
        local_name: packet.local_name(),
        discoverable: Some(true),
        ..Default::default()
    })
}

// ----------------------------------------------------------------------------
// Subscription Table
// ----------------------------------------------------------------------------

/// Live notifiers keyed by characteristic. Each notifier has its own lock; the
/// table lock is never held across a push.
struct SubscriptionTable<N> {
    entries: Mutex<HashMap<Uuid16, Arc<Mutex<N>>>>,
}

impl<N> SubscriptionTable<N> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn insert(&self, characteristic: Uuid16, notifier: N) {
        self.entries
            .lock()
            .await
            .insert(characteristic, Arc::new(Mutex::new(notifier)));
    }

    async fn get(&self, characteristic: Uuid16) -> Option<Arc<Mutex<N>>> {
        self.entries.lock().await.get(&characteristic).cloned()
    }

    /// Drop `entry` unless a newer subscription already replaced it
    async fn remove(&self, characteristic: Uuid16, entry: &Arc<Mutex<N>>) {
        let mut entries = self.entries.lock().await;
        if entries
            .get(&characteristic)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(&characteristic);
        }
    }

    async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

// ----------------------------------------------------------------------------
// BlueZ Peripheral
// ----------------------------------------------------------------------------

/// Peripheral backend bound to one BlueZ adapter and its raw HCI socket
pub struct BluezPeripheral {
    _session: Session,
    adapter: Adapter,
    hci: SharedHciSocket,
    events: mpsc::Sender<TransportEvent>,
    links: Arc<Mutex<LinkTable>>,
    subscriptions: Arc<SubscriptionTable<CharacteristicNotifier>>,
    application: Mutex<Option<ApplicationHandle>>,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    monitor: JoinHandle<()>,
}

impl BluezPeripheral {
    /// Open the adapter `hci<N>` named by the configuration. Any failure here
    /// means the device cannot be used at all.
    pub async fn open(
        config: &DeviceConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>), DeviceOpenError> {
        let session = Session::new()
            .await
            .map_err(|e| DeviceOpenError::Session(e.to_string()))?;

        let adapter_name = format!("hci{}", config.hci_index);
        let adapter = session
            .adapter(&adapter_name)
            .map_err(|e| DeviceOpenError::Adapter(format!("{}: {}", adapter_name, e)))?;
        let address = adapter
            .address()
            .await
            .map_err(|e| DeviceOpenError::Adapter(format!("{}: {}", adapter_name, e)))?;

        if let Err(e) = adapter.set_alias(config.device_name.clone()).await {
            warn!("Failed to set adapter alias: {}", e);
        }

        let hci = SharedHciSocket::new(HciSocket::open(
            config.hci_index,
            config.address_timeout(),
        )?);

        if !adapter.is_powered().await.unwrap_or(false) {
            if let Err(e) = adapter.set_powered(true).await {
                warn!("Failed to power on {}: {}", adapter_name, e);
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let links = Arc::new(Mutex::new(LinkTable::default()));
        let monitor = tokio::spawn(monitor_adapter(
            adapter.clone(),
            events_tx.clone(),
            links.clone(),
        ));

        info!("Opened BLE adapter {} ({})", adapter_name, address);

        Ok((
            Arc::new(Self {
                _session: session,
                adapter,
                hci,
                events: events_tx,
                links,
                subscriptions: Arc::new(SubscriptionTable::new()),
                application: Mutex::new(None),
                advertisement: Mutex::new(None),
                monitor,
            }),
            events_rx,
        ))
    }

    fn build_characteristic(&self, descriptor: &CharacteristicDescriptor) -> Characteristic {
        let uuid = descriptor.uuid;
        Characteristic {
            uuid: uuid.to_uuid(),
            read: descriptor.properties.read.then(|| self.read_method(uuid)),
            write: descriptor.properties.write.then(|| self.write_method(uuid)),
            notify: descriptor.properties.notify.then(|| self.notify_method(uuid)),
            ..Default::default()
        }
    }

    fn read_method(&self, characteristic: Uuid16) -> CharacteristicRead {
        let events = self.events.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
                let events = events.clone();
                Box::pin(async move {
                    let (respond, answer) = oneshot::channel();
                    let request = ReadRequest {
                        peer: peer_id(req.device_address),
                        offset: req.offset,
                    };
                    events
                        .send(TransportEvent::ReadRequest {
                            characteristic,
                            request,
                            respond,
                        })
                        .await
                        .map_err(|_| ReqError::Failed)?;

                    match answer.await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(status)) => Err(req_error(status)),
                        Err(_) => Err(ReqError::Failed),
                    }
                })
            }),
            ..Default::default()
        }
    }

    fn write_method(&self, characteristic: Uuid16) -> CharacteristicWrite {
        let events = self.events.clone();
        CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |data: Vec<u8>, req: CharacteristicWriteRequest| {
                    let events = events.clone();
                    Box::pin(async move {
                        debug!(
                            "Write on {} from {}: {}",
                            characteristic,
                            req.device_address,
                            hex::encode(&data)
                        );
                        let (respond, answer) = oneshot::channel();
                        let request = WriteRequest {
                            peer: peer_id(req.device_address),
                            offset: req.offset,
                            data,
                        };
                        events
                            .send(TransportEvent::WriteRequest {
                                characteristic,
                                request,
                                respond,
                            })
                            .await
                            .map_err(|_| ReqError::Failed)?;

                        match answer.await {
                            Ok(AttStatus::Success) => Ok(()),
                            Ok(status) => Err(req_error(status)),
                            Err(_) => Err(ReqError::Failed),
                        }
                    })
                },
            )),
            ..Default::default()
        }
    }

    /// BlueZ hands over a notifier per subscription without naming the
    /// subscriber, so the subscription is attributed to the most recently
    /// connected central.
    fn notify_method(&self, characteristic: Uuid16) -> CharacteristicNotify {
        let events = self.events.clone();
        let links = self.links.clone();
        let subscriptions = self.subscriptions.clone();
        CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let events = events.clone();
                let links = links.clone();
                let subscriptions = subscriptions.clone();
                Box::pin(async move {
                    subscriptions.insert(characteristic, notifier).await;

                    let peer = links.lock().await.last_connected.clone();
                    match peer {
                        Some(peer) => {
                            debug!("{} subscribed to {}", peer, characteristic);
                            let request = TransportEvent::NotifyRequest {
                                peer,
                                characteristic,
                            };
                            if events.send(request).await.is_err() {
                                warn!(
                                    "Device controller gone, dropping subscription to {}",
                                    characteristic
                                );
                            }
                        }
                        None => warn!("Subscription to {} with no connected central", characteristic),
                    }
                })
            })),
            ..Default::default()
        }
    }
}

impl Drop for BluezPeripheral {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

#[async_trait]
impl HciTransport for BluezPeripheral {
    async fn send_raw_command(&self, command: RawCommand) -> Result<Vec<u8>, HciError> {
        self.hci.send_raw_command(command).await
    }
}

#[async_trait]
impl PeripheralTransport for BluezPeripheral {
    async fn add_service(&self, service: &ServiceDescriptor) -> Result<(), TransportError> {
        let characteristics = service
            .characteristics
            .iter()
            .map(|c| self.build_characteristic(c))
            .collect();

        let app = Application {
            services: vec![Service {
                uuid: service.uuid.to_uuid(),
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| TransportError::ServiceRegistration(e.to_string()))?;
        *self.application.lock().await = Some(handle);

        info!("GATT service {} registered with BlueZ", service.uuid);
        Ok(())
    }

    async fn remove_service(&self) -> Result<(), TransportError> {
        // Dropping the handle unregisters the application
        if self.application.lock().await.take().is_some() {
            self.subscriptions.clear().await;
            info!("GATT service unregistered");
        }
        Ok(())
    }

    async fn start_advertising(&self, packet: &AdvertisementPacket) -> Result<(), TransportError> {
        let advertisement = to_bluez_advertisement(packet)?;
        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| TransportError::Advertising(e.to_string()))?;
        *self.advertisement.lock().await = Some(handle);

        info!("Started BLE advertising ({} bytes)", packet.len());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        if self.advertisement.lock().await.take().is_some() {
            info!("Stopped BLE advertising");
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for BluezPeripheral {
    async fn notify(
        &self,
        peer: &PeerId,
        handle: ConnHandle,
        characteristic: Uuid16,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let subscription = self
            .subscriptions
            .get(characteristic)
            .await
            .ok_or_else(|| {
                TransportError::Notify(format!("no subscription for {}", characteristic))
            })?;

        let mut notifier = subscription.lock().await;
        if notifier.is_stopped() {
            drop(notifier);
            self.subscriptions.remove(characteristic, &subscription).await;
            return Err(TransportError::Notify(format!(
                "subscription for {} ended",
                characteristic
            )));
        }

        notifier
            .notify(payload.to_vec())
            .await
            .map_err(|e| TransportError::Notify(e.to_string()))?;
        debug!(
            "Notified {} (handle 0x{:04x}) on {}",
            peer, handle, characteristic
        );
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Adapter Monitor
// ----------------------------------------------------------------------------

async fn monitor_adapter(
    adapter: Adapter,
    events: mpsc::Sender<TransportEvent>,
    links: Arc<Mutex<LinkTable>>,
) {
    info!("Adapter monitor started");
    if let Err(e) = watch_adapter(&adapter, &events, &links).await {
        warn!("Adapter monitor failed: {}", e);
    }
    info!("Adapter monitor stopped");
}

async fn watch_adapter(
    adapter: &Adapter,
    events: &mpsc::Sender<TransportEvent>,
    links: &Mutex<LinkTable>,
) -> bluer::Result<()> {
    let mut devices: SelectAll<BoxStream<'static, (Address, DeviceEvent)>> = SelectAll::new();

    let powered = adapter.is_powered().await?;
    if !report_power(events, powered).await {
        return Ok(());
    }

    for address in adapter.device_addresses().await? {
        let device = adapter.device(address)?;
        if device.is_connected().await.unwrap_or(false) && !link_up(events, links, address).await {
            return Ok(());
        }
        devices.push(device.events().await?.map(move |e| (address, e)).boxed());
    }

    let mut adapter_events = adapter.events().await?.boxed();
    loop {
        let delivered = tokio::select! {
            event = adapter_events.next() => match event {
                Some(AdapterEvent::PropertyChanged(AdapterProperty::Powered(on))) => {
                    report_power(events, on).await
                }
                Some(AdapterEvent::DeviceAdded(address)) => {
                    let device = adapter.device(address)?;
                    devices.push(device.events().await?.map(move |e| (address, e)).boxed());
                    true
                }
                Some(AdapterEvent::DeviceRemoved(address)) => {
                    link_down(events, links, address).await
                }
                Some(_) => true,
                None => break,
            },
            Some((address, event)) = devices.next(), if !devices.is_empty() => match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) => {
                    link_up(events, links, address).await
                }
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                    link_down(events, links, address).await
                }
                _ => true,
            },
        };

        // The controller dropped its receiver
        if !delivered {
            break;
        }
    }
    Ok(())
}

async fn report_power(events: &mpsc::Sender<TransportEvent>, powered: bool) -> bool {
    let state = if powered {
        DeviceState::PoweredOn
    } else {
        DeviceState::Off
    };
    debug!("Adapter power state: {:?}", state);
    events
        .send(TransportEvent::StateChanged(state))
        .await
        .is_ok()
}

async fn link_up(
    events: &mpsc::Sender<TransportEvent>,
    links: &Mutex<LinkTable>,
    address: Address,
) -> bool {
    let Some(handle) = links.lock().await.link_up(address) else {
        return true;
    };
    events
        .send(TransportEvent::CentralConnected {
            peer: peer_id(address),
            handle,
        })
        .await
        .is_ok()
}

async fn link_down(
    events: &mpsc::Sender<TransportEvent>,
    links: &Mutex<LinkTable>,
    address: Address,
) -> bool {
    if links.lock().await.link_down(address).is_none() {
        return true;
    }
    events
        .send(TransportEvent::CentralDisconnected {
            peer: peer_id(address),
        })
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    use stepcast_core::services::pedometer_advertisement;
    use stepcast_core::HardwareAddress;
    use tokio_test::{assert_pending, assert_ready, task};

    const PEDOMETER: Uuid16 = Uuid16::new(0xFEA1);
    const TARGET: Uuid16 = Uuid16::new(0xFEA2);

    #[test]
    fn test_pending_push_leaves_table_usable() {
        let table = SubscriptionTable::new();
        tokio_test::block_on(async {
            table.insert(PEDOMETER, 1u32).await;
            table.insert(TARGET, 2u32).await;
        });

        let pedometer = tokio_test::block_on(table.get(PEDOMETER)).unwrap();
        // Stands in for a push to a stalled central
        let in_flight = tokio_test::block_on(pedometer.lock());

        let mut other = task::spawn(async {
            let target = table.get(TARGET).await.unwrap();
            let value = *target.lock().await;
            value
        });
        assert_eq!(assert_ready!(other.poll()), 2);

        let mut same = task::spawn(async { *pedometer.lock().await });
        assert_pending!(same.poll());

        let mut clear = task::spawn(table.clear());
        assert_ready!(clear.poll());

        drop(in_flight);
        assert!(same.is_woken());
        assert_eq!(assert_ready!(same.poll()), 1);
    }

    #[test]
    fn test_remove_keeps_newer_subscription() {
        tokio_test::block_on(async {
            let table = SubscriptionTable::new();
            table.insert(PEDOMETER, 1u32).await;
            let stale = table.get(PEDOMETER).await.unwrap();

            table.insert(PEDOMETER, 2u32).await;
            table.remove(PEDOMETER, &stale).await;
            let current = table.get(PEDOMETER).await.unwrap();
            assert_eq!(*current.lock().await, 2);

            table.remove(PEDOMETER, &current).await;
            assert!(table.get(PEDOMETER).await.is_none());
        });
    }

    #[test]
    fn test_link_table_assigns_handles() {
        let mut links = LinkTable::default();
        let a = Address::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let b = Address::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);

        assert_eq!(links.link_up(a), Some(FIRST_CONN_HANDLE));
        assert_eq!(links.link_up(a), None);
        assert_eq!(links.link_up(b), Some(FIRST_CONN_HANDLE + 1));
        assert_eq!(links.last_connected, Some(peer_id(b)));

        assert_eq!(links.link_down(b), Some(FIRST_CONN_HANDLE + 1));
        assert_eq!(links.last_connected, None);
        assert_eq!(links.link_down(b), None);
    }

    #[test]
    fn test_att_status_mapping() {
        assert!(matches!(
            req_error(AttStatus::InvalidOffset),
            ReqError::InvalidOffset
        ));
        assert!(matches!(
            req_error(AttStatus::WriteNotPermitted),
            ReqError::NotPermitted
        ));
        assert!(matches!(
            req_error(AttStatus::AttributeNotFound),
            ReqError::Failed
        ));
    }

    #[test]
    fn test_pedometer_advertisement_translation() {
        let address = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let packet = pedometer_advertisement(&DeviceConfig::default(), address).unwrap();
        let advertisement = to_bluez_advertisement(&packet).unwrap();

        assert_eq!(advertisement.local_name.as_deref(), Some("WeixinBLE"));
        assert!(advertisement
            .service_uuids
            .contains(&Uuid16::new(0xFEE7).to_uuid()));
        assert_eq!(
            advertisement.manufacturer_data.get(&0x2333),
            Some(&vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
    }
}
