//! [`Central`] implementation over the btleplug host stack.
//!
//! btleplug hides ATT handles behind UUID-keyed `Characteristic` and
//! `Descriptor` objects, while the bridge addresses attributes by handle. The
//! adapter papers over the gap with a synthetic handle table built at
//! discovery time: characteristic values and their descriptors are numbered
//! in ascending order, descriptors directly after the value they belong to,
//! and every GATT call translates back through the table.
//!
//! Unsolicited stack traffic (advertisements, disconnects, notifications) is
//! pumped from btleplug's event streams into the bridge's central-event
//! channel by background tasks spawned at construction and per connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central as _, CentralEvent as StackEvent, Characteristic, Descriptor, Manager as _,
    Peripheral as _, ScanFilter, Service, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use gattbridge_app::ports::central::{Central, CentralError, CentralEvent, ConnId, GattAttribute};
use gattbridge_domain::addr::PeerAddr;
use gattbridge_domain::filter::DeviceFilter;
use gattbridge_domain::oob::OobSecret;

use crate::error;

/// First synthetic attribute handle handed out per discovery.
const FIRST_HANDLE: u16 = 1;

/// Upper bound on a single connect attempt. BlueZ applies its own supervision
/// timeout; this bounds backends that do not.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The scan session installed by [`Central::start_scan`].
///
/// Match reporting is edge-triggered: `matched` latches after the first hit
/// so a chatty advertiser cannot flood the bridge with duplicate matches.
struct ActiveScan {
    filter: DeviceFilter,
    matched: bool,
}

/// What a synthetic handle resolves to on the wire.
#[derive(Clone)]
enum RowTarget {
    Value(Characteristic),
    Descriptor(Descriptor),
}

/// One row of the synthetic handle table.
struct AttributeRow {
    attr: GattAttribute,
    target: RowTarget,
}

/// Book-keeping for one established connection.
struct ConnEntry {
    peripheral: Peripheral,
    peer_id: PeripheralId,
    addr: PeerAddr,
    rows: Vec<AttributeRow>,
    /// Characteristic value UUID to synthetic handle, for notification routing.
    by_uuid: BTreeMap<Uuid, u16>,
    notify_task: tokio::task::JoinHandle<()>,
}

/// State shared between trait methods and the pump tasks.
struct State {
    scan: Option<ActiveScan>,
    conns: BTreeMap<ConnId, ConnEntry>,
    bonded: Vec<PeerAddr>,
}

/// BLE central backed by the first btleplug adapter on the host.
///
/// btleplug exposes no bond store, so the bonded-peer list is seeded from
/// configuration at construction and held for the life of the process. It
/// also exposes no security-manager surface; the out-of-band material calls
/// report [`CentralError::Unsupported`] and pairing is left to the platform
/// agent.
pub struct BtleplugCentral {
    adapter: Adapter,
    state: Arc<Mutex<State>>,
    events: mpsc::UnboundedSender<CentralEvent>,
    next_conn: AtomicU32,
}

impl BtleplugCentral {
    /// Acquire the first Bluetooth adapter on the host and start pumping its
    /// event stream into `events`.
    ///
    /// # Errors
    ///
    /// Returns [`CentralError::NotAvailable`] when the host has no adapter,
    /// or the mapped backend error when the manager cannot be reached.
    pub async fn create(
        events: mpsc::UnboundedSender<CentralEvent>,
        known_peers: Vec<PeerAddr>,
    ) -> Result<Self, CentralError> {
        let manager = Manager::new().await.map_err(error::map_backend)?;
        let adapters = manager.adapters().await.map_err(error::map_backend)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(CentralError::NotAvailable)?;

        let state = Arc::new(Mutex::new(State {
            scan: None,
            conns: BTreeMap::new(),
            bonded: known_peers,
        }));

        tokio::spawn(pump_events(
            adapter.clone(),
            Arc::clone(&state),
            events.clone(),
        ));

        Ok(Self {
            adapter,
            state,
            events,
            next_conn: AtomicU32::new(1),
        })
    }

    /// Look up a discovered peripheral by address.
    async fn find_peripheral(&self, addr: PeerAddr) -> Result<Peripheral, CentralError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(error::map_backend)?;
        peripherals
            .into_iter()
            .find(|peripheral| peer_addr(peripheral.address()) == addr)
            .ok_or(CentralError::UnknownPeer(addr))
    }

    /// Clone the peripheral behind an established connection.
    async fn peripheral_for(&self, conn: ConnId) -> Result<Peripheral, CentralError> {
        let state = self.state.lock().await;
        state
            .conns
            .get(&conn)
            .map(|entry| entry.peripheral.clone())
            .ok_or(CentralError::NotConnected(conn))
    }

    /// Resolve a synthetic handle on `conn` to its wire-level target.
    async fn target_at(
        &self,
        conn: ConnId,
        handle: u16,
    ) -> Result<(Peripheral, RowTarget), CentralError> {
        let state = self.state.lock().await;
        let entry = state
            .conns
            .get(&conn)
            .ok_or(CentralError::NotConnected(conn))?;
        let target = entry
            .rows
            .iter()
            .find(|row| row.attr.handle == handle)
            .map(|row| row.target.clone())
            .ok_or_else(|| CentralError::Backend(format!("no attribute at handle {handle}")))?;
        Ok((entry.peripheral.clone(), target))
    }

    /// Resolve a synthetic handle that must be a characteristic value.
    async fn characteristic_at(
        &self,
        conn: ConnId,
        value_handle: u16,
    ) -> Result<(Peripheral, Characteristic), CentralError> {
        match self.target_at(conn, value_handle).await? {
            (peripheral, RowTarget::Value(characteristic)) => Ok((peripheral, characteristic)),
            (_, RowTarget::Descriptor(_)) => Err(CentralError::Backend(format!(
                "handle {value_handle} is not a characteristic value"
            ))),
        }
    }
}

impl Central for BtleplugCentral {
    async fn start_scan(&self, filter: DeviceFilter) -> Result<(), CentralError> {
        let replaced = {
            let mut state = self.state.lock().await;
            state
                .scan
                .replace(ActiveScan {
                    filter,
                    matched: false,
                })
                .is_some()
        };
        if replaced {
            // Filter replacement: the backend restarts with the new filter below.
            if let Err(err) = self.adapter.stop_scan().await {
                tracing::debug!(%err, "stop before scan filter replacement failed");
            }
        }

        let services = match filter {
            DeviceFilter::ServiceUuid(uuid) => vec![uuid],
            DeviceFilter::Address(_) => Vec::new(),
        };
        if let Err(err) = self.adapter.start_scan(ScanFilter { services }).await {
            self.state.lock().await.scan = None;
            return Err(error::map_backend(err));
        }
        tracing::debug!(%filter, "scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), CentralError> {
        let was_scanning = self.state.lock().await.scan.take().is_some();
        if !was_scanning {
            return Ok(());
        }
        self.adapter.stop_scan().await.map_err(error::map_backend)
    }

    async fn connect(&self, addr: PeerAddr) -> Result<ConnId, CentralError> {
        let peripheral = self.find_peripheral(addr).await?;

        tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| CentralError::Timeout)?
            .map_err(|err| match err {
                btleplug::Error::DeviceNotFound => CentralError::UnknownPeer(addr),
                other => error::map_backend(other),
            })?;

        let notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                // A link we cannot receive notifications on is useless to the
                // bridge; close it rather than hand back a half-working token.
                if let Err(err) = peripheral.disconnect().await {
                    tracing::warn!(%err, %addr, "disconnect after notification setup failure");
                }
                return Err(error::map_backend(err));
            }
        };

        let conn = ConnId::new(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let notify_task = tokio::spawn(pump_notifications(
            conn,
            notifications,
            Arc::clone(&self.state),
            self.events.clone(),
        ));

        let entry = ConnEntry {
            peer_id: peripheral.id(),
            addr,
            peripheral,
            rows: Vec::new(),
            by_uuid: BTreeMap::new(),
            notify_task,
        };
        self.state.lock().await.conns.insert(conn, entry);

        tracing::info!(%addr, %conn, "link established");
        Ok(conn)
    }

    async fn disconnect(&self, conn: ConnId) -> Result<(), CentralError> {
        let peripheral = {
            let state = self.state.lock().await;
            state.conns.get(&conn).map(|entry| entry.peripheral.clone())
        };
        // Entry removal rides on the DeviceDisconnected stack event so local
        // and remote teardown share one path.
        let Some(peripheral) = peripheral else {
            return Ok(());
        };
        peripheral
            .disconnect()
            .await
            .map_err(|err| error::map_gatt(conn, err))
    }

    async fn bonded_peers(&self) -> Result<Vec<PeerAddr>, CentralError> {
        Ok(self.state.lock().await.bonded.clone())
    }

    async fn discover(
        &self,
        conn: ConnId,
        service: Uuid,
    ) -> Result<Vec<GattAttribute>, CentralError> {
        let peripheral = self.peripheral_for(conn).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|err| error::map_gatt(conn, err))?;

        let found = peripheral
            .services()
            .into_iter()
            .find(|candidate| candidate.uuid == service)
            .ok_or(CentralError::ServiceNotFound(service))?;

        let (rows, by_uuid) = build_rows(&found);
        let attrs = rows.iter().map(|row| row.attr).collect();

        let mut state = self.state.lock().await;
        if let Some(entry) = state.conns.get_mut(&conn) {
            entry.rows = rows;
            entry.by_uuid = by_uuid;
        }
        Ok(attrs)
    }

    async fn subscribe(
        &self,
        conn: ConnId,
        value_handle: u16,
        _ccc_handle: u16,
    ) -> Result<(), CentralError> {
        // btleplug writes the CCC descriptor itself; the descriptor handle is
        // only advisory here.
        let (peripheral, characteristic) = self.characteristic_at(conn, value_handle).await?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|err| error::map_gatt(conn, err))
    }

    async fn unsubscribe(&self, conn: ConnId, value_handle: u16) -> Result<(), CentralError> {
        let (peripheral, characteristic) = self.characteristic_at(conn, value_handle).await?;
        peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(|err| error::map_gatt(conn, err))
    }

    async fn read(&self, conn: ConnId, handle: u16) -> Result<Vec<u8>, CentralError> {
        let (peripheral, target) = self.target_at(conn, handle).await?;
        match target {
            RowTarget::Value(characteristic) => peripheral.read(&characteristic).await,
            RowTarget::Descriptor(descriptor) => peripheral.read_descriptor(&descriptor).await,
        }
        .map_err(|err| error::map_gatt(conn, err))
    }

    async fn local_oob(&self) -> Result<OobSecret, CentralError> {
        Err(CentralError::Unsupported("LE out-of-band material"))
    }

    async fn set_oob_pair(
        &self,
        _local: Option<OobSecret>,
        _remote: Option<OobSecret>,
    ) -> Result<(), CentralError> {
        Err(CentralError::Unsupported("LE out-of-band material"))
    }
}

/// Convert a stack address into the bridge's address type.
fn peer_addr(addr: BDAddr) -> PeerAddr {
    PeerAddr::new(addr.into_inner())
}

/// Number a service's attributes into a synthetic handle table.
///
/// Characteristic values come first, each followed by its own descriptors,
/// so a CCC descriptor always lands after the value it configures. Returns
/// the table plus the value-UUID index used for notification routing.
fn build_rows(service: &Service) -> (Vec<AttributeRow>, BTreeMap<Uuid, u16>) {
    let mut rows = Vec::new();
    let mut by_uuid = BTreeMap::new();
    let mut next = FIRST_HANDLE;

    for characteristic in &service.characteristics {
        by_uuid.insert(characteristic.uuid, next);
        rows.push(AttributeRow {
            attr: GattAttribute {
                handle: next,
                uuid: characteristic.uuid,
            },
            target: RowTarget::Value(characteristic.clone()),
        });
        next += 1;

        for descriptor in &characteristic.descriptors {
            rows.push(AttributeRow {
                attr: GattAttribute {
                    handle: next,
                    uuid: descriptor.uuid,
                },
                target: RowTarget::Descriptor(descriptor.clone()),
            });
            next += 1;
        }
    }

    (rows, by_uuid)
}

/// Decide whether an advertisement completes the active scan, latching the
/// session so only the first hit reports.
fn scan_hit(scan: &mut Option<ActiveScan>, addr: PeerAddr, services: &[Uuid]) -> bool {
    let Some(session) = scan else {
        return false;
    };
    if session.matched || !session.filter.matches(addr, services) {
        return false;
    }
    session.matched = true;
    true
}

/// Translate the adapter's event stream into bridge central events.
///
/// Runs until the stream ends or the bridge drops its receiver.
async fn pump_events(
    adapter: Adapter,
    state: Arc<Mutex<State>>,
    events: mpsc::UnboundedSender<CentralEvent>,
) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(%err, "cannot subscribe to adapter events");
            return;
        }
    };

    while let Some(event) = stream.next().await {
        if events.is_closed() {
            break;
        }
        match event {
            StackEvent::DeviceDiscovered(id) | StackEvent::DeviceUpdated(id) => {
                on_advertisement(&adapter, &state, &events, &id, None).await;
            }
            StackEvent::ServicesAdvertisement { id, services } => {
                on_advertisement(&adapter, &state, &events, &id, Some(services)).await;
            }
            StackEvent::ServiceDataAdvertisement { id, service_data } => {
                let services = service_data.keys().copied().collect();
                on_advertisement(&adapter, &state, &events, &id, Some(services)).await;
            }
            StackEvent::DeviceDisconnected(id) => {
                on_disconnected(&state, &events, &id).await;
            }
            _ => {}
        }
    }
    tracing::debug!("adapter event pump stopped");
}

/// Check one advertisement against the active scan filter.
async fn on_advertisement(
    adapter: &Adapter,
    state: &Mutex<State>,
    events: &mpsc::UnboundedSender<CentralEvent>,
    id: &PeripheralId,
    services_hint: Option<Vec<Uuid>>,
) {
    if state.lock().await.scan.is_none() {
        return;
    }
    let Ok(peripheral) = adapter.peripheral(id).await else {
        return;
    };
    let addr = peer_addr(peripheral.address());
    let services = match services_hint {
        Some(list) => list,
        None => match peripheral.properties().await {
            Ok(Some(props)) => props.services,
            _ => Vec::new(),
        },
    };

    let mut state = state.lock().await;
    if scan_hit(&mut state.scan, addr, &services) {
        tracing::debug!(%addr, "scan filter matched");
        let _ = events.send(CentralEvent::ScanMatch { addr });
    }
}

/// Retire the connection owning `id`, if any, and report the loss.
async fn on_disconnected(
    state: &Mutex<State>,
    events: &mpsc::UnboundedSender<CentralEvent>,
    id: &PeripheralId,
) {
    let removed = {
        let mut state = state.lock().await;
        let conn = state
            .conns
            .iter()
            .find(|(_, entry)| entry.peer_id == *id)
            .map(|(conn, _)| *conn);
        conn.and_then(|conn| state.conns.remove(&conn).map(|entry| (conn, entry)))
    };
    let Some((conn, entry)) = removed else {
        return;
    };
    entry.notify_task.abort();
    tracing::debug!(%conn, addr = %entry.addr, "link closed");
    // btleplug does not surface the HCI reason code.
    let _ = events.send(CentralEvent::Disconnected { conn, reason: 0 });
}

/// Forward notifications for one connection, translating characteristic
/// UUIDs back to synthetic handles.
async fn pump_notifications(
    conn: ConnId,
    stream: impl tokio_stream::Stream<Item = ValueNotification> + Send + 'static,
    state: Arc<Mutex<State>>,
    events: mpsc::UnboundedSender<CentralEvent>,
) {
    let mut stream = std::pin::pin!(stream);
    while let Some(notification) = stream.next().await {
        let handle = {
            let state = state.lock().await;
            state
                .conns
                .get(&conn)
                .and_then(|entry| entry.by_uuid.get(&notification.uuid).copied())
        };
        let Some(handle) = handle else {
            tracing::trace!(
                %conn,
                uuid = %notification.uuid,
                "notification for unmapped characteristic"
            );
            continue;
        };
        let event = CentralEvent::Notified {
            conn,
            handle,
            value: notification.value,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}
