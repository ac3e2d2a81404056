//! BLE link supervision: the connection slot pool and the scan singleton.
//!
//! State lives on the bridge event loop and is mutated nowhere else. Every
//! transport call that can block (connect, scan start/stop, disconnect) runs
//! in a spawned task; completions come back as loop events.
//!
//! Outcome contract: each logical connection request — a scan or a direct
//! bonded connect — produces **exactly one** terminal
//! [`BridgeEvent::ConnectOutcome`] for its owner, whether the link came up,
//! the scan timed out, the request was displaced by a newer scan, or the
//! connect attempt failed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use gattbridge_domain::addr::PeerAddr;
use gattbridge_domain::cluster::EndpointIndex;
use gattbridge_domain::filter::DeviceFilter;

use crate::bridge::{BridgeEvent, schedule_event};
use crate::ports::{Central, CentralError, ConnId};

/// Default size of the connection slot pool.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Slot {
    addr: PeerAddr,
    service: Uuid,
    owner: EndpointIndex,
    conn: Option<ConnId>,
}

#[derive(Debug, Clone, Copy)]
struct ScanSession {
    owner: EndpointIndex,
    service: Uuid,
    generation: u64,
}

/// Owns the slot pool and the at-most-one scan session.
pub struct ConnectivityManager<C> {
    central: Arc<C>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    slots: Vec<Option<Slot>>,
    scan: Option<ScanSession>,
    scan_generation: u64,
}

impl<C: Central> ConnectivityManager<C> {
    #[must_use]
    pub fn new(
        central: Arc<C>,
        events: mpsc::UnboundedSender<BridgeEvent>,
        max_connections: usize,
    ) -> Self {
        Self {
            central,
            events,
            slots: vec![None; max_connections],
            scan: None,
            scan_generation: 0,
        }
    }

    /// Start scanning on behalf of `owner`.
    ///
    /// A scan already in flight is displaced: its owner receives its
    /// terminal outcome first, then the new filter takes over.
    pub async fn start_scan(
        &mut self,
        owner: EndpointIndex,
        filter: DeviceFilter,
        service: Uuid,
        timeout: Duration,
    ) {
        if let Some(prev) = self.scan.take() {
            tracing::info!(owner = %prev.owner, "scan displaced by a newer request");
            self.deliver(prev.owner, None, prev.service);
        }
        self.scan_generation += 1;
        let generation = self.scan_generation;

        if let Err(err) = self.central.start_scan(filter).await {
            tracing::warn!(owner = %owner, error = %err, "failed to start scanning");
            self.deliver(owner, None, service);
            return;
        }

        tracing::info!(owner = %owner, %filter, timeout_ms = timeout.as_millis(), "scanning");
        self.scan = Some(ScanSession {
            owner,
            service,
            generation,
        });
        schedule_event(&self.events, timeout, BridgeEvent::ScanTimedOut { generation });
    }

    /// Stop scanning. Idempotent; a pending request receives its terminal
    /// outcome.
    pub async fn stop_scan(&mut self) {
        let Some(prev) = self.scan.take() else {
            return;
        };
        self.scan_generation += 1;
        if let Err(err) = self.central.stop_scan().await {
            tracing::warn!(error = %err, "failed to stop scanning");
        }
        self.deliver(prev.owner, None, prev.service);
    }

    /// A peripheral matched the active filter: stop scanning and connect.
    ///
    /// The scan session ends here without an outcome — the connect attempt
    /// now owns the terminal delivery.
    pub fn handle_scan_match(&mut self, addr: PeerAddr) {
        let Some(scan) = self.scan.take() else {
            tracing::debug!(%addr, "scan match without an active scan, ignoring");
            return;
        };
        self.scan_generation += 1;
        self.spawn_stop_scan();

        let Some(free) = self.slots.iter().position(Option::is_none) else {
            tracing::warn!(%addr, "no free connection slot, dropping match");
            self.deliver(scan.owner, None, scan.service);
            return;
        };
        tracing::info!(%addr, owner = %scan.owner, "matched, connecting");
        self.slots[free] = Some(Slot {
            addr,
            service: scan.service,
            owner: scan.owner,
            conn: None,
        });
        self.spawn_connect(addr);
    }

    /// Scan timer fired. Stale generations (the scan was stopped, displaced,
    /// or already matched) are ignored.
    pub fn handle_scan_timeout(&mut self, generation: u64) {
        let Some(scan) = self.scan else {
            return;
        };
        if scan.generation != generation {
            return;
        }
        self.scan = None;
        self.spawn_stop_scan();
        tracing::info!(owner = %scan.owner, "scan timed out");
        self.deliver(scan.owner, None, scan.service);
    }

    /// A spawned connect task finished.
    pub fn handle_connect_finished(
        &mut self,
        addr: PeerAddr,
        result: Result<ConnId, CentralError>,
    ) {
        let slot_pos = self
            .slots
            .iter()
            .position(|s| s.is_some_and(|s| s.addr == addr && s.conn.is_none()));
        match result {
            Ok(conn) => {
                let Some(pos) = slot_pos else {
                    // released while the attempt was in flight
                    tracing::warn!(%addr, %conn, "connected but slot is gone, disconnecting");
                    self.spawn_disconnect(conn);
                    return;
                };
                let Some(slot) = self.slots[pos].as_mut() else {
                    return;
                };
                slot.conn = Some(conn);
                let (owner, service) = (slot.owner, slot.service);
                tracing::info!(%addr, %conn, owner = %owner, "connected");
                self.deliver(owner, Some(conn), service);
            }
            Err(err) => {
                tracing::warn!(%addr, error = %err, "connect attempt failed");
                if let Some(pos) = slot_pos {
                    if let Some(slot) = self.slots[pos].take() {
                        self.deliver(slot.owner, None, slot.service);
                    }
                }
            }
        }
    }

    /// Try a direct connection to a bonded peer admitted by `filter`.
    ///
    /// With an address filter only that peer qualifies; otherwise the first
    /// bonded peer not already occupying a slot is taken. Returns `false`
    /// when no peer qualifies — the caller falls back to scanning.
    pub async fn connect_first_bonded(
        &mut self,
        owner: EndpointIndex,
        filter: &DeviceFilter,
        service: Uuid,
    ) -> bool {
        let peers = match self.central.bonded_peers().await {
            Ok(peers) => peers,
            Err(err) => {
                tracing::warn!(error = %err, "bond store unavailable");
                return false;
            }
        };
        let claimed =
            |addr: PeerAddr| self.slots.iter().any(|s| s.is_some_and(|s| s.addr == addr));
        let chosen = peers.into_iter().find(|peer| {
            !claimed(*peer)
                && match filter {
                    DeviceFilter::Address(addr) => peer == addr,
                    DeviceFilter::ServiceUuid(_) => true,
                }
        });
        let Some(addr) = chosen else {
            return false;
        };
        let Some(free) = self.slots.iter().position(Option::is_none) else {
            tracing::warn!(%addr, "no free connection slot for bonded peer");
            return false;
        };
        tracing::info!(%addr, owner = %owner, "connecting to bonded peer");
        self.slots[free] = Some(Slot {
            addr,
            service,
            owner,
            conn: None,
        });
        self.spawn_connect(addr);
        true
    }

    /// A link dropped. Slots the manager does not track (the host stack's
    /// own connections) are left alone; a tracked slot is freed and its
    /// owner returned so the device can run its link-down path.
    pub fn handle_disconnect(&mut self, conn: ConnId, reason: u8) -> Option<EndpointIndex> {
        let pos = self
            .slots
            .iter()
            .position(|s| s.is_some_and(|s| s.conn == Some(conn)))?;
        let slot = self.slots[pos].take()?;
        tracing::info!(addr = %slot.addr, %conn, reason, owner = %slot.owner, "disconnected");
        Some(slot.owner)
    }

    /// Endpoint owning an established connection.
    #[must_use]
    pub fn owner_of_conn(&self, conn: ConnId) -> Option<EndpointIndex> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.conn == Some(conn))
            .map(|s| s.owner)
    }

    /// Tear down everything `owner` holds: its scan session (silently — the
    /// owner is going away) and its slots, disconnecting live links.
    pub fn release_owner(&mut self, owner: EndpointIndex) {
        if self.scan.is_some_and(|scan| scan.owner == owner) {
            self.scan = None;
            self.scan_generation += 1;
            self.spawn_stop_scan();
        }
        let mut live = Vec::new();
        for slot in &mut self.slots {
            if slot.is_some_and(|s| s.owner == owner)
                && let Some(taken) = slot.take()
                && let Some(conn) = taken.conn
            {
                live.push(conn);
            }
        }
        for conn in live {
            self.spawn_disconnect(conn);
        }
    }

    /// Ask the central to drop a link; the disconnect event comes back
    /// through the regular path.
    pub fn disconnect(&self, conn: ConnId) {
        self.spawn_disconnect(conn);
    }

    /// Whether a scan session is pending.
    #[must_use]
    pub fn scanning(&self) -> bool {
        self.scan.is_some()
    }

    fn deliver(&self, owner: EndpointIndex, conn: Option<ConnId>, service: Uuid) {
        let _ = self.events.send(BridgeEvent::ConnectOutcome {
            owner,
            conn,
            service,
        });
    }

    fn spawn_connect(&self, addr: PeerAddr) {
        let central = Arc::clone(&self.central);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = central.connect(addr).await;
            let _ = events.send(BridgeEvent::ConnectAttempt { addr, result });
        });
    }

    fn spawn_stop_scan(&self) {
        let central = Arc::clone(&self.central);
        tokio::spawn(async move {
            if let Err(err) = central.stop_scan().await {
                tracing::warn!(error = %err, "failed to stop scanning");
            }
        });
    }

    fn spawn_disconnect(&self, conn: ConnId) {
        let central = Arc::clone(&self.central);
        tokio::spawn(async move {
            if let Err(err) = central.disconnect(conn).await {
                tracing::debug!(%conn, error = %err, "disconnect failed (link already gone?)");
            }
        });
    }
}
