//! The bridge event loop.
//!
//! One tokio task owns every piece of bridge state: the connectivity
//! manager, the registry with its devices, and the OOB secret store.
//! Everything reaching that state is serialized through one event channel:
//! handle commands, central events, completions posted by spawned IO
//! tasks, and timer fires. Timers are single-shot sleeps whose events
//! carry a generation; a bumped generation makes the pending fire a no-op.
//!
//! Nothing in here may take the process down. Failures map onto the error
//! taxonomy and the worst case is one device staying unreachable until its
//! next recovery attempt.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use gattbridge_domain::addr::PeerAddr;
use gattbridge_domain::cluster::{AttributeId, ClusterId, EndpointId, EndpointIndex};
use gattbridge_domain::error::BridgeError;
use gattbridge_domain::mapping::AttributeMap;

use crate::connectivity::{ConnectivityManager, DEFAULT_MAX_CONNECTIONS};
use crate::devices::{Bridged, DeviceCtx, DeviceSpec};
use crate::oob::{OobExchange, PairingDecision};
use crate::ports::{Central, CentralError, CentralEvent, ConnId, DataModelServer, GattAttribute};
use crate::registry::{EndpointSnapshot, Registry};
use crate::session::SetupError;

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_millis(15_000);
pub const DEFAULT_RECOVERY_SCAN_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_DYNAMIC_ENDPOINTS: usize = 16;

/// Loop and timer tunables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub max_connections: usize,
    pub max_dynamic_endpoints: usize,
    pub scan_timeout: Duration,
    pub recovery_delay: Duration,
    pub recovery_scan_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_dynamic_endpoints: DEFAULT_MAX_DYNAMIC_ENDPOINTS,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            recovery_scan_timeout: DEFAULT_RECOVERY_SCAN_TIMEOUT,
        }
    }
}

/// Everything the loop consumes.
#[derive(Debug)]
pub enum BridgeEvent {
    Command(BridgeCommand),
    Central(CentralEvent),
    /// A spawned connect task finished.
    ConnectAttempt {
        addr: PeerAddr,
        result: Result<ConnId, CentralError>,
    },
    /// Terminal outcome of one logical connection request.
    ConnectOutcome {
        owner: EndpointIndex,
        conn: Option<ConnId>,
        service: Uuid,
    },
    ScanTimedOut {
        generation: u64,
    },
    DiscoveryFinished {
        index: EndpointIndex,
        conn: ConnId,
        result: Result<Vec<GattAttribute>, CentralError>,
    },
    SetupFinished {
        index: EndpointIndex,
        conn: ConnId,
        result: Result<Vec<(AttributeMap, u16)>, SetupError>,
    },
    RecoveryDue {
        index: EndpointIndex,
        generation: u64,
    },
    ComputedTick {
        index: EndpointIndex,
        generation: u64,
    },
}

/// Requests accepted through [`BridgeHandle`].
#[derive(Debug)]
pub enum BridgeCommand {
    AddDevice {
        spec: DeviceSpec,
        reply: oneshot::Sender<Result<EndpointId, BridgeError>>,
    },
    RemoveDevice {
        endpoint: EndpointId,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    ReadAttribute {
        index: EndpointIndex,
        cluster: ClusterId,
        attribute: AttributeId,
        max_len: usize,
        reply: oneshot::Sender<Result<Vec<u8>, BridgeError>>,
    },
    WriteAttribute {
        index: EndpointIndex,
        cluster: ClusterId,
        attribute: AttributeId,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Endpoints {
        reply: oneshot::Sender<Vec<EndpointSnapshot>>,
    },
    ExchangeOob {
        line: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Arm a single-shot timer: after `delay`, `event` lands in the loop.
pub(crate) fn schedule_event(
    events: &mpsc::UnboundedSender<BridgeEvent>,
    delay: Duration,
    event: BridgeEvent,
) {
    let events = events.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(event);
    });
}

/// Clonable typed front door to the loop.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> BridgeCommand,
    ) -> Result<T, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BridgeEvent::Command(make(reply)))
            .map_err(|_| BridgeError::Shutdown)?;
        rx.await.map_err(|_| BridgeError::Shutdown)
    }

    /// Register a new bridged device and run its startup hook.
    ///
    /// # Errors
    ///
    /// Registration failures per [`crate::registry::Registry::add`], or
    /// [`BridgeError::Shutdown`] when the loop is gone.
    pub async fn add_device(&self, spec: DeviceSpec) -> Result<EndpointId, BridgeError> {
        self.request(|reply| BridgeCommand::AddDevice { spec, reply })
            .await?
    }

    /// Unregister the device owning `endpoint` and tear its link down.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownDevice`] or [`BridgeError::Shutdown`].
    pub async fn remove_device(&self, endpoint: EndpointId) -> Result<(), BridgeError> {
        self.request(|reply| BridgeCommand::RemoveDevice { endpoint, reply })
            .await?
    }

    /// Read one attribute, returning at most `max_len` bytes.
    ///
    /// # Errors
    ///
    /// Routing failures per [`crate::registry::Registry::handle_read`], or
    /// [`BridgeError::Shutdown`].
    pub async fn read_attribute(
        &self,
        index: EndpointIndex,
        cluster: ClusterId,
        attribute: AttributeId,
        max_len: usize,
    ) -> Result<Vec<u8>, BridgeError> {
        self.request(|reply| BridgeCommand::ReadAttribute {
            index,
            cluster,
            attribute,
            max_len,
            reply,
        })
        .await?
    }

    /// Write one attribute.
    ///
    /// # Errors
    ///
    /// Routing failures per [`crate::registry::Registry::handle_write`], or
    /// [`BridgeError::Shutdown`].
    pub async fn write_attribute(
        &self,
        index: EndpointIndex,
        cluster: ClusterId,
        attribute: AttributeId,
        value: Vec<u8>,
    ) -> Result<(), BridgeError> {
        self.request(|reply| BridgeCommand::WriteAttribute {
            index,
            cluster,
            attribute,
            value,
            reply,
        })
        .await?
    }

    /// Snapshot of every registered endpoint.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Shutdown`].
    pub async fn endpoints(&self) -> Result<Vec<EndpointSnapshot>, BridgeError> {
        self.request(|reply| BridgeCommand::Endpoints { reply }).await
    }

    /// Run one OOB exchange; `None` means no reply line is owed.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Shutdown`].
    pub async fn exchange_oob(&self, line: String) -> Result<Option<String>, BridgeError> {
        self.request(|reply| BridgeCommand::ExchangeOob { line, reply })
            .await
    }

    /// Tear every device link down and stop the loop.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Shutdown`] when the loop was already gone.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.request(|reply| BridgeCommand::Shutdown { reply }).await
    }
}

/// The loop state. Construct with [`Bridge::new`], then hand the value to
/// a task running [`Bridge::run`].
pub struct Bridge<C, S> {
    config: BridgeConfig,
    central: Arc<C>,
    connectivity: ConnectivityManager<C>,
    registry: Registry<S>,
    oob: OobExchange,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    events_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    central_events: mpsc::UnboundedReceiver<CentralEvent>,
}

impl<C: Central, S: DataModelServer> Bridge<C, S> {
    #[must_use]
    pub fn new(
        central: Arc<C>,
        server: Arc<S>,
        central_events: mpsc::UnboundedReceiver<CentralEvent>,
        config: BridgeConfig,
    ) -> (Self, BridgeHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connectivity = ConnectivityManager::new(
            Arc::clone(&central),
            events_tx.clone(),
            config.max_connections,
        );
        let registry = Registry::new(server, config.max_dynamic_endpoints);
        let handle = BridgeHandle {
            tx: events_tx.clone(),
        };
        let bridge = Self {
            config,
            central,
            connectivity,
            registry,
            oob: OobExchange::new(),
            events_tx,
            events_rx,
            central_events,
        };
        (bridge, handle)
    }

    /// Consume events until shutdown. The loop itself never returns early;
    /// a closed central stream only mutes that input.
    pub async fn run(mut self) {
        tracing::info!("bridge loop started");
        let mut central_open = true;
        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    // unreachable while we hold a sender ourselves
                    None => break,
                },
                event = self.central_events.recv(), if central_open => match event {
                    Some(event) => BridgeEvent::Central(event),
                    None => {
                        tracing::warn!("central event stream closed");
                        central_open = false;
                        continue;
                    }
                },
            };
            if self.dispatch(event).await.is_break() {
                break;
            }
        }
        tracing::info!("bridge loop stopped");
    }

    /// Split the state into the registry and a device context; the borrows
    /// are disjoint so device hooks can drive connectivity while the
    /// registry hands out the device itself.
    fn split(&mut self) -> (&mut Registry<S>, DeviceCtx<'_, C>) {
        (
            &mut self.registry,
            DeviceCtx {
                central: &self.central,
                connectivity: &mut self.connectivity,
                events: &self.events_tx,
                config: &self.config,
            },
        )
    }

    async fn dispatch(&mut self, event: BridgeEvent) -> ControlFlow<()> {
        match event {
            BridgeEvent::Command(command) => return self.handle_command(command).await,
            BridgeEvent::Central(event) => self.handle_central(event),
            BridgeEvent::ConnectAttempt { addr, result } => {
                self.connectivity.handle_connect_finished(addr, result);
            }
            BridgeEvent::ConnectOutcome { owner, conn, .. } => {
                let (registry, mut ctx) = self.split();
                if let Some(Bridged::Peripheral(device)) = registry.get_mut(owner) {
                    device.on_connect_outcome(&mut ctx, conn);
                } else if let Some(conn) = conn {
                    tracing::warn!(%conn, %owner, "connect outcome for a missing device, dropping the link");
                    ctx.connectivity.disconnect(conn);
                }
            }
            BridgeEvent::ScanTimedOut { generation } => {
                self.connectivity.handle_scan_timeout(generation);
            }
            BridgeEvent::DiscoveryFinished {
                index,
                conn,
                result,
            } => {
                let (registry, mut ctx) = self.split();
                if let Some(Bridged::Peripheral(device)) = registry.get_mut(index) {
                    device.on_discovery(&mut ctx, conn, result);
                } else {
                    tracing::debug!(%index, "discovery completion for a removed device");
                }
            }
            BridgeEvent::SetupFinished {
                index,
                conn,
                result,
            } => {
                let (registry, mut ctx) = self.split();
                if let Some(Bridged::Peripheral(device)) = registry.get_mut(index) {
                    let changes = device.on_setup(&mut ctx, conn, result);
                    registry.publish(index, changes);
                }
            }
            BridgeEvent::RecoveryDue { index, generation } => {
                let (registry, mut ctx) = self.split();
                if let Some(Bridged::Peripheral(device)) = registry.get_mut(index) {
                    device.on_recovery_due(&mut ctx, generation).await;
                }
            }
            BridgeEvent::ComputedTick { index, generation } => {
                let (registry, ctx) = self.split();
                if let Some(Bridged::Computed(device)) = registry.get_mut(index) {
                    let changes = device.on_tick(&ctx, generation);
                    registry.publish(index, changes);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_central(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::ScanMatch { addr } => self.connectivity.handle_scan_match(addr),
            CentralEvent::Disconnected { conn, reason } => {
                let Some(owner) = self.connectivity.handle_disconnect(conn, reason) else {
                    return;
                };
                let (registry, mut ctx) = self.split();
                if let Some(Bridged::Peripheral(device)) = registry.get_mut(owner) {
                    let change = device.on_link_down(&mut ctx);
                    registry.publish(owner, change);
                }
            }
            CentralEvent::Notified {
                conn,
                handle,
                value,
            } => {
                let Some(owner) = self.connectivity.owner_of_conn(conn) else {
                    tracing::debug!(%conn, "notification for an untracked connection");
                    return;
                };
                if let Some(Bridged::Peripheral(device)) = self.registry.get_mut(owner) {
                    let change = device.on_notification(handle, &value);
                    self.registry.publish(owner, change);
                }
            }
            CentralEvent::PairingOobRequested { addr, required } => {
                match self.oob.pairing_decision(addr, required) {
                    PairingDecision::Commit { local, remote } => {
                        tracing::info!(%addr, "handing oob material to the security manager");
                        let central = Arc::clone(&self.central);
                        tokio::spawn(async move {
                            if let Err(err) = central.set_oob_pair(local, remote).await {
                                tracing::warn!(error = %err, %addr, "central refused the oob pair");
                            }
                        });
                    }
                    // withholding the material is the abort path; the
                    // decision itself logged why
                    PairingDecision::Cancel => {}
                }
            }
            CentralEvent::PairingComplete { addr, bonded } => {
                tracing::info!(%addr, bonded, "pairing complete");
            }
            CentralEvent::PairingFailed { addr, reason } => {
                tracing::warn!(%addr, reason, "pairing failed");
            }
            CentralEvent::SecurityChanged { addr, level } => {
                tracing::debug!(%addr, level, "security level changed");
            }
        }
    }

    async fn handle_command(&mut self, command: BridgeCommand) -> ControlFlow<()> {
        match command {
            BridgeCommand::AddDevice { spec, reply } => {
                let result = self.add_device(spec).await;
                let _ = reply.send(result);
            }
            BridgeCommand::RemoveDevice { endpoint, reply } => {
                let _ = reply.send(self.remove_device(endpoint));
            }
            BridgeCommand::ReadAttribute {
                index,
                cluster,
                attribute,
                max_len,
                reply,
            } => {
                let _ = reply.send(self.registry.handle_read(index, cluster, attribute, max_len));
            }
            BridgeCommand::WriteAttribute {
                index,
                cluster,
                attribute,
                value,
                reply,
            } => {
                let _ = reply.send(self.registry.handle_write(index, cluster, attribute, &value));
            }
            BridgeCommand::Endpoints { reply } => {
                let _ = reply.send(self.registry.snapshots());
            }
            BridgeCommand::ExchangeOob { line, reply } => {
                let answer = self.oob.exchange(self.central.as_ref(), &line).await;
                let _ = reply.send(answer);
            }
            BridgeCommand::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn add_device(&mut self, spec: DeviceSpec) -> Result<EndpointId, BridgeError> {
        let (index, endpoint) = self.registry.add(spec)?;
        let (registry, mut ctx) = self.split();
        if let Some(device) = registry.get_mut(index) {
            let changes = match device {
                Bridged::Peripheral(d) => d.init(&mut ctx).await,
                Bridged::Computed(d) => d.init(&ctx),
            };
            registry.publish(index, changes);
        }
        Ok(endpoint)
    }

    fn remove_device(&mut self, endpoint: EndpointId) -> Result<(), BridgeError> {
        let (_, device) = self.registry.remove(endpoint)?;
        if let Bridged::Peripheral(mut device) = device {
            let (_, mut ctx) = self.split();
            device.shutdown_link(&mut ctx);
        }
        Ok(())
    }

    fn teardown(&mut self) {
        for index in self.registry.indices() {
            let (registry, mut ctx) = self.split();
            if let Some(Bridged::Peripheral(device)) = registry.get_mut(index) {
                device.shutdown_link(&mut ctx);
            }
        }
        tracing::info!("bridge torn down");
    }
}
