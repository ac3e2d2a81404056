//! BLE-backed bridged device.
//!
//! Lifecycle: disconnected → connecting or scanning → discovering →
//! setting up (reads + subscriptions) → reachable, and back to
//! disconnected on any link loss. Every transition is driven by one bridge
//! loop event; the device never blocks.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use gattbridge_domain::cluster::{
    ATTR_NODE_LABEL, AttributeId, CLUSTER_BASIC_INFORMATION, ClusterId,
};
use gattbridge_domain::error::BridgeError;
use gattbridge_domain::filter::DeviceFilter;
use gattbridge_domain::mapping::{AccessMode, AttributeMap};

use crate::bridge::{BridgeEvent, schedule_event};
use crate::ports::{Central, CentralError, ConnId, GattAttribute};
use crate::session::{DeviceSession, SetupError, execute_setup};

use super::{Change, DeviceBase, DeviceCtx, fit, read_modeled_constant};

pub struct PeripheralDevice {
    base: DeviceBase,
    service: Uuid,
    filter: DeviceFilter,
    mapping: Vec<AttributeMap>,
    session: Option<DeviceSession>,
    recovery_generation: u64,
}

impl PeripheralDevice {
    #[must_use]
    pub fn new(
        base: DeviceBase,
        service: Uuid,
        filter: DeviceFilter,
        mapping: Vec<AttributeMap>,
    ) -> Self {
        Self {
            base,
            service,
            filter,
            mapping,
            session: None,
            recovery_generation: 0,
        }
    }

    #[must_use]
    pub fn base(&self) -> &DeviceBase {
        &self.base
    }

    /// Registration hook: report the configured label upstream and start
    /// acquiring the link, bonded peer first.
    pub async fn init<C: Central>(&mut self, ctx: &mut DeviceCtx<'_, C>) -> Vec<Change> {
        let timeout = ctx.config.scan_timeout;
        self.acquire(ctx, timeout).await;
        vec![(CLUSTER_BASIC_INFORMATION, ATTR_NODE_LABEL)]
    }

    async fn acquire<C: Central>(&mut self, ctx: &mut DeviceCtx<'_, C>, scan_timeout: Duration) {
        let owner = self.base.index();
        if ctx
            .connectivity
            .connect_first_bonded(owner, &self.filter, self.service)
            .await
        {
            return;
        }
        ctx.connectivity
            .start_scan(owner, self.filter, self.service, scan_timeout)
            .await;
    }

    /// Terminal outcome of one connect-or-scan request.
    pub fn on_connect_outcome<C: Central>(
        &mut self,
        ctx: &mut DeviceCtx<'_, C>,
        conn: Option<ConnId>,
    ) {
        let Some(conn) = conn else {
            self.arm_recovery(ctx);
            return;
        };
        let mut session = DeviceSession::new(conn);
        if session.begin_discovery() {
            let central = Arc::clone(ctx.central);
            let events = ctx.events.clone();
            let index = self.base.index();
            let service = self.service;
            tokio::spawn(async move {
                let result = central.discover(conn, service).await;
                let _ = events.send(BridgeEvent::DiscoveryFinished {
                    index,
                    conn,
                    result,
                });
            });
        }
        self.session = Some(session);
    }

    /// The connection dropped: tear the session down and retry later.
    pub fn on_link_down<C: Central>(&mut self, ctx: &mut DeviceCtx<'_, C>) -> Option<Change> {
        self.session = None;
        let change = self.base.set_reachable(false);
        self.arm_recovery(ctx);
        change
    }

    /// Service discovery finished; plan and launch the setup pass.
    pub fn on_discovery<C: Central>(
        &mut self,
        ctx: &mut DeviceCtx<'_, C>,
        conn: ConnId,
        result: Result<Vec<GattAttribute>, CentralError>,
    ) {
        let Some(session) = self.session.as_mut().filter(|s| s.conn() == conn) else {
            tracing::debug!(%conn, "discovery completion for a dead session, ignoring");
            return;
        };
        match result {
            Ok(attrs) => {
                session.install(&attrs);
                let plan = session.plan_setup(&self.mapping);
                let central = Arc::clone(ctx.central);
                let events = ctx.events.clone();
                let index = self.base.index();
                tokio::spawn(async move {
                    let result = execute_setup(central.as_ref(), conn, &plan).await;
                    let _ = events.send(BridgeEvent::SetupFinished {
                        index,
                        conn,
                        result,
                    });
                });
            }
            Err(err) => {
                tracing::warn!(
                    name = %self.base.name(),
                    error = %err,
                    "service discovery failed, dropping the link"
                );
                ctx.connectivity.disconnect(conn);
            }
        }
    }

    /// Setup finished: merge the read-once values and go reachable, or drop
    /// the link so recovery can take over.
    pub fn on_setup<C: Central>(
        &mut self,
        ctx: &mut DeviceCtx<'_, C>,
        conn: ConnId,
        result: Result<Vec<(AttributeMap, u16)>, SetupError>,
    ) -> Vec<Change> {
        if !self.session.as_ref().is_some_and(|s| s.conn() == conn) {
            tracing::debug!(%conn, "setup completion for a dead session, ignoring");
            return Vec::new();
        }
        match result {
            Ok(values) => {
                let mut changes: Vec<Change> = values
                    .into_iter()
                    .map(|(map, value)| self.base.cache_store(map.cluster, map.attribute, value))
                    .collect();
                changes.extend(self.base.set_reachable(true));
                changes
            }
            Err(err) => {
                tracing::warn!(
                    name = %self.base.name(),
                    error = %err,
                    "session setup failed, dropping the link"
                );
                ctx.connectivity.disconnect(conn);
                Vec::new()
            }
        }
    }

    /// An inbound notification for a subscribed characteristic. Payloads
    /// that are not exactly a 16-bit value are dropped.
    pub fn on_notification(&mut self, handle: u16, value: &[u8]) -> Option<Change> {
        let session = self.session.as_ref()?;
        let Some(characteristic) = session.subscribed_characteristic(handle) else {
            tracing::debug!(handle, "notification for an unsubscribed handle, ignoring");
            return None;
        };
        let map = self
            .mapping
            .iter()
            .find(|m| m.characteristic == characteristic)
            .copied()?;
        let Ok(raw) = <[u8; 2]>::try_from(value) else {
            tracing::warn!(
                %characteristic,
                len = value.len(),
                "notification is not a 16-bit value, dropping"
            );
            return None;
        };
        Some(
            self.base
                .cache_store(map.cluster, map.attribute, u16::from_le_bytes(raw)),
        )
    }

    /// Recovery timer fired. Stale generations and timers racing an
    /// established session are ignored.
    pub async fn on_recovery_due<C: Central>(
        &mut self,
        ctx: &mut DeviceCtx<'_, C>,
        generation: u64,
    ) {
        if generation != self.recovery_generation || self.session.is_some() {
            return;
        }
        tracing::info!(name = %self.base.name(), "recovery attempt");
        let timeout = ctx.config.recovery_scan_timeout;
        self.acquire(ctx, timeout).await;
    }

    /// Removal teardown: unsubscribe what we subscribed, then release the
    /// link and any pending scan.
    pub fn shutdown_link<C: Central>(&mut self, ctx: &mut DeviceCtx<'_, C>) {
        if let Some(mut session) = self.session.take() {
            let conn = session.conn();
            for map in &self.mapping {
                if map.access != AccessMode::Subscribe {
                    continue;
                }
                let Some(sub) = session.take_subscription(map.characteristic) else {
                    continue;
                };
                let central = Arc::clone(ctx.central);
                tokio::spawn(async move {
                    if let Err(err) = central.unsubscribe(conn, sub.value_handle).await {
                        tracing::debug!(%conn, error = %err, "unsubscribe failed during teardown");
                    }
                });
            }
        }
        ctx.connectivity.release_owner(self.base.index());
    }

    /// Reads from the modeled cluster: fixed constants, then the cache.
    ///
    /// # Errors
    ///
    /// [`BridgeError::AttributeMissing`] when the attribute was never read
    /// or notified, [`BridgeError::BufferTooSmall`] when it does not fit.
    pub fn read_mapped(
        &self,
        cluster: ClusterId,
        attribute: AttributeId,
        max_len: usize,
    ) -> Result<Vec<u8>, BridgeError> {
        if let Some(result) = read_modeled_constant(attribute, max_len) {
            return result;
        }
        let Some(value) = self.base.cached(cluster, attribute) else {
            return Err(BridgeError::AttributeMissing { cluster, attribute });
        };
        fit(value.to_le_bytes().to_vec(), max_len)
    }

    fn arm_recovery<C: Central>(&mut self, ctx: &DeviceCtx<'_, C>) {
        self.recovery_generation += 1;
        let index = self.base.index();
        let generation = self.recovery_generation;
        tracing::info!(
            name = %self.base.name(),
            delay_ms = ctx.config.recovery_delay.as_millis(),
            "arming recovery timer"
        );
        schedule_event(
            ctx.events,
            ctx.config.recovery_delay,
            BridgeEvent::RecoveryDue { index, generation },
        );
    }
}
