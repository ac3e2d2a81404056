//! The bridge registry: the set of live bridged devices, keyed by dynamic
//! endpoint index.
//!
//! The registry owns endpoint allocation (sequential ids, lowest-free
//! index) and all routing between the data-model server and the devices.
//! Lifecycle hooks that need the radio go through the bridge loop, which
//! holds the registry alongside the connectivity manager.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use gattbridge_domain::cluster::{AttributeId, ClusterId, EndpointId, EndpointIndex};
use gattbridge_domain::error::BridgeError;
use gattbridge_domain::path::AttributePath;

use crate::devices::{Bridged, Change, DeviceSpec, is_generic_cluster};
use crate::ports::DataModelServer;

/// Inspection view of one registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSnapshot {
    pub index: EndpointIndex,
    pub endpoint: EndpointId,
    pub name: String,
    pub kind: &'static str,
    pub reachable: bool,
}

pub struct Registry<S> {
    server: Arc<S>,
    max_dynamic: usize,
    next_endpoint: EndpointId,
    devices: BTreeMap<EndpointIndex, Bridged>,
}

impl<S: DataModelServer> Registry<S> {
    /// Builds the registry against a server whose fixed endpoints are
    /// final: dynamic ids start one past the last fixed endpoint, and the
    /// code-generation placeholder endpoint is switched off.
    pub fn new(server: Arc<S>, max_dynamic: usize) -> Self {
        let placeholder = server.last_fixed_endpoint();
        server.set_endpoint_enabled(placeholder, false);
        Self {
            next_endpoint: placeholder.next(),
            server,
            max_dynamic,
            devices: BTreeMap::new(),
        }
    }

    /// Register a new bridged device.
    ///
    /// The endpoint-id counter advances even when server-side registration
    /// fails, so a failed attempt consumes an id. Kept from the original
    /// firmware on purpose; ids only need to be unique, not dense.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidName`], [`BridgeError::DuplicateDevice`],
    /// [`BridgeError::NoFreeEndpoint`], or whatever the server rejects the
    /// registration with.
    pub fn add(&mut self, spec: DeviceSpec) -> Result<(EndpointIndex, EndpointId), BridgeError> {
        spec.validate()?;
        if self.devices.values().any(|d| d.name() == spec.name()) {
            return Err(BridgeError::DuplicateDevice(spec.name().to_owned()));
        }
        let free = (0..self.max_dynamic)
            .filter_map(|i| u16::try_from(i).ok())
            .map(EndpointIndex::new)
            .find(|i| !self.devices.contains_key(i))
            .ok_or(BridgeError::NoFreeEndpoint)?;

        let endpoint = self.next_endpoint;
        self.next_endpoint = endpoint.next();
        self.server
            .register_endpoint(free, endpoint, self.server.aggregator_endpoint(), spec.name())?;

        tracing::info!(index = %free, %endpoint, name = %spec.name(), "bridged device registered");
        self.devices.insert(free, Bridged::build(spec, endpoint, free));
        Ok((free, endpoint))
    }

    /// Unregister the device owning `endpoint`, clearing its server slot.
    /// The device is handed back so the caller can tear its link down.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownDevice`] when no device owns `endpoint`.
    pub fn remove(
        &mut self,
        endpoint: EndpointId,
    ) -> Result<(EndpointIndex, Bridged), BridgeError> {
        let index = self
            .devices
            .iter()
            .find(|(_, d)| d.endpoint() == endpoint)
            .map(|(i, _)| *i)
            .ok_or(BridgeError::UnknownDevice(endpoint))?;
        self.server.clear_endpoint(index)?;
        let device = self
            .devices
            .remove(&index)
            .ok_or(BridgeError::UnknownEndpoint(index))?;
        tracing::info!(%index, %endpoint, name = %device.name(), "bridged device removed");
        Ok((index, device))
    }

    /// Route an inbound attribute read. Generic clusters are served from
    /// bridge state even while the device is away; anything else needs a
    /// reachable device.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownEndpoint`], [`BridgeError::DeviceUnreachable`],
    /// or the device's own read failure.
    pub fn handle_read(
        &self,
        index: EndpointIndex,
        cluster: ClusterId,
        attribute: AttributeId,
        max_len: usize,
    ) -> Result<Vec<u8>, BridgeError> {
        let Some(device) = self.devices.get(&index) else {
            tracing::warn!(%index, "attribute read for an unregistered endpoint index");
            return Err(BridgeError::UnknownEndpoint(index));
        };
        if !is_generic_cluster(cluster) && !device.is_reachable() {
            return Err(BridgeError::DeviceUnreachable(index));
        }
        device.handle_read(cluster, attribute, max_len)
    }

    /// Route an inbound attribute write. Same gating as reads.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownEndpoint`], [`BridgeError::DeviceUnreachable`],
    /// or [`BridgeError::UnsupportedWrite`] from the device.
    pub fn handle_write(
        &mut self,
        index: EndpointIndex,
        cluster: ClusterId,
        attribute: AttributeId,
        value: &[u8],
    ) -> Result<(), BridgeError> {
        let Some(device) = self.devices.get_mut(&index) else {
            tracing::warn!(%index, "attribute write for an unregistered endpoint index");
            return Err(BridgeError::UnknownEndpoint(index));
        };
        if !is_generic_cluster(cluster) && !device.is_reachable() {
            return Err(BridgeError::DeviceUnreachable(index));
        }
        device.handle_write(cluster, attribute, value)
    }

    /// Forward attribute changes for the device at `index` to the server.
    pub fn publish(&self, index: EndpointIndex, changes: impl IntoIterator<Item = Change>) {
        let Some(device) = self.devices.get(&index) else {
            tracing::debug!(%index, "change for an unregistered endpoint index, dropping");
            return;
        };
        for (cluster, attribute) in changes {
            self.server
                .notify_changed(AttributePath::new(device.endpoint(), cluster, attribute));
        }
    }

    #[must_use]
    pub fn get(&self, index: EndpointIndex) -> Option<&Bridged> {
        self.devices.get(&index)
    }

    pub fn get_mut(&mut self, index: EndpointIndex) -> Option<&mut Bridged> {
        self.devices.get_mut(&index)
    }

    #[must_use]
    pub fn indices(&self) -> Vec<EndpointIndex> {
        self.devices.keys().copied().collect()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.devices
            .iter()
            .map(|(index, device)| EndpointSnapshot {
                index: *index,
                endpoint: device.endpoint(),
                name: device.name().to_owned(),
                kind: device.kind(),
                reachable: device.is_reachable(),
            })
            .collect()
    }
}
