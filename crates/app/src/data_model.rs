//! In-process data-model server.
//!
//! Stands in for the upstream attribute server: a fixed endpoint triple
//! (root, aggregator, placeholder), a bounded dynamic endpoint table, and
//! attribute-change fan-out over a tokio [`broadcast`] channel. The daemon
//! and the tests both run against this implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use gattbridge_domain::cluster::{EndpointId, EndpointIndex};
use gattbridge_domain::error::BridgeError;
use gattbridge_domain::path::AttributePath;

use crate::ports::DataModelServer;

/// Root node endpoint.
pub const ROOT_ENDPOINT: EndpointId = EndpointId::new(0);
/// Aggregator endpoint all bridged endpoints hang off.
pub const AGGREGATOR_ENDPOINT: EndpointId = EndpointId::new(1);
/// Code-generation placeholder endpoint, disabled at startup.
pub const PLACEHOLDER_ENDPOINT: EndpointId = EndpointId::new(2);

/// One occupied dynamic slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEndpoint {
    pub endpoint: EndpointId,
    pub parent: EndpointId,
    pub name: String,
}

#[derive(Debug, Default)]
struct Inner {
    dynamic: BTreeMap<EndpointIndex, RegisteredEndpoint>,
    disabled: BTreeSet<EndpointId>,
}

/// In-process [`DataModelServer`] backed by plain maps.
///
/// Change notifications are dropped when nobody subscribed, and a lagging
/// subscriber may lose old ones — inspection surfaces tolerate both.
pub struct InProcessDataModel {
    max_dynamic: usize,
    inner: Mutex<Inner>,
    changed: broadcast::Sender<AttributePath>,
}

impl InProcessDataModel {
    /// Create a server with the standard fixed endpoints and room for
    /// `max_dynamic` bridged endpoints.
    #[must_use]
    pub fn new(max_dynamic: usize) -> Self {
        let (changed, _) = broadcast::channel(64);
        Self {
            max_dynamic,
            inner: Mutex::new(Inner::default()),
            changed,
        }
    }

    /// Subscribe to attribute-change notifications published after this call.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<AttributePath> {
        self.changed.subscribe()
    }

    /// Snapshot of the occupied dynamic slots.
    #[must_use]
    pub fn registered(&self) -> Vec<(EndpointIndex, RegisteredEndpoint)> {
        self.lock()
            .dynamic
            .iter()
            .map(|(index, reg)| (*index, reg.clone()))
            .collect()
    }

    /// Whether a fixed endpoint is still enabled.
    #[must_use]
    pub fn is_enabled(&self, endpoint: EndpointId) -> bool {
        !self.lock().disabled.contains(&endpoint)
    }

    // Every critical section is a single map operation, so the state behind
    // a poisoned guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DataModelServer for InProcessDataModel {
    fn last_fixed_endpoint(&self) -> EndpointId {
        PLACEHOLDER_ENDPOINT
    }

    fn aggregator_endpoint(&self) -> EndpointId {
        AGGREGATOR_ENDPOINT
    }

    fn set_endpoint_enabled(&self, endpoint: EndpointId, enabled: bool) {
        let mut inner = self.lock();
        if enabled {
            inner.disabled.remove(&endpoint);
        } else {
            inner.disabled.insert(endpoint);
        }
    }

    fn register_endpoint(
        &self,
        index: EndpointIndex,
        endpoint: EndpointId,
        parent: EndpointId,
        name: &str,
    ) -> Result<(), BridgeError> {
        let mut inner = self.lock();
        if inner.dynamic.len() >= self.max_dynamic {
            return Err(BridgeError::NoFreeEndpoint);
        }
        if inner.dynamic.contains_key(&index) {
            return Err(BridgeError::DuplicateDevice(name.to_string()));
        }
        inner.dynamic.insert(
            index,
            RegisteredEndpoint {
                endpoint,
                parent,
                name: name.to_string(),
            },
        );
        Ok(())
    }

    fn clear_endpoint(&self, index: EndpointIndex) -> Result<EndpointId, BridgeError> {
        self.lock()
            .dynamic
            .remove(&index)
            .map(|reg| reg.endpoint)
            .ok_or(BridgeError::UnknownEndpoint(index))
    }

    fn index_of(&self, endpoint: EndpointId) -> Option<EndpointIndex> {
        self.lock()
            .dynamic
            .iter()
            .find(|(_, reg)| reg.endpoint == endpoint)
            .map(|(index, _)| *index)
    }

    fn notify_changed(&self, path: AttributePath) {
        // send fails only when there are zero receivers, which is fine.
        let _ = self.changed.send(path);
    }
}
