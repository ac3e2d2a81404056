//! Data-model server port — the upstream attribute server as seen by the
//! registry.
//!
//! The bridge registers each bridged device as one dynamic endpoint and
//! reports value changes as attribute paths. How those endpoints are served
//! to the wide-area network is entirely the server's business.
//!
//! Methods are synchronous and must not block: registration is table
//! bookkeeping, and change notification is fire-and-forget (a networked
//! implementation would enqueue).

use gattbridge_domain::cluster::{EndpointId, EndpointIndex};
use gattbridge_domain::error::BridgeError;
use gattbridge_domain::path::AttributePath;

/// Server-side endpoint table and change sink.
pub trait DataModelServer: Send + Sync + 'static {
    /// Highest fixed (build-time) endpoint id. Dynamic ids start right after.
    fn last_fixed_endpoint(&self) -> EndpointId;

    /// The aggregator endpoint new dynamic endpoints are parented under.
    fn aggregator_endpoint(&self) -> EndpointId;

    /// Enable or disable a fixed endpoint. Used once at startup to retire
    /// the placeholder endpoint that only exists for code generation.
    fn set_endpoint_enabled(&self, endpoint: EndpointId, enabled: bool);

    /// Occupy dynamic slot `index` with endpoint `endpoint`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NoFreeEndpoint`] when the dynamic table is full, or
    /// [`BridgeError::DuplicateDevice`] when the slot is already taken.
    fn register_endpoint(
        &self,
        index: EndpointIndex,
        endpoint: EndpointId,
        parent: EndpointId,
        name: &str,
    ) -> Result<(), BridgeError>;

    /// Release dynamic slot `index`, returning the endpoint id it held.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownEndpoint`] when the slot is empty.
    fn clear_endpoint(&self, index: EndpointIndex) -> Result<EndpointId, BridgeError>;

    /// Dynamic slot currently serving `endpoint`, if any.
    fn index_of(&self, endpoint: EndpointId) -> Option<EndpointIndex>;

    /// Report that the value at `path` changed.
    fn notify_changed(&self, path: AttributePath);
}
