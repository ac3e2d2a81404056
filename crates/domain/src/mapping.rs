//! Characteristic-to-attribute mappings for bridged peripherals.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{AttributeId, ClusterId};

/// How a mapped characteristic's value reaches the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    /// Read once while the connection is being set up.
    ReadOnce,
    /// Subscribe for notifications after connection setup.
    Subscribe,
}

/// Binds one GATT characteristic to one data-model attribute.
///
/// Bridged values are 16-bit; wider characteristics are not mappable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMap {
    /// Characteristic UUID inside the device's primary service.
    pub characteristic: Uuid,
    /// Target cluster on the bridged endpoint.
    pub cluster: ClusterId,
    /// Target attribute within `cluster`.
    pub attribute: AttributeId,
    /// Read-once or subscribe.
    pub access: AccessMode,
}
