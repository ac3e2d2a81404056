//! The bridge error taxonomy.
//!
//! Failure classes map onto fixed reactions and none of them may take the
//! process down:
//!
//! | class | reaction |
//! |---|---|
//! | transport (link, scan, GATT) | logged; the owning device retries via its recovery path |
//! | protocol mapping (bad length, missing cache entry) | per-attribute error to the caller |
//! | registry misuse (unknown index, duplicate name) | internal error, logged, request rejected |
//! | unsupported operation | rejected outright |

use crate::cluster::{AttributeId, ClusterId, EndpointId, EndpointIndex};

/// Error surfaced by registry and device operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// No device is registered at the requested dynamic index.
    #[error("no bridged device at index {0}")]
    UnknownEndpoint(EndpointIndex),

    /// No registered device owns the requested endpoint id.
    #[error("no bridged device owns endpoint {0}")]
    UnknownDevice(EndpointId),

    /// The device exists but its link is down and the requested cluster
    /// needs live data.
    #[error("device at index {0} is unreachable")]
    DeviceUnreachable(EndpointIndex),

    /// A mapped attribute has no cached value yet.
    #[error("no cached value for {cluster}/{attribute}")]
    AttributeMissing {
        cluster: ClusterId,
        attribute: AttributeId,
    },

    /// The requested attribute is not part of the bridged surface.
    #[error("attribute {attribute} of {cluster} is not served")]
    UnsupportedAttribute {
        cluster: ClusterId,
        attribute: AttributeId,
    },

    /// The caller's read limit cannot hold the value.
    #[error("value needs {needed} bytes but at most {max} may be returned")]
    BufferTooSmall { needed: usize, max: usize },

    /// Bridged attributes are read-only from the server side.
    #[error("bridged attributes do not accept writes")]
    UnsupportedWrite,

    /// A device with this display name is already registered.
    #[error("device {0:?} is already registered")]
    DuplicateDevice(String),

    /// Every dynamic endpoint slot on the server is taken.
    #[error("no free dynamic endpoint")]
    NoFreeEndpoint,

    /// A device display name was empty or longer than the node label allows.
    #[error("invalid device name {0:?}")]
    InvalidName(String),

    /// The bridge event loop is gone; no further requests can be served.
    #[error("bridge is shut down")]
    Shutdown,
}
