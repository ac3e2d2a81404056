//! Typed data-model identifiers and the constants the bridge serves itself.
//!
//! Cluster and attribute numbering belongs to the external data-model server;
//! the bridge only needs the handful of ids it answers locally (bridged-device
//! basic information, descriptor, and the two global attributes) plus the demo
//! level cluster the reference peripherals map onto.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! define_wire_id {
    ($(#[doc = $doc:expr])* $name:ident, $repr:ty) => {
        $(#[doc = $doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Wrap a raw wire value.
            #[must_use]
            pub const fn new(raw: $repr) -> Self {
                Self(raw)
            }

            /// Access the raw wire value.
            #[must_use]
            pub const fn raw(self) -> $repr {
                self.0
            }
        }

        impl From<$repr> for $name {
            fn from(raw: $repr) -> Self {
                Self(raw)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            /// Accepts decimal or `0x`-prefixed hex.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => <$repr>::from_str_radix(hex, 16)?,
                    None => s.parse()?,
                };
                Ok(Self(raw))
            }
        }
    };
}

define_wire_id!(
    /// Identifier of a data-model cluster.
    ClusterId,
    u32
);

define_wire_id!(
    /// Identifier of an attribute within a cluster.
    AttributeId,
    u32
);

define_wire_id!(
    /// Server-assigned identifier of an endpoint.
    EndpointId,
    u16
);

define_wire_id!(
    /// Slot of a dynamic endpoint in the bridge registry.
    EndpointIndex,
    u16
);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for EndpointIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl EndpointId {
    /// The id following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Bridged Device Basic Information cluster.
pub const CLUSTER_BASIC_INFORMATION: ClusterId = ClusterId::new(0x0039);
/// Descriptor cluster.
pub const CLUSTER_DESCRIPTOR: ClusterId = ClusterId::new(0x001D);
/// Level Control cluster, the shape the reference peripherals map onto.
pub const CLUSTER_LEVEL_CONTROL: ClusterId = ClusterId::new(0x0008);

/// `NodeLabel` attribute of Basic Information.
pub const ATTR_NODE_LABEL: AttributeId = AttributeId::new(0x0005);
/// `Reachable` attribute of Basic Information.
pub const ATTR_REACHABLE: AttributeId = AttributeId::new(0x0011);
/// `CurrentLevel` attribute of Level Control.
pub const ATTR_CURRENT_LEVEL: AttributeId = AttributeId::new(0x0000);
/// Global `ClusterRevision` attribute.
pub const ATTR_CLUSTER_REVISION: AttributeId = AttributeId::new(0xFFFD);
/// Global `FeatureMap` attribute.
pub const ATTR_FEATURE_MAP: AttributeId = AttributeId::new(0xFFFC);

/// Revision served for the descriptor and the modeled cluster.
pub const CLUSTER_REVISION: u16 = 1;
/// Feature map served for the descriptor and the modeled cluster.
pub const FEATURE_MAP: u32 = 0;
/// Revision served for Bridged Device Basic Information.
pub const BASIC_INFORMATION_CLUSTER_REVISION: u16 = 1;
/// Maximum byte length of a device's node label.
pub const NODE_LABEL_CAPACITY: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_hex_and_decimal_forms() {
        assert_eq!("0x0008".parse::<ClusterId>().unwrap(), CLUSTER_LEVEL_CONTROL);
        assert_eq!("8".parse::<ClusterId>().unwrap(), CLUSTER_LEVEL_CONTROL);
        assert_eq!("0xFFFD".parse::<AttributeId>().unwrap(), ATTR_CLUSTER_REVISION);
        assert!("0xZZ".parse::<AttributeId>().is_err());
    }

    #[test]
    fn should_display_cluster_ids_as_hex() {
        assert_eq!(CLUSTER_BASIC_INFORMATION.to_string(), "0x0039");
        assert_eq!(ATTR_FEATURE_MAP.to_string(), "0xfffc");
    }

    #[test]
    fn should_serialize_transparently() {
        let json = serde_json::to_string(&CLUSTER_DESCRIPTOR).unwrap();
        assert_eq!(json, "29");
        let parsed: ClusterId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, CLUSTER_DESCRIPTOR);
    }

    #[test]
    fn should_advance_endpoint_ids() {
        let first = EndpointId::new(3);
        assert_eq!(first.next(), EndpointId::new(4));
    }
}
