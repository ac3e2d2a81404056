//! Attribute coordinates within the bridged data model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::{AttributeId, ClusterId, EndpointId};

/// The endpoint/cluster/attribute triple identifying one bridged value.
///
/// This is the payload of every attribute-changed notification handed to the
/// data-model server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributePath {
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub attribute: AttributeId,
}

impl AttributePath {
    #[must_use]
    pub fn new(endpoint: EndpointId, cluster: ClusterId, attribute: AttributeId) -> Self {
        Self {
            endpoint,
            cluster,
            attribute,
        }
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.endpoint, self.cluster, self.attribute)
    }
}
