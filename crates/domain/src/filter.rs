//! Scan filters for locating bridged peripherals.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::addr::PeerAddr;

/// How a bridged peripheral is recognized over the air.
///
/// The connectivity manager accepts exactly these two filter kinds; richer
/// matching (names, manufacturer data) is the advertising payload's problem,
/// not the bridge's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFilter {
    /// Match the first advertisement carrying this 128-bit service UUID.
    ServiceUuid(Uuid),
    /// Match a specific peer address regardless of payload.
    Address(PeerAddr),
}

impl DeviceFilter {
    /// Whether an advertisement from `addr` carrying `services` satisfies
    /// this filter.
    #[must_use]
    pub fn matches(&self, addr: PeerAddr, services: &[Uuid]) -> bool {
        match self {
            Self::ServiceUuid(uuid) => services.contains(uuid),
            Self::Address(expected) => addr == *expected,
        }
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceUuid(uuid) => write!(f, "service {uuid}"),
            Self::Address(addr) => write!(f, "addr {addr}"),
        }
    }
}
