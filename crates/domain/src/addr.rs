//! BLE peer addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of octets in a BD address.
pub const ADDR_LEN: usize = 6;

/// A 48-bit Bluetooth device address.
///
/// Octets are stored in display order: `octets()[0]` is the leftmost octet
/// of the `AA:BB:CC:DD:EE:FF` text form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddr([u8; ADDR_LEN]);

impl PeerAddr {
    /// Wrap raw address octets.
    #[must_use]
    pub fn new(octets: [u8; ADDR_LEN]) -> Self {
        Self(octets)
    }

    /// Access the raw address octets.
    #[must_use]
    pub fn octets(self) -> [u8; ADDR_LEN] {
        self.0
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for PeerAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; ADDR_LEN];
        let mut count = 0;
        for part in s.split(':') {
            if count == ADDR_LEN {
                return Err(AddrParseError::OctetCount(s.to_string()));
            }
            if part.len() != 2 {
                return Err(AddrParseError::InvalidOctet(part.to_string()));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| AddrParseError::InvalidOctet(part.to_string()))?;
            count += 1;
        }
        if count != ADDR_LEN {
            return Err(AddrParseError::OctetCount(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for PeerAddr {
    type Error = AddrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerAddr> for String {
    fn from(addr: PeerAddr) -> Self {
        addr.to_string()
    }
}

/// LE address kind, carried alongside the raw octets in pairing material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrKind {
    Public,
    Random,
}

impl fmt::Display for AddrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Random => f.write_str("random"),
        }
    }
}

impl FromStr for AddrKind {
    type Err = AddrParseError;

    /// Accepts the bare and the parenthesized stack forms
    /// (`random` and `(random)`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" | "(public)" => Ok(Self::Public),
            "random" | "(random)" => Ok(Self::Random),
            other => Err(AddrParseError::InvalidKind(other.to_string())),
        }
    }
}

/// Failure to parse a textual address or address kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrParseError {
    /// Wrong number of colon-separated octets.
    #[error("expected {ADDR_LEN} colon-separated octets in {0:?}")]
    OctetCount(String),
    /// An octet was not two hex digits.
    #[error("invalid address octet {0:?}")]
    InvalidOctet(String),
    /// Address kind was neither `public` nor `random`.
    #[error("invalid address kind {0:?}")]
    InvalidKind(String),
}
