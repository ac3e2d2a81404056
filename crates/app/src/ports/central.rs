//! Central port — the BLE host stack as seen by the bridge.
//!
//! The bridge drives the radio exclusively through this trait: scanning,
//! connecting, service discovery, subscriptions, reads, and the out-of-band
//! pairing material. Unsolicited stack activity (advertisement matches, link
//! loss, notifications, pairing lifecycle) flows the other way as
//! [`CentralEvent`]s over an `mpsc` channel the adapter is handed at
//! construction; the bridge event loop is the single consumer.
//!
//! Request/response operations return futures instead of registering
//! completion callbacks, so every call site can bound them with a timeout and
//! no state is mutated from stack context.

use std::fmt;
use std::future::Future;

use gattbridge_domain::addr::PeerAddr;
use gattbridge_domain::filter::DeviceFilter;
use gattbridge_domain::oob::OobSecret;
use uuid::Uuid;

/// Opaque token for one established connection, assigned by the adapter.
///
/// Tokens are never reused within a process run, so a stale token held by an
/// in-flight task can at worst address a connection that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u32);

impl ConnId {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One row of a completed primary-service discovery, in handle order.
///
/// Characteristic value attributes carry the characteristic's UUID;
/// descriptors carry the descriptor UUID. 16- and 32-bit UUIDs are expanded
/// to full 128-bit form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattAttribute {
    pub handle: u16,
    pub uuid: Uuid,
}

/// Which side's out-of-band material a pairing asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobSide {
    LocalOnly,
    RemoteOnly,
    Both,
}

/// Unsolicited activity reported by the central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralEvent {
    /// First advertisement matching the active scan filter.
    ScanMatch { addr: PeerAddr },
    /// An established connection dropped (locally or by the peer).
    Disconnected { conn: ConnId, reason: u8 },
    /// Notification for a characteristic value handle.
    Notified {
        conn: ConnId,
        handle: u16,
        value: Vec<u8>,
    },
    /// The security manager needs out-of-band material before pairing with
    /// `addr` can proceed. The bridge answers through
    /// [`Central::set_oob_pair`], or withholds the material to let the
    /// pairing fail.
    PairingOobRequested { addr: PeerAddr, required: OobSide },
    /// Pairing finished; `bonded` reports whether keys were stored.
    PairingComplete { addr: PeerAddr, bonded: bool },
    /// Pairing was aborted by either side.
    PairingFailed { addr: PeerAddr, reason: u8 },
    /// Link encryption/authentication level changed.
    SecurityChanged { addr: PeerAddr, level: u8 },
}

/// Failure reported by the central backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CentralError {
    /// No usable Bluetooth adapter.
    #[error("no bluetooth adapter available")]
    NotAvailable,

    /// The backend cannot perform this operation at all.
    #[error("not supported by this central: {0}")]
    Unsupported(&'static str),

    /// Connect target is not known to the backend.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerAddr),

    /// A GATT operation addressed a connection that is gone.
    #[error("connection {0} is not established")]
    NotConnected(ConnId),

    /// The requested primary service is absent on the peer.
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),

    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Any other backend failure, stringly preserved for the log.
    #[error("central backend: {0}")]
    Backend(String),
}

/// Driver side of the BLE host stack.
///
/// All methods are cancel-safe from the caller's point of view: dropping a
/// returned future abandons the request without poisoning the central.
pub trait Central: Send + Sync + 'static {
    /// Start scanning with `filter`. Replaces any filter installed by an
    /// earlier call; match reporting is edge-triggered per [`CentralEvent::ScanMatch`].
    fn start_scan(
        &self,
        filter: DeviceFilter,
    ) -> impl Future<Output = Result<(), CentralError>> + Send;

    /// Stop scanning. Idempotent; stopping an idle scanner succeeds.
    fn stop_scan(&self) -> impl Future<Output = Result<(), CentralError>> + Send;

    /// Establish a connection to `addr`, resolving once the link is up.
    fn connect(&self, addr: PeerAddr)
    -> impl Future<Output = Result<ConnId, CentralError>> + Send;

    /// Tear down a connection. Succeeds if the link is already gone.
    fn disconnect(&self, conn: ConnId) -> impl Future<Output = Result<(), CentralError>> + Send;

    /// Addresses of bonded peers, in bond-store order.
    fn bonded_peers(&self) -> impl Future<Output = Result<Vec<PeerAddr>, CentralError>> + Send;

    /// Discover the primary service `service` on `conn` and return its full
    /// attribute table in ascending handle order.
    fn discover(
        &self,
        conn: ConnId,
        service: Uuid,
    ) -> impl Future<Output = Result<Vec<GattAttribute>, CentralError>> + Send;

    /// Subscribe for notifications on `value_handle`, writing the CCC
    /// descriptor at `ccc_handle`.
    fn subscribe(
        &self,
        conn: ConnId,
        value_handle: u16,
        ccc_handle: u16,
    ) -> impl Future<Output = Result<(), CentralError>> + Send;

    /// Remove a notification subscription.
    fn unsubscribe(
        &self,
        conn: ConnId,
        value_handle: u16,
    ) -> impl Future<Output = Result<(), CentralError>> + Send;

    /// Read the attribute at `handle`.
    fn read(
        &self,
        conn: ConnId,
        handle: u16,
    ) -> impl Future<Output = Result<Vec<u8>, CentralError>> + Send;

    /// Fresh out-of-band pairing material for the local identity.
    fn local_oob(&self) -> impl Future<Output = Result<OobSecret, CentralError>> + Send;

    /// Commit out-of-band material to the security manager ahead of pairing.
    /// Called with the sides a [`PairingDecision`](crate::oob::PairingDecision)
    /// admitted.
    fn set_oob_pair(
        &self,
        local: Option<OobSecret>,
        remote: Option<OobSecret>,
    ) -> impl Future<Output = Result<(), CentralError>> + Send;
}
