//! # gattbridge-app
//!
//! Application layer — the bridge state machines and **port definitions**
//! (traits).
//!
//! ## Responsibilities
//! - Define **port traits** that adapters must implement (driven/outbound
//!   ports):
//!   - `Central` — the BLE central: scan, connect, GATT, OOB material
//!   - `DataModelServer` — dynamic endpoint table and attribute-changed
//!     notifications
//! - Own the bridge state machines, confined to one loop task:
//!   - `ConnectivityManager` — connection slots and the scan singleton
//!   - `DeviceSession` — per-connection GATT bookkeeping
//!   - `Bridged` devices — cache, reachability, recovery
//!   - `Registry` — endpoint allocation and attribute routing
//!   - `OobExchange` — pairing-secret side channel
//! - Expose the loop behind `BridgeHandle`, a typed request API
//! - Provide **in-process infrastructure** (`InProcessDataModel`) that
//!   doesn't need IO
//!
//! ## Dependency rule
//! Depends on `gattbridge-domain` only (plus `tokio` for channels, timers
//! and the loop). Never imports adapter crates. Adapters depend on *this*
//! crate, not the reverse.

pub mod bridge;
pub mod connectivity;
pub mod data_model;
pub mod devices;
pub mod oob;
pub mod ports;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;
