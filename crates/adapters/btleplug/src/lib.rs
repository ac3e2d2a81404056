//! # gattbridge-adapter-btleplug
//!
//! BLE central adapter backed by [btleplug](https://crates.io/crates/btleplug).
//!
//! ## Responsibilities
//!
//! - Drive scanning, connections, discovery, subscriptions, and reads on the
//!   first Bluetooth adapter of the host.
//! - Pump unsolicited stack activity (scan matches, link loss, notifications)
//!   into the bridge's central-event channel.
//! - Translate between btleplug's UUID-addressed GATT objects and the
//!   handle-addressed view the bridge works with, via a synthetic handle
//!   table built at discovery time.
//!
//! ## Limitations
//!
//! btleplug exposes neither the platform bond store nor the security
//! manager. Bonded peers are therefore seeded from configuration, and the
//! out-of-band pairing calls report unsupported; pairing itself is handled
//! by the platform agent.
//!
//! ## Dependency rule
//!
//! Depends on `gattbridge-app` (for the central port) and
//! `gattbridge-domain`. Nothing in the workspace depends on this crate
//! except the binary.

mod central;
mod error;

pub use central::BtleplugCentral;
