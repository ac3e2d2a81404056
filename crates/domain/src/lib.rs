//! # gattbridge-domain
//!
//! Pure domain model for the gattbridge BLE bridge.
//!
//! ## Responsibilities
//! - Foundational types: peer addresses, typed cluster/attribute/endpoint ids
//! - Define **DeviceFilter** (how a bridged peripheral is found over the air)
//! - Define **AttributeMap** (which GATT characteristic feeds which data-model
//!   attribute, and whether it is read once or subscribed)
//! - Define **AttributePath** (the endpoint/cluster/attribute triple reported
//!   to the data-model server when a value changes)
//! - Define **OobSecret** (out-of-band pairing material and its line codec)
//! - Cluster and attribute constants shared by the bridge and its tests
//! - The bridge error taxonomy
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod addr;
pub mod cluster;
pub mod error;
pub mod filter;
pub mod mapping;
pub mod oob;
pub mod path;
