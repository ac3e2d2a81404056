//! Port definitions — traits that adapters implement.
//!
//! Ports are the boundaries between the application core and the outside world.
//! They are defined here (in `app`) so that both the use-case layer and the
//! adapter layer can depend on them without creating circular dependencies.

pub mod central;
pub mod data_model;

pub use central::{Central, CentralError, CentralEvent, ConnId, GattAttribute, OobSide};
pub use data_model::DataModelServer;
