//! Mapping from btleplug failures onto the central port's error type.

use gattbridge_app::ports::central::{CentralError, ConnId};

/// Map a backend failure that is not tied to a specific connection.
pub(crate) fn map_backend(err: btleplug::Error) -> CentralError {
    match err {
        btleplug::Error::TimedOut(_) => CentralError::Timeout,
        other => CentralError::Backend(other.to_string()),
    }
}

/// Map a failure from a GATT operation on `conn`.
///
/// btleplug reports a dead link as a bare `NotConnected`; tagging it with the
/// connection token lets the caller log which session it lost.
pub(crate) fn map_gatt(conn: ConnId, err: btleplug::Error) -> CentralError {
    match err {
        btleplug::Error::NotConnected => CentralError::NotConnected(conn),
        other => map_backend(other),
    }
}
