//! HTTP error response mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use gattbridge_domain::error::BridgeError;

/// JSON error body returned by API endpoints.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Maps failures to an HTTP response with the appropriate status code.
pub enum ApiError {
    /// Routing or device failure reported by the bridge.
    Bridge(BridgeError),
    /// A path parameter did not parse.
    BadParam {
        /// Which parameter was malformed.
        name: &'static str,
        /// The raw value received.
        value: String,
    },
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self::Bridge(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Bridge(err) => (bridge_status(&err), err.to_string()),
            Self::BadParam { name, value } => {
                (StatusCode::BAD_REQUEST, format!("invalid {name} {value:?}"))
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %message, "request failed with an internal error");
        }
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

/// Status code for each bridge failure on the read-only surface.
fn bridge_status(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::UnknownEndpoint(_)
        | BridgeError::UnknownDevice(_)
        | BridgeError::UnsupportedAttribute { .. }
        | BridgeError::AttributeMissing { .. } => StatusCode::NOT_FOUND,
        BridgeError::DeviceUnreachable(_)
        | BridgeError::DuplicateDevice(_)
        | BridgeError::NoFreeEndpoint => StatusCode::CONFLICT,
        BridgeError::UnsupportedWrite => StatusCode::METHOD_NOT_ALLOWED,
        BridgeError::InvalidName(_) => StatusCode::BAD_REQUEST,
        BridgeError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::BufferTooSmall { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
