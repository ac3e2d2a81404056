//! JSON REST handlers for bridge inspection.

use std::str::FromStr;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use gattbridge_app::ports::data_model::DataModelServer;
use gattbridge_app::registry::EndpointSnapshot;
use gattbridge_domain::cluster::{AttributeId, ClusterId, EndpointId};
use gattbridge_domain::error::BridgeError;

use crate::error::ApiError;
use crate::state::AppState;

/// Byte cap for one attribute read; covers the longest served value
/// (the node label plus its length prefix) with room to spare.
const MAX_READ_LEN: usize = 64;

/// Build the `/api` sub-router.
pub fn routes<S: DataModelServer>() -> Router<AppState<S>> {
    Router::new()
        .route("/endpoints", get(list_endpoints::<S>))
        .route(
            "/endpoints/{endpoint}/clusters/{cluster}/attributes/{attribute}",
            get(read_attribute::<S>),
        )
}

/// Response body for one attribute read.
#[derive(Debug, Serialize)]
pub struct AttributeReadBody {
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub attribute: AttributeId,
    /// Raw value bytes, lowercase hex.
    pub value: String,
    /// Little-endian decoding, present for 2-byte values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoded: Option<u16>,
}

/// `GET /api/endpoints`
///
/// # Errors
///
/// [`ApiError`] when the bridge loop is gone.
pub async fn list_endpoints<S: DataModelServer>(
    State(state): State<AppState<S>>,
) -> Result<Json<Vec<EndpointSnapshot>>, ApiError> {
    let snapshots = state.bridge.endpoints().await?;
    Ok(Json(snapshots))
}

/// `GET /api/endpoints/{endpoint}/clusters/{cluster}/attributes/{attribute}`
///
/// Ids accept decimal or `0x`-prefixed hex. The endpoint id is resolved to
/// its dynamic slot through the data model, then read through the bridge.
///
/// # Errors
///
/// `404` for unknown endpoints or attributes, `409` while the device is
/// unreachable, `400` for malformed ids.
pub async fn read_attribute<S: DataModelServer>(
    State(state): State<AppState<S>>,
    Path((endpoint, cluster, attribute)): Path<(String, String, String)>,
) -> Result<Json<AttributeReadBody>, ApiError> {
    let endpoint: EndpointId = parse_id("endpoint", &endpoint)?;
    let cluster: ClusterId = parse_id("cluster", &cluster)?;
    let attribute: AttributeId = parse_id("attribute", &attribute)?;

    let index = state
        .server
        .index_of(endpoint)
        .ok_or(BridgeError::UnknownDevice(endpoint))?;
    let value = state
        .bridge
        .read_attribute(index, cluster, attribute, MAX_READ_LEN)
        .await?;

    let decoded = match value.as_slice() {
        [low, high] => Some(u16::from_le_bytes([*low, *high])),
        _ => None,
    };
    Ok(Json(AttributeReadBody {
        endpoint,
        cluster,
        attribute,
        value: hex(&value),
        decoded,
    }))
}

fn parse_id<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ApiError> {
    raw.parse().map_err(|_| ApiError::BadParam {
        name,
        value: raw.to_string(),
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_ids_in_decimal_and_hex() {
        assert_eq!(
            parse_id::<ClusterId>("cluster", "8").ok(),
            Some(ClusterId::new(8))
        );
        assert_eq!(
            parse_id::<ClusterId>("cluster", "0x0039").ok(),
            Some(ClusterId::new(0x0039))
        );
        assert!(parse_id::<ClusterId>("cluster", "banana").is_err());
    }

    #[test]
    fn should_render_bytes_as_lowercase_hex() {
        assert_eq!(hex(&[0x32, 0x00]), "3200");
        assert_eq!(hex(&[0xAB]), "ab");
        assert_eq!(hex(&[]), "");
    }
}
