//! Bridged device abstraction.
//!
//! A bridged device is one logical endpoint on the data-model server. Two
//! variants exist: [`peripheral::PeripheralDevice`] mirrors a BLE peripheral
//! through a GATT session, [`computed::ComputedDevice`] derives its value
//! locally without a radio. Both share [`DeviceBase`]: the display name, the
//! endpoint identity, the reachability flag and the attribute cache.
//!
//! Device state changes never talk to the server directly. Mutating calls
//! return [`Change`] markers and the registry turns them into
//! attribute-changed notifications, so the single-consumer rule holds.

pub mod computed;
pub mod peripheral;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use gattbridge_domain::cluster::{
    ATTR_CLUSTER_REVISION, ATTR_FEATURE_MAP, ATTR_NODE_LABEL, ATTR_REACHABLE, AttributeId,
    BASIC_INFORMATION_CLUSTER_REVISION, CLUSTER_BASIC_INFORMATION, CLUSTER_DESCRIPTOR,
    CLUSTER_REVISION, ClusterId, EndpointId, EndpointIndex, FEATURE_MAP, NODE_LABEL_CAPACITY,
};
use gattbridge_domain::error::BridgeError;
use gattbridge_domain::filter::DeviceFilter;
use gattbridge_domain::mapping::AttributeMap;

use crate::bridge::{BridgeConfig, BridgeEvent};
use crate::connectivity::ConnectivityManager;

pub use computed::{ComputedDevice, DeadlineLevelSource, ValueSource};
pub use peripheral::PeripheralDevice;

/// An attribute whose value just changed, to be reported upstream.
pub type Change = (ClusterId, AttributeId);

/// Everything a device lifecycle hook may reach for. Borrowed from the
/// bridge loop for the duration of one event, never stored.
pub struct DeviceCtx<'a, C> {
    pub central: &'a Arc<C>,
    pub connectivity: &'a mut ConnectivityManager<C>,
    pub events: &'a mpsc::UnboundedSender<BridgeEvent>,
    pub config: &'a BridgeConfig,
}

/// Clusters served from bridge-local state, available even while the
/// backing peripheral is away.
#[must_use]
pub fn is_generic_cluster(cluster: ClusterId) -> bool {
    cluster == CLUSTER_BASIC_INFORMATION || cluster == CLUSTER_DESCRIPTOR
}

// ── configuration ──────────────────────────────────────────────────────

fn default_refresh_secs() -> u64 {
    60
}

/// Static per-device configuration, consumed once at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSpec {
    /// Backed by a BLE peripheral exposing `service`.
    Peripheral {
        name: String,
        service: Uuid,
        /// Admission filter; defaults to scanning for `service`.
        #[serde(default)]
        filter: Option<DeviceFilter>,
        mapping: Vec<AttributeMap>,
    },
    /// Derived locally from a deadline list, no radio involved.
    Computed {
        name: String,
        cluster: ClusterId,
        attribute: AttributeId,
        #[serde(default = "default_refresh_secs")]
        refresh_secs: u64,
        /// RFC 3339 timestamps; the soonest future one drives the level.
        #[serde(default)]
        deadlines: Vec<DateTime<Utc>>,
    },
}

impl DeviceSpec {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Peripheral { name, .. } | Self::Computed { name, .. } => name,
        }
    }

    /// Checks the display name fits the node-label attribute.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidName`] when empty or over
    /// [`NODE_LABEL_CAPACITY`] bytes.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let name = self.name();
        if name.is_empty() || name.len() > NODE_LABEL_CAPACITY {
            return Err(BridgeError::InvalidName(name.to_owned()));
        }
        Ok(())
    }
}

// ── shared device state ────────────────────────────────────────────────

/// State common to both device variants.
#[derive(Debug)]
pub struct DeviceBase {
    name: String,
    endpoint: EndpointId,
    index: EndpointIndex,
    reachable: bool,
    cache: BTreeMap<(ClusterId, AttributeId), u16>,
}

impl DeviceBase {
    #[must_use]
    pub fn new(name: String, endpoint: EndpointId, index: EndpointIndex) -> Self {
        Self {
            name,
            endpoint,
            index,
            reachable: false,
            cache: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    #[must_use]
    pub fn index(&self) -> EndpointIndex {
        self.index
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Flip reachability; reports a change only on an actual transition.
    pub fn set_reachable(&mut self, reachable: bool) -> Option<Change> {
        if self.reachable == reachable {
            return None;
        }
        self.reachable = reachable;
        tracing::info!(
            endpoint = %self.endpoint,
            name = %self.name,
            reachable,
            "reachability changed"
        );
        Some((CLUSTER_BASIC_INFORMATION, ATTR_REACHABLE))
    }

    #[must_use]
    pub fn cached(&self, cluster: ClusterId, attribute: AttributeId) -> Option<u16> {
        self.cache.get(&(cluster, attribute)).copied()
    }

    pub fn cache_store(
        &mut self,
        cluster: ClusterId,
        attribute: AttributeId,
        value: u16,
    ) -> Change {
        self.cache.insert((cluster, attribute), value);
        (cluster, attribute)
    }

    /// Serves the generic Bridged Device Basic Information attributes from
    /// local state.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnsupportedAttribute`] for attributes this cluster
    /// does not model, [`BridgeError::BufferTooSmall`] when the value does
    /// not fit `max_len`.
    pub fn read_basic_information(
        &self,
        attribute: AttributeId,
        max_len: usize,
    ) -> Result<Vec<u8>, BridgeError> {
        let bytes = match attribute {
            ATTR_NODE_LABEL => {
                // short character string: one length byte then the text
                let len = u8::try_from(self.name.len()).unwrap_or(u8::MAX);
                let mut out = Vec::with_capacity(1 + self.name.len());
                out.push(len);
                out.extend_from_slice(self.name.as_bytes());
                out
            }
            ATTR_REACHABLE => vec![u8::from(self.reachable)],
            ATTR_CLUSTER_REVISION => BASIC_INFORMATION_CLUSTER_REVISION.to_le_bytes().to_vec(),
            ATTR_FEATURE_MAP => FEATURE_MAP.to_le_bytes().to_vec(),
            other => {
                return Err(BridgeError::UnsupportedAttribute {
                    cluster: CLUSTER_BASIC_INFORMATION,
                    attribute: other,
                });
            }
        };
        fit(bytes, max_len)
    }

    /// Serves the fixed Descriptor cluster constants.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::read_basic_information`].
    pub fn read_descriptor(attribute: AttributeId, max_len: usize) -> Result<Vec<u8>, BridgeError> {
        let bytes = match attribute {
            ATTR_CLUSTER_REVISION => CLUSTER_REVISION.to_le_bytes().to_vec(),
            ATTR_FEATURE_MAP => FEATURE_MAP.to_le_bytes().to_vec(),
            other => {
                return Err(BridgeError::UnsupportedAttribute {
                    cluster: CLUSTER_DESCRIPTOR,
                    attribute: other,
                });
            }
        };
        fit(bytes, max_len)
    }
}

fn fit(bytes: Vec<u8>, max_len: usize) -> Result<Vec<u8>, BridgeError> {
    if bytes.len() > max_len {
        return Err(BridgeError::BufferTooSmall {
            needed: bytes.len(),
            max: max_len,
        });
    }
    Ok(bytes)
}

/// Constants shared by every modeled (non-generic) cluster. `None` means
/// the attribute is not a fixed constant and the cache decides.
fn read_modeled_constant(
    attribute: AttributeId,
    max_len: usize,
) -> Option<Result<Vec<u8>, BridgeError>> {
    let bytes = match attribute {
        ATTR_CLUSTER_REVISION => CLUSTER_REVISION.to_le_bytes().to_vec(),
        ATTR_FEATURE_MAP => FEATURE_MAP.to_le_bytes().to_vec(),
        _ => return None,
    };
    Some(fit(bytes, max_len))
}

// ── the variant dispatch ───────────────────────────────────────────────

/// One registered bridged device.
pub enum Bridged {
    Peripheral(PeripheralDevice),
    Computed(ComputedDevice),
}

impl Bridged {
    /// Builds a device from its validated spec and assigned identity.
    #[must_use]
    pub fn build(spec: DeviceSpec, endpoint: EndpointId, index: EndpointIndex) -> Self {
        match spec {
            DeviceSpec::Peripheral {
                name,
                service,
                filter,
                mapping,
            } => {
                let filter = filter.unwrap_or(DeviceFilter::ServiceUuid(service));
                Self::Peripheral(PeripheralDevice::new(
                    DeviceBase::new(name, endpoint, index),
                    service,
                    filter,
                    mapping,
                ))
            }
            DeviceSpec::Computed {
                name,
                cluster,
                attribute,
                refresh_secs,
                deadlines,
            } => Self::Computed(ComputedDevice::new(
                DeviceBase::new(name, endpoint, index),
                cluster,
                attribute,
                Duration::from_secs(refresh_secs),
                Box::new(DeadlineLevelSource::new(deadlines)),
            )),
        }
    }

    fn base(&self) -> &DeviceBase {
        match self {
            Self::Peripheral(d) => d.base(),
            Self::Computed(d) => d.base(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.base().name()
    }

    #[must_use]
    pub fn endpoint(&self) -> EndpointId {
        self.base().endpoint()
    }

    #[must_use]
    pub fn index(&self) -> EndpointIndex {
        self.base().index()
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.base().is_reachable()
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Peripheral(_) => "peripheral",
            Self::Computed(_) => "computed",
        }
    }

    /// Routes one attribute read to the owning variant.
    ///
    /// # Errors
    ///
    /// See [`BridgeError`]; the caller maps these onto the server's
    /// read-failure contract.
    pub fn handle_read(
        &self,
        cluster: ClusterId,
        attribute: AttributeId,
        max_len: usize,
    ) -> Result<Vec<u8>, BridgeError> {
        match cluster {
            CLUSTER_BASIC_INFORMATION => self.base().read_basic_information(attribute, max_len),
            CLUSTER_DESCRIPTOR => DeviceBase::read_descriptor(attribute, max_len),
            _ => match self {
                Self::Peripheral(d) => d.read_mapped(cluster, attribute, max_len),
                Self::Computed(d) => d.read_mapped(cluster, attribute, max_len),
            },
        }
    }

    /// Control writes are not forwarded to peripherals in this version.
    ///
    /// # Errors
    ///
    /// Always [`BridgeError::UnsupportedWrite`].
    pub fn handle_write(
        &mut self,
        cluster: ClusterId,
        attribute: AttributeId,
        value: &[u8],
    ) -> Result<(), BridgeError> {
        tracing::debug!(
            endpoint = %self.endpoint(),
            %cluster,
            %attribute,
            len = value.len(),
            "rejecting attribute write"
        );
        Err(BridgeError::UnsupportedWrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattbridge_domain::cluster::CLUSTER_LEVEL_CONTROL;

    fn base() -> DeviceBase {
        DeviceBase::new("Posture sensor".into(), EndpointId::new(3), EndpointIndex::new(0))
    }

    #[test]
    fn should_flag_reachability_change_only_on_transition() {
        let mut base = base();
        assert_eq!(
            base.set_reachable(true),
            Some((CLUSTER_BASIC_INFORMATION, ATTR_REACHABLE))
        );
        assert_eq!(base.set_reachable(true), None);
        assert!(base.is_reachable());
    }

    #[test]
    fn should_serve_name_as_length_prefixed_string() {
        let base = base();
        let bytes = base
            .read_basic_information(ATTR_NODE_LABEL, 33)
            .expect("node label");
        assert_eq!(usize::from(bytes[0]), "Posture sensor".len());
        assert_eq!(&bytes[1..], "Posture sensor".as_bytes());
    }

    #[test]
    fn should_reject_oversized_reads() {
        let base = base();
        let err = base
            .read_basic_information(ATTR_NODE_LABEL, 4)
            .expect_err("must not fit");
        assert_eq!(
            err,
            BridgeError::BufferTooSmall {
                needed: 1 + "Posture sensor".len(),
                max: 4
            }
        );
    }

    #[test]
    fn should_serve_reachability_and_constants() {
        let mut base = base();
        base.set_reachable(true);
        assert_eq!(base.read_basic_information(ATTR_REACHABLE, 1), Ok(vec![1]));
        assert_eq!(
            base.read_basic_information(ATTR_CLUSTER_REVISION, 2),
            Ok(vec![1, 0])
        );
        assert_eq!(
            DeviceBase::read_descriptor(ATTR_FEATURE_MAP, 4),
            Ok(vec![0, 0, 0, 0])
        );
    }

    #[test]
    fn should_reject_unknown_generic_attribute() {
        let err = DeviceBase::read_descriptor(AttributeId::new(0x0BAD), 8).expect_err("unknown");
        assert_eq!(
            err,
            BridgeError::UnsupportedAttribute {
                cluster: CLUSTER_DESCRIPTOR,
                attribute: AttributeId::new(0x0BAD)
            }
        );
    }

    #[test]
    fn should_validate_display_names() {
        let spec = DeviceSpec::Computed {
            name: String::new(),
            cluster: CLUSTER_LEVEL_CONTROL,
            attribute: gattbridge_domain::cluster::ATTR_CURRENT_LEVEL,
            refresh_secs: 60,
            deadlines: Vec::new(),
        };
        assert_eq!(spec.validate(), Err(BridgeError::InvalidName(String::new())));

        let long = "x".repeat(NODE_LABEL_CAPACITY + 1);
        let spec = DeviceSpec::Computed {
            name: long.clone(),
            cluster: CLUSTER_LEVEL_CONTROL,
            attribute: gattbridge_domain::cluster::ATTR_CURRENT_LEVEL,
            refresh_secs: 60,
            deadlines: Vec::new(),
        };
        assert_eq!(spec.validate(), Err(BridgeError::InvalidName(long)));
    }

    #[test]
    fn should_deserialize_a_peripheral_spec() {
        let spec: DeviceSpec = serde_json::from_value(serde_json::json!({
            "kind": "peripheral",
            "name": "Posture sensor",
            "service": "e5130001-784f-44f3-9e27-ab09a4153139",
            "mapping": [{
                "characteristic": "e5130003-784f-44f3-9e27-ab09a4153139",
                "cluster": 8,
                "attribute": 0,
                "access": "subscribe"
            }]
        }))
        .expect("peripheral spec");
        assert_eq!(spec.name(), "Posture sensor");
        assert!(spec.validate().is_ok());
    }
}
