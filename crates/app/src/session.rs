//! Per-connection GATT session.
//!
//! A session lives exactly as long as its link: created when the peer
//! connects, dropped on disconnect. It holds the handle table produced by
//! primary-service discovery and the subscription bookkeeping, and knows
//! nothing about clusters — mapping values into the data model is the owning
//! device's job.
//!
//! Handle resolution runs on the bridge loop; the IO half
//! ([`read_value`]/[`execute_setup`]) takes only plain handles and the
//! central, so it can run in a spawned task without touching loop state.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::time::Duration;

use uuid::Uuid;

use gattbridge_domain::mapping::{AccessMode, AttributeMap};

use crate::ports::{Central, CentralError, ConnId, GattAttribute};

/// Client Characteristic Configuration descriptor.
pub const CCC_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);

/// Upper bound on a single GATT read payload.
pub const GATT_READ_BUF_LEN: usize = 24;

/// How long one GATT read may take before it is abandoned.
pub const GATT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// One live notification subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub characteristic: Uuid,
    pub value_handle: u16,
    pub ccc_handle: u16,
}

/// Resolved work for connection setup: reads to issue once, subscriptions
/// to install.
#[derive(Debug, Clone, Default)]
pub struct SetupPlan {
    pub reads: Vec<ReadRow>,
    pub subscribes: Vec<Subscription>,
}

/// One read-once entry with its resolved value handle.
#[derive(Debug, Clone, Copy)]
pub struct ReadRow {
    pub map: AttributeMap,
    pub handle: u16,
}

/// GATT state for one established connection.
#[derive(Debug)]
pub struct DeviceSession {
    conn: ConnId,
    handles: BTreeMap<u16, Uuid>,
    subscriptions: Vec<Subscription>,
    discovery: DiscoveryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscoveryState {
    Idle,
    InProgress,
    Done,
}

impl DeviceSession {
    #[must_use]
    pub fn new(conn: ConnId) -> Self {
        Self {
            conn,
            handles: BTreeMap::new(),
            subscriptions: Vec::new(),
            discovery: DiscoveryState::Idle,
        }
    }

    #[must_use]
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// Claim the single discovery this session allows.
    ///
    /// Returns `false` when discovery already ran or is in flight; callers
    /// must not issue a second one.
    pub fn begin_discovery(&mut self) -> bool {
        if self.discovery == DiscoveryState::Idle {
            self.discovery = DiscoveryState::InProgress;
            true
        } else {
            false
        }
    }

    /// Install the attribute table from a completed discovery.
    pub fn install(&mut self, attrs: &[GattAttribute]) {
        self.discovery = DiscoveryState::Done;
        self.handles = attrs.iter().map(|a| (a.handle, a.uuid)).collect();
    }

    /// Value handle for a characteristic UUID.
    #[must_use]
    pub fn find_handle(&self, characteristic: Uuid) -> Option<u16> {
        self.handles
            .iter()
            .find(|(_, uuid)| **uuid == characteristic)
            .map(|(handle, _)| *handle)
    }

    /// First CCC descriptor at a handle strictly after `value_handle`.
    ///
    /// The scan is an ordered forward walk of the handle table, the way the
    /// descriptor follows its characteristic on the wire. A characteristic
    /// without a CCC resolves to the next characteristic's descriptor, so
    /// [`plan_setup`](Self::plan_setup) only subscribes to characteristics
    /// that advertise notify support in their mapping.
    #[must_use]
    pub fn find_next_ccc_handle(&self, value_handle: u16) -> Option<u16> {
        self.handles
            .range((Excluded(value_handle), Unbounded))
            .find(|(_, uuid)| **uuid == CCC_UUID)
            .map(|(handle, _)| *handle)
    }

    /// Resolve the mapping into concrete handles.
    ///
    /// Entries whose characteristic or CCC descriptor is absent from the
    /// discovered table are skipped with a warning; a subscription is only
    /// planned when both handles resolved non-zero. Planned subscriptions
    /// are recorded on the session for notification routing.
    pub fn plan_setup(&mut self, mapping: &[AttributeMap]) -> SetupPlan {
        let mut plan = SetupPlan::default();
        for map in mapping {
            let Some(value_handle) = self.find_handle(map.characteristic) else {
                tracing::warn!(
                    characteristic = %map.characteristic,
                    "characteristic not present in discovered service, skipping"
                );
                continue;
            };
            match map.access {
                AccessMode::ReadOnce => plan.reads.push(ReadRow {
                    map: *map,
                    handle: value_handle,
                }),
                AccessMode::Subscribe => {
                    let Some(ccc_handle) = self.find_next_ccc_handle(value_handle) else {
                        tracing::warn!(
                            characteristic = %map.characteristic,
                            "no CCC descriptor after value handle, cannot subscribe"
                        );
                        continue;
                    };
                    if value_handle == 0 || ccc_handle == 0 {
                        tracing::warn!(
                            characteristic = %map.characteristic,
                            "subscription parameters incomplete, skipping"
                        );
                        continue;
                    }
                    let sub = Subscription {
                        characteristic: map.characteristic,
                        value_handle,
                        ccc_handle,
                    };
                    self.subscriptions.push(sub);
                    plan.subscribes.push(sub);
                }
            }
        }
        plan
    }

    /// Characteristic a notification on `handle` belongs to, if subscribed.
    ///
    /// Bonded peers can keep notifying across reconnects before the new
    /// subscription is installed; unknown handles are the caller's cue to
    /// drop the payload.
    #[must_use]
    pub fn subscribed_characteristic(&self, handle: u16) -> Option<Uuid> {
        self.subscriptions
            .iter()
            .find(|sub| sub.value_handle == handle)
            .map(|sub| sub.characteristic)
    }

    /// Remove the subscription for `characteristic`, returning it so the
    /// caller can issue exactly one unsubscribe against the central.
    pub fn take_subscription(&mut self, characteristic: Uuid) -> Option<Subscription> {
        let pos = self
            .subscriptions
            .iter()
            .position(|sub| sub.characteristic == characteristic)?;
        Some(self.subscriptions.remove(pos))
    }
}

/// Why connection setup was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    /// A read-once characteristic could not be read.
    #[error("reading {characteristic} failed: {cause}")]
    Read {
        characteristic: Uuid,
        #[source]
        cause: CentralError,
    },
    /// A read returned a payload the cache cannot hold.
    #[error("value of {characteristic} is {len} bytes, expected 2")]
    ValueLength { characteristic: Uuid, len: usize },
}

/// Single GATT read bounded by [`GATT_READ_TIMEOUT`] and `max_len`.
///
/// # Errors
///
/// [`CentralError::Timeout`] when the deadline passes, or
/// [`CentralError::Backend`] when the payload exceeds `max_len`.
pub async fn read_value<C: Central>(
    central: &C,
    conn: ConnId,
    handle: u16,
    max_len: usize,
) -> Result<Vec<u8>, CentralError> {
    let bytes = tokio::time::timeout(GATT_READ_TIMEOUT, central.read(conn, handle))
        .await
        .map_err(|_| CentralError::Timeout)??;
    if bytes.len() > max_len {
        return Err(CentralError::Backend(format!(
            "read returned {} bytes, cap is {max_len}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Execute a [`SetupPlan`]: issue every read, then install every
/// subscription.
///
/// A failed or mis-sized read abandons setup (the owner disconnects and
/// retries through recovery); a failed subscribe is logged and skipped.
///
/// # Errors
///
/// See [`SetupError`].
pub async fn execute_setup<C: Central>(
    central: &C,
    conn: ConnId,
    plan: &SetupPlan,
) -> Result<Vec<(AttributeMap, u16)>, SetupError> {
    let mut values = Vec::with_capacity(plan.reads.len());
    for row in &plan.reads {
        let bytes = read_value(central, conn, row.handle, GATT_READ_BUF_LEN)
            .await
            .map_err(|cause| SetupError::Read {
                characteristic: row.map.characteristic,
                cause,
            })?;
        let Ok(raw) = <[u8; 2]>::try_from(bytes.as_slice()) else {
            return Err(SetupError::ValueLength {
                characteristic: row.map.characteristic,
                len: bytes.len(),
            });
        };
        values.push((row.map, u16::from_le_bytes(raw)));
    }
    for sub in &plan.subscribes {
        if let Err(err) = central
            .subscribe(conn, sub.value_handle, sub.ccc_handle)
            .await
        {
            tracing::warn!(
                characteristic = %sub.characteristic,
                error = %err,
                "subscribe failed, continuing without notifications"
            );
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Call, ScriptedCentral};
    use gattbridge_domain::cluster::{ATTR_CURRENT_LEVEL, CLUSTER_LEVEL_CONTROL};

    fn char_uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn table(rows: &[(u16, Uuid)]) -> Vec<GattAttribute> {
        rows.iter()
            .map(|(handle, uuid)| GattAttribute {
                handle: *handle,
                uuid: *uuid,
            })
            .collect()
    }

    fn subscribe_map(characteristic: Uuid) -> AttributeMap {
        AttributeMap {
            characteristic,
            cluster: CLUSTER_LEVEL_CONTROL,
            attribute: ATTR_CURRENT_LEVEL,
            access: AccessMode::Subscribe,
        }
    }

    // ── handle map ──────────────────────────────────────────────────────

    #[test]
    fn should_find_value_handle_by_characteristic_uuid() {
        let mut session = DeviceSession::new(ConnId::new(1));
        let wanted = char_uuid(0xA);
        session.install(&table(&[(3, char_uuid(0x1)), (5, wanted), (6, CCC_UUID)]));

        assert_eq!(session.find_handle(wanted), Some(5));
        assert_eq!(session.find_handle(char_uuid(0xFF)), None);
    }

    #[test]
    fn should_find_first_ccc_strictly_after_value_handle() {
        let mut session = DeviceSession::new(ConnId::new(1));
        session.install(&table(&[
            (5, char_uuid(0xA)),
            (6, CCC_UUID),
            (8, char_uuid(0xB)),
            (9, CCC_UUID),
        ]));

        assert_eq!(session.find_next_ccc_handle(5), Some(6));
        assert_eq!(session.find_next_ccc_handle(8), Some(9));
        // strictly after: the descriptor at the probe handle itself is skipped
        assert_eq!(session.find_next_ccc_handle(9), None);
    }

    #[test]
    fn should_resolve_across_gap_when_characteristic_has_no_own_ccc() {
        let mut session = DeviceSession::new(ConnId::new(1));
        // 0xA has no descriptor of its own; the forward scan lands on 0xB's
        session.install(&table(&[
            (5, char_uuid(0xA)),
            (8, char_uuid(0xB)),
            (9, CCC_UUID),
        ]));
        assert_eq!(session.find_next_ccc_handle(5), Some(9));
    }

    // ── discovery gate ─────────────────────────────────────────────────

    #[test]
    fn should_allow_exactly_one_discovery_per_session() {
        let mut session = DeviceSession::new(ConnId::new(1));
        assert!(session.begin_discovery());
        assert!(!session.begin_discovery());
        session.install(&table(&[]));
        assert!(!session.begin_discovery());
    }

    // ── planning ───────────────────────────────────────────────────────

    #[test]
    fn should_plan_reads_and_subscriptions_from_mapping() {
        let mut session = DeviceSession::new(ConnId::new(1));
        let read_char = char_uuid(0xA);
        let sub_char = char_uuid(0xB);
        session.install(&table(&[
            (5, read_char),
            (8, sub_char),
            (9, CCC_UUID),
        ]));

        let mapping = [
            AttributeMap {
                access: AccessMode::ReadOnce,
                ..subscribe_map(read_char)
            },
            subscribe_map(sub_char),
        ];
        let plan = session.plan_setup(&mapping);

        assert_eq!(plan.reads.len(), 1);
        assert_eq!(plan.reads[0].handle, 5);
        assert_eq!(plan.subscribes.len(), 1);
        assert_eq!(plan.subscribes[0].value_handle, 8);
        assert_eq!(plan.subscribes[0].ccc_handle, 9);
        assert_eq!(session.subscribed_characteristic(8), Some(sub_char));
    }

    #[test]
    fn should_skip_entries_whose_characteristic_was_not_discovered() {
        let mut session = DeviceSession::new(ConnId::new(1));
        session.install(&table(&[(5, char_uuid(0xA)), (6, CCC_UUID)]));

        let plan = session.plan_setup(&[subscribe_map(char_uuid(0xFF))]);
        assert!(plan.reads.is_empty());
        assert!(plan.subscribes.is_empty());
    }

    #[test]
    fn should_skip_subscription_without_ccc_descriptor() {
        let mut session = DeviceSession::new(ConnId::new(1));
        session.install(&table(&[(5, char_uuid(0xA))]));

        let plan = session.plan_setup(&[subscribe_map(char_uuid(0xA))]);
        assert!(plan.subscribes.is_empty());
        assert_eq!(session.subscribed_characteristic(5), None);
    }

    // ── setup execution ────────────────────────────────────────────────

    #[tokio::test]
    async fn should_skip_failed_subscribe_and_finish_setup() {
        let mut session = DeviceSession::new(ConnId::new(1));
        let read_char = char_uuid(0xA);
        let sub_char = char_uuid(0xB);
        session.install(&table(&[(3, read_char), (5, sub_char), (6, CCC_UUID)]));
        let mapping = [
            AttributeMap {
                access: AccessMode::ReadOnce,
                ..subscribe_map(read_char)
            },
            subscribe_map(sub_char),
        ];
        let plan = session.plan_setup(&mapping);

        let central = ScriptedCentral::new();
        central.script_read(3, Ok(vec![0x64, 0x00]));
        central.script_subscribe_error(5, CentralError::Backend("CCC write rejected".into()));

        let values = execute_setup(&central, ConnId::new(1), &plan)
            .await
            .expect("a failed subscribe must not abandon setup");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].1, 0x0064);
        // the subscribe was attempted and its failure swallowed
        assert!(central.calls().contains(&Call::Subscribe {
            conn: ConnId::new(1),
            value: 5,
            ccc: 6,
        }));
    }

    #[tokio::test]
    async fn should_abandon_setup_when_a_read_is_not_a_16_bit_value() {
        let mut session = DeviceSession::new(ConnId::new(1));
        let read_char = char_uuid(0xA);
        session.install(&table(&[(3, read_char)]));
        let mapping = [AttributeMap {
            access: AccessMode::ReadOnce,
            ..subscribe_map(read_char)
        }];
        let plan = session.plan_setup(&mapping);

        let central = ScriptedCentral::new();
        central.script_read(3, Ok(vec![1, 2, 3, 4]));

        let err = execute_setup(&central, ConnId::new(1), &plan)
            .await
            .expect_err("an oversized value must abandon setup");
        assert_eq!(
            err,
            SetupError::ValueLength {
                characteristic: read_char,
                len: 4,
            }
        );
    }

    // ── subscription bookkeeping ───────────────────────────────────────

    #[test]
    fn should_take_subscription_exactly_once() {
        let mut session = DeviceSession::new(ConnId::new(1));
        let sub_char = char_uuid(0xB);
        session.install(&table(&[(8, sub_char), (9, CCC_UUID)]));
        session.plan_setup(&[subscribe_map(sub_char)]);

        let taken = session.take_subscription(sub_char).unwrap();
        assert_eq!(taken.value_handle, 8);
        assert!(session.take_subscription(sub_char).is_none());
        assert_eq!(session.subscribed_characteristic(8), None);
    }
}
